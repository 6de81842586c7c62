use std::io::Write;

use crate::error::Error;
use crate::tuple::ToTupleBuffer;

use super::codec::{self, IProtoType, IteratorType};

/// One request kind: its wire type code and its body map.
///
/// Framing, the header map and sync assignment are handled by
/// [`RequestEncoder`](super::encoder::RequestEncoder).
pub trait Request {
    const TYPE: IProtoType;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error>;
}

pub struct Ping;

impl Request for Ping {
    const TYPE: IProtoType = IProtoType::Ping;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_ping(out)
    }
}

pub struct Insert<'a, T: ?Sized> {
    pub space_id: u32,
    pub tuple: &'a T,
}

impl<'a, T: ToTupleBuffer + ?Sized> Request for Insert<'a, T> {
    const TYPE: IProtoType = IProtoType::Insert;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_insert(out, self.space_id, self.tuple)
    }
}

pub struct Replace<'a, T: ?Sized> {
    pub space_id: u32,
    pub tuple: &'a T,
}

impl<'a, T: ToTupleBuffer + ?Sized> Request for Replace<'a, T> {
    const TYPE: IProtoType = IProtoType::Replace;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_replace(out, self.space_id, self.tuple)
    }
}

pub struct Delete<'a, K: ?Sized> {
    pub space_id: u32,
    pub index_id: u32,
    pub key: &'a K,
}

impl<'a, K: ToTupleBuffer + ?Sized> Request for Delete<'a, K> {
    const TYPE: IProtoType = IProtoType::Delete;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_delete(out, self.space_id, self.index_id, self.key)
    }
}

pub struct Update<'a, K: ?Sized, Op: ?Sized> {
    pub space_id: u32,
    pub index_id: u32,
    pub key: &'a K,
    pub ops: &'a Op,
}

impl<'a, K, Op> Request for Update<'a, K, Op>
where
    K: ToTupleBuffer + ?Sized,
    Op: ToTupleBuffer + ?Sized,
{
    const TYPE: IProtoType = IProtoType::Update;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_update(out, self.space_id, self.index_id, self.key, self.ops)
    }
}

pub struct Upsert<'a, T: ?Sized, Op: ?Sized> {
    pub space_id: u32,
    pub index_base: u32,
    pub tuple: &'a T,
    pub ops: &'a Op,
}

impl<'a, T, Op> Request for Upsert<'a, T, Op>
where
    T: ToTupleBuffer + ?Sized,
    Op: ToTupleBuffer + ?Sized,
{
    const TYPE: IProtoType = IProtoType::Upsert;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_upsert(out, self.space_id, self.index_base, self.tuple, self.ops)
    }
}

pub struct Select<'a, K: ?Sized> {
    pub space_id: u32,
    pub index_id: u32,
    pub limit: u32,
    pub offset: u32,
    pub iterator_type: IteratorType,
    pub key: &'a K,
}

impl<'a, K: ToTupleBuffer + ?Sized> Request for Select<'a, K> {
    const TYPE: IProtoType = IProtoType::Select;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_select(
            out,
            self.space_id,
            self.index_id,
            self.limit,
            self.offset,
            self.iterator_type,
            self.key,
        )
    }
}

pub struct Call<'a, A: ?Sized> {
    pub fn_name: &'a str,
    /// Encoded as a msgpack array of call arguments.
    pub args: &'a A,
}

impl<'a, A: ToTupleBuffer + ?Sized> Request for Call<'a, A> {
    const TYPE: IProtoType = IProtoType::Call;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_call(out, self.fn_name, self.args)
    }
}

pub struct Eval<'a, A: ?Sized> {
    pub expr: &'a str,
    pub args: &'a A,
}

impl<'a, A: ToTupleBuffer + ?Sized> Request for Eval<'a, A> {
    const TYPE: IProtoType = IProtoType::Eval;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_eval(out, self.expr, self.args)
    }
}

/// SQL by statement text.
pub struct Execute<'a, P: ?Sized> {
    pub sql: &'a str,
    pub bind_params: &'a P,
}

impl<'a, P: ToTupleBuffer + ?Sized> Request for Execute<'a, P> {
    const TYPE: IProtoType = IProtoType::Execute;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_execute(out, self.sql, self.bind_params)
    }
}

/// SQL by a statement id returned from [`Prepare`].
pub struct ExecuteStatement<'a, P: ?Sized> {
    pub stmt_id: u32,
    pub bind_params: &'a P,
}

impl<'a, P: ToTupleBuffer + ?Sized> Request for ExecuteStatement<'a, P> {
    const TYPE: IProtoType = IProtoType::Execute;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_execute_stmt(out, self.stmt_id, self.bind_params)
    }
}

pub struct Prepare<'a> {
    pub sql: &'a str,
}

impl<'a> Request for Prepare<'a> {
    const TYPE: IProtoType = IProtoType::Prepare;

    fn encode_body(&self, out: &mut impl Write) -> Result<(), Error> {
        codec::encode_prepare(out, self.sql)
    }
}
