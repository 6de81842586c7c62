//! IPROTO constants and the header/body codecs.
//!
//! Body encoders are plain functions over `impl Write`; framing (the
//! 5-byte length preheader) is the [`RequestEncoder`]'s job.
//!
//! [`RequestEncoder`]: super::encoder::RequestEncoder

use std::io::{Read, Seek, Write};

use crate::error::Error;
use crate::msgpack;
use crate::tuple::ToTupleBuffer;

use super::greeting::scramble;
use super::SyncIndex;

// Header keys.
pub const REQUEST_TYPE: u8 = 0x00;
pub const SYNC: u8 = 0x01;
pub const SCHEMA_VERSION: u8 = 0x05;

// Replication headers, reserved: recognized by the constants table
// but never encoded or interpreted by this client.
pub const REPLICA_ID: u8 = 0x02;
pub const LSN: u8 = 0x03;
pub const TIMESTAMP: u8 = 0x04;
pub const TSN: u8 = 0x08;
pub const FLAGS: u8 = 0x09;
pub const VCLOCK: u8 = 0x26;
pub const BALLOT: u8 = 0x29;
pub const ID_FILTER: u8 = 0x51;

// Body keys.
pub const SPACE_ID: u8 = 0x10;
pub const INDEX_ID: u8 = 0x11;
pub const LIMIT: u8 = 0x12;
pub const OFFSET: u8 = 0x13;
pub const ITERATOR: u8 = 0x14;
pub const INDEX_BASE: u8 = 0x15;
pub const KEY: u8 = 0x20;
pub const TUPLE: u8 = 0x21;
pub const FUNCTION_NAME: u8 = 0x22;
pub const USER_NAME: u8 = 0x23;
pub const EXPR: u8 = 0x27;
pub const OPS: u8 = 0x28;
pub const OPTIONS: u8 = 0x2b;
pub const DATA: u8 = 0x30;
pub const ERROR_24: u8 = 0x31;
pub const SQL_TEXT: u8 = 0x40;
pub const SQL_BIND: u8 = 0x41;
pub const SQL_INFO: u8 = 0x42;
pub const STMT_ID: u8 = 0x43;
pub const ERROR: u8 = 0x52;

// Keys of the ERROR map and of each stack frame.
pub const ERROR_STACK: u8 = 0x00;
pub const ERROR_TYPE: u8 = 0x00;
pub const ERROR_FILE: u8 = 0x01;
pub const ERROR_LINE: u8 = 0x02;
pub const ERROR_MESSAGE: u8 = 0x03;
pub const ERROR_ERRNO: u8 = 0x04;
pub const ERROR_CODE: u8 = 0x05;
pub const ERROR_FIELDS: u8 = 0x06;

/// Response header code with this bit set carries an error stack in
/// the body; the low bits are the error code.
pub const TYPE_ERROR: u32 = 1 << 15;

/// Upper bound on a single packet's body length; anything larger is
/// treated as lost framing.
pub const BODY_LEN_MAX: u64 = 2147483648;

// Storage bounds for diagnostic strings of the error stack.
pub const DIAG_ERRMSG_MAX: usize = 512;
pub const DIAG_FILENAME_MAX: usize = 256;
pub const DIAG_TYPENAME_MAX: usize = 24;

pub const AUTH_METHOD_CHAP_SHA1: &str = "chap-sha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IProtoType {
    Ok = 0,
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call = 10,
    Execute = 11,
    Nop = 12,
    Prepare = 13,
    Ping = 64,
}

/// Iterator semantics of a SELECT, encoded as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorType {
    /// Tuples matching the key, ascending.
    Eq = 0,

    /// Tuples matching the key, descending (reverse equality).
    Req = 1,

    /// Every tuple of the index.
    All = 2,

    /// Tuples whose key is strictly below the given one.
    LT = 3,

    /// Tuples whose key is below or equal to the given one.
    LE = 4,

    /// Tuples whose key is above or equal to the given one.
    GE = 5,

    /// Tuples whose key is strictly above the given one.
    GT = 6,

    /// Bitset index: every bit of the search value is set in the key.
    BitsAllSet = 7,

    /// Bitset index: the key shares at least one set bit with the
    /// search value.
    BitsAnySet = 8,

    /// Bitset index: the key has none of the search value's bits set.
    BitsAllNotSet = 9,

    /// Spatial index: the key's rectangle intersects the given one.
    Overlaps = 10,

    /// Spatial index: nearest tuples first, by distance to the given
    /// point.
    Neighbor = 11,
}

pub fn encode_header(
    stream: &mut impl Write,
    sync: SyncIndex,
    request_type: IProtoType,
) -> Result<(), Error> {
    rmp::encode::write_map_len(stream, 2)?;
    rmp::encode::write_pfix(stream, REQUEST_TYPE)?;
    rmp::encode::write_pfix(stream, request_type as u8)?;
    rmp::encode::write_pfix(stream, SYNC)?;
    rmp::encode::write_uint(stream, sync.get())?;
    Ok(())
}

pub fn encode_ping(stream: &mut impl Write) -> Result<(), Error> {
    rmp::encode::write_map_len(stream, 0)?;
    Ok(())
}

pub fn encode_insert<T>(stream: &mut impl Write, space_id: u32, value: &T) -> Result<(), Error>
where
    T: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 2)?;
    rmp::encode::write_pfix(stream, SPACE_ID)?;
    rmp::encode::write_uint(stream, space_id as u64)?;
    rmp::encode::write_pfix(stream, TUPLE)?;
    value.write_tuple_data(stream)?;
    Ok(())
}

pub fn encode_replace<T>(stream: &mut impl Write, space_id: u32, value: &T) -> Result<(), Error>
where
    T: ToTupleBuffer + ?Sized,
{
    encode_insert(stream, space_id, value)
}

pub fn encode_delete<K>(
    stream: &mut impl Write,
    space_id: u32,
    index_id: u32,
    key: &K,
) -> Result<(), Error>
where
    K: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 3)?;
    rmp::encode::write_pfix(stream, SPACE_ID)?;
    rmp::encode::write_uint(stream, space_id as u64)?;
    rmp::encode::write_pfix(stream, INDEX_ID)?;
    rmp::encode::write_uint(stream, index_id as u64)?;
    rmp::encode::write_pfix(stream, KEY)?;
    key.write_tuple_data(stream)?;
    Ok(())
}

pub fn encode_update<K, Op>(
    stream: &mut impl Write,
    space_id: u32,
    index_id: u32,
    key: &K,
    ops: &Op,
) -> Result<(), Error>
where
    K: ToTupleBuffer + ?Sized,
    Op: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 4)?;
    rmp::encode::write_pfix(stream, SPACE_ID)?;
    rmp::encode::write_uint(stream, space_id as u64)?;
    rmp::encode::write_pfix(stream, INDEX_ID)?;
    rmp::encode::write_uint(stream, index_id as u64)?;
    rmp::encode::write_pfix(stream, KEY)?;
    key.write_tuple_data(stream)?;
    rmp::encode::write_pfix(stream, TUPLE)?;
    ops.write_tuple_data(stream)?;
    Ok(())
}

pub fn encode_upsert<T, Op>(
    stream: &mut impl Write,
    space_id: u32,
    index_base: u32,
    value: &T,
    ops: &Op,
) -> Result<(), Error>
where
    T: ToTupleBuffer + ?Sized,
    Op: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 4)?;
    rmp::encode::write_pfix(stream, SPACE_ID)?;
    rmp::encode::write_uint(stream, space_id as u64)?;
    rmp::encode::write_pfix(stream, INDEX_BASE)?;
    rmp::encode::write_uint(stream, index_base as u64)?;
    rmp::encode::write_pfix(stream, OPS)?;
    ops.write_tuple_data(stream)?;
    rmp::encode::write_pfix(stream, TUPLE)?;
    value.write_tuple_data(stream)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn encode_select<K>(
    stream: &mut impl Write,
    space_id: u32,
    index_id: u32,
    limit: u32,
    offset: u32,
    iterator_type: IteratorType,
    key: &K,
) -> Result<(), Error>
where
    K: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 6)?;
    rmp::encode::write_pfix(stream, SPACE_ID)?;
    rmp::encode::write_uint(stream, space_id as u64)?;
    rmp::encode::write_pfix(stream, INDEX_ID)?;
    rmp::encode::write_uint(stream, index_id as u64)?;
    rmp::encode::write_pfix(stream, LIMIT)?;
    rmp::encode::write_uint(stream, limit as u64)?;
    rmp::encode::write_pfix(stream, OFFSET)?;
    rmp::encode::write_uint(stream, offset as u64)?;
    rmp::encode::write_pfix(stream, ITERATOR)?;
    rmp::encode::write_uint(stream, iterator_type as u64)?;
    rmp::encode::write_pfix(stream, KEY)?;
    key.write_tuple_data(stream)?;
    Ok(())
}

pub fn encode_call<T>(stream: &mut impl Write, function_name: &str, args: &T) -> Result<(), Error>
where
    T: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 2)?;
    rmp::encode::write_pfix(stream, FUNCTION_NAME)?;
    rmp::encode::write_str(stream, function_name)?;
    rmp::encode::write_pfix(stream, TUPLE)?;
    args.write_tuple_data(stream)?;
    Ok(())
}

pub fn encode_eval<T>(stream: &mut impl Write, expression: &str, args: &T) -> Result<(), Error>
where
    T: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 2)?;
    rmp::encode::write_pfix(stream, EXPR)?;
    rmp::encode::write_str(stream, expression)?;
    rmp::encode::write_pfix(stream, TUPLE)?;
    args.write_tuple_data(stream)?;
    Ok(())
}

pub fn encode_execute<P>(stream: &mut impl Write, sql: &str, bind_params: &P) -> Result<(), Error>
where
    P: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 3)?;
    rmp::encode::write_pfix(stream, SQL_TEXT)?;
    rmp::encode::write_str(stream, sql)?;
    rmp::encode::write_pfix(stream, SQL_BIND)?;
    bind_params.write_tuple_data(stream)?;
    rmp::encode::write_pfix(stream, OPTIONS)?;
    rmp::encode::write_array_len(stream, 0)?;
    Ok(())
}

pub fn encode_execute_stmt<P>(
    stream: &mut impl Write,
    stmt_id: u32,
    bind_params: &P,
) -> Result<(), Error>
where
    P: ToTupleBuffer + ?Sized,
{
    rmp::encode::write_map_len(stream, 3)?;
    rmp::encode::write_pfix(stream, STMT_ID)?;
    rmp::encode::write_uint(stream, stmt_id as u64)?;
    rmp::encode::write_pfix(stream, SQL_BIND)?;
    bind_params.write_tuple_data(stream)?;
    rmp::encode::write_pfix(stream, OPTIONS)?;
    rmp::encode::write_array_len(stream, 0)?;
    Ok(())
}

pub fn encode_prepare(stream: &mut impl Write, sql: &str) -> Result<(), Error> {
    rmp::encode::write_map_len(stream, 1)?;
    rmp::encode::write_pfix(stream, SQL_TEXT)?;
    rmp::encode::write_str(stream, sql)?;
    Ok(())
}

/// Auth body: user name plus the `["chap-sha1", scramble]` tuple.
/// The scramble is transmitted as a 20-byte msgpack string.
pub fn encode_auth(
    stream: &mut impl Write,
    user: &str,
    password: &str,
    salt: &[u8],
) -> Result<(), Error> {
    let scram = scramble(password, salt);

    rmp::encode::write_map_len(stream, 2)?;
    rmp::encode::write_pfix(stream, USER_NAME)?;
    rmp::encode::write_str(stream, user)?;
    rmp::encode::write_pfix(stream, TUPLE)?;
    rmp::encode::write_array_len(stream, 2)?;
    rmp::encode::write_str(stream, AUTH_METHOD_CHAP_SHA1)?;
    rmp::encode::write_str_len(stream, scram.len() as u32)?;
    stream.write_all(&scram)?;
    Ok(())
}

/// Response header. `schema_id` is 0 when the server did not send one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub code: u32,
    pub sync: SyncIndex,
    pub schema_id: u32,
}

impl Header {
    /// Whether the body carries an error stack instead of data.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.code & TYPE_ERROR != 0
    }

    /// The error code with the error bit stripped.
    #[inline]
    pub fn error_code(&self) -> u32 {
        self.code & !TYPE_ERROR
    }
}

pub fn decode_header(stream: &mut (impl Read + Seek)) -> Result<Header, Error> {
    let mut sync: Option<u64> = None;
    let mut code: Option<u32> = None;
    let mut schema_id: u32 = 0;

    let map_len = rmp::decode::read_map_len(stream)?;
    for _ in 0..map_len {
        let key = rmp::decode::read_pfix(stream)?;
        match key {
            REQUEST_TYPE => code = Some(rmp::decode::read_int(stream)?),
            SYNC => sync = Some(rmp::decode::read_int(stream)?),
            SCHEMA_VERSION => schema_id = rmp::decode::read_int(stream)?,
            _ => msgpack::skip_value(stream)?,
        }
    }

    match (code, sync) {
        (Some(code), Some(sync)) => Ok(Header {
            code,
            sync: SyncIndex(sync),
            schema_id,
        }),
        _ => Err(std::io::Error::from(std::io::ErrorKind::InvalidData).into()),
    }
}
