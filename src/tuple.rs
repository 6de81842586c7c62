use std::io::Write;

use serde::Serialize;

use crate::error::Error;

/// Types implementing this trait can be encoded as a tuple (msgpack
/// array) in a request body: keys, tuples, update operation lists and
/// call/eval argument packs.
///
/// Any `Serialize` type qualifies; Rust tuples, arrays and `Vec`s map
/// onto msgpack arrays, which is what the protocol expects. A
/// caller-built [`rmpv::Value`] tree goes through the same path.
pub trait ToTupleBuffer {
    fn write_tuple_data(&self, w: &mut impl Write) -> Result<(), Error>;
}

impl<T> ToTupleBuffer for T
where
    T: Serialize + ?Sized,
{
    #[inline]
    fn write_tuple_data(&self, w: &mut impl Write) -> Result<(), Error> {
        rmp_serde::encode::write(w, self).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_vec(v: &impl ToTupleBuffer) -> Vec<u8> {
        let mut buf = Vec::new();
        v.write_tuple_data(&mut buf).unwrap();
        buf
    }

    #[test]
    fn rust_tuple_becomes_msgpack_array() {
        assert_eq!(to_vec(&(42,)), [0x91, 0x2A]);
        assert_eq!(to_vec(&(1, "a")), [0x92, 0x01, 0xA1, b'a']);
    }

    #[test]
    fn value_tree_goes_through() {
        let v = rmpv::Value::Array(vec![
            rmpv::Value::from(512),
            rmpv::Value::from("name"),
        ]);
        let bytes = to_vec(&v);
        assert_eq!(bytes[0], 0x92);
        let parsed = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
        assert_eq!(parsed, v);
    }
}
