//! Small MsgPack helpers shared by the encoder and the decoder.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use rmp::decode::ValueReadError;
use rmp::Marker;

use crate::error::Error;

#[inline]
pub(crate) fn read_marker(cur: &mut impl Read) -> Result<Marker, Error> {
    rmp::decode::read_marker(cur)
        .map_err(ValueReadError::from)
        .map_err(Into::into)
}

/// Advance the cursor past one value of any family without
/// materializing it. Composite values are skipped recursively.
pub fn skip_value(cur: &mut (impl Read + Seek)) -> Result<(), Error> {
    match read_marker(cur)? {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {}
        Marker::U8 | Marker::I8 => {
            cur.seek(SeekFrom::Current(1))?;
        }
        Marker::U16 | Marker::I16 => {
            cur.seek(SeekFrom::Current(2))?;
        }
        Marker::U32 | Marker::I32 | Marker::F32 => {
            cur.seek(SeekFrom::Current(4))?;
        }
        Marker::U64 | Marker::I64 | Marker::F64 => {
            cur.seek(SeekFrom::Current(8))?;
        }
        Marker::FixStr(len) => {
            cur.seek(SeekFrom::Current(len as i64))?;
        }
        Marker::Str8 | Marker::Bin8 => {
            let len = cur.read_u8()?;
            cur.seek(SeekFrom::Current(len as i64))?;
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = cur.read_u16::<BigEndian>()?;
            cur.seek(SeekFrom::Current(len as i64))?;
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = cur.read_u32::<BigEndian>()?;
            cur.seek(SeekFrom::Current(len as i64))?;
        }
        Marker::FixArray(len) => {
            for _ in 0..len {
                skip_value(cur)?;
            }
        }
        Marker::Array16 => {
            let len = cur.read_u16::<BigEndian>()?;
            for _ in 0..len {
                skip_value(cur)?;
            }
        }
        Marker::Array32 => {
            let len = cur.read_u32::<BigEndian>()?;
            for _ in 0..len {
                skip_value(cur)?;
            }
        }
        Marker::FixMap(len) => {
            let len = len * 2;
            for _ in 0..len {
                skip_value(cur)?;
            }
        }
        Marker::Map16 => {
            let len = cur.read_u16::<BigEndian>()? as u32 * 2;
            for _ in 0..len {
                skip_value(cur)?;
            }
        }
        Marker::Map32 => {
            let len = cur.read_u32::<BigEndian>()? as u64 * 2;
            for _ in 0..len {
                skip_value(cur)?;
            }
        }
        Marker::FixExt1 => {
            cur.seek(SeekFrom::Current(2))?;
        }
        Marker::FixExt2 => {
            cur.seek(SeekFrom::Current(3))?;
        }
        Marker::FixExt4 => {
            cur.seek(SeekFrom::Current(5))?;
        }
        Marker::FixExt8 => {
            cur.seek(SeekFrom::Current(9))?;
        }
        Marker::FixExt16 => {
            cur.seek(SeekFrom::Current(17))?;
        }
        Marker::Ext8 => {
            let len = cur.read_u8()?;
            cur.seek(SeekFrom::Current(len as i64 + 1))?;
        }
        Marker::Ext16 => {
            let len = cur.read_u16::<BigEndian>()?;
            cur.seek(SeekFrom::Current(len as i64 + 1))?;
        }
        Marker::Ext32 => {
            let len = cur.read_u32::<BigEndian>()?;
            cur.seek(SeekFrom::Current(len as i64 + 1))?;
        }
        Marker::Reserved => {
            return Err(ValueReadError::TypeMismatch(Marker::Reserved).into());
        }
    }
    Ok(())
}

/// Decode a string, storing at most `max` bytes of it. The full wire
/// length is always consumed so the cursor lands on the next value.
/// Diagnostic fields of the error stack have fixed storage bounds.
pub fn read_str_bounded(cur: &mut (impl Read + Seek), max: usize) -> Result<String, Error> {
    let len = rmp::decode::read_str_len(cur)? as usize;
    let stored = len.min(max);
    let mut buf = vec![0u8; stored];
    cur.read_exact(&mut buf)?;
    if len > stored {
        cur.seek(SeekFrom::Current((len - stored) as i64))?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut v = Vec::new();
        f(&mut v);
        v
    }

    #[test]
    fn skips_nested_composites() {
        let bytes = encoded(|w| {
            rmp::encode::write_array_len(w, 3).unwrap();
            rmp::encode::write_uint(w, 1).unwrap();
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_str(w, "k").unwrap();
            rmp::encode::write_array_len(w, 2).unwrap();
            rmp::encode::write_nil(w).unwrap();
            rmp::encode::write_f64(w, 0.5).unwrap();
            rmp::encode::write_str(w, "tail").unwrap();
        });
        let mut cur = Cursor::new(bytes.as_slice());
        skip_value(&mut cur).unwrap();
        assert_eq!(cur.position() as usize, bytes.len());
    }

    #[test]
    fn skip_on_truncated_input_is_recoverable() {
        let bytes = encoded(|w| {
            rmp::encode::write_array_len(w, 2).unwrap();
            rmp::encode::write_uint(w, 7).unwrap();
            rmp::encode::write_uint(w, 100_000).unwrap();
        });
        let cut = &bytes[..bytes.len() - 2];
        let mut cur = Cursor::new(cut);
        let err = skip_value(&mut cur).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn bounded_string_truncates_but_consumes() {
        let bytes = encoded(|w| {
            rmp::encode::write_str(w, "hello world").unwrap();
            rmp::encode::write_uint(w, 9).unwrap();
        });
        let mut cur = Cursor::new(bytes.as_slice());
        let s = read_str_bounded(&mut cur, 5).unwrap();
        assert_eq!(s, "hello");
        let next: u64 = rmp::decode::read_int(&mut cur).unwrap();
        assert_eq!(next, 9);
    }
}
