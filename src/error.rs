use std::io;
use std::str::Utf8Error;

/// Errors produced by the codec and protocol layers.
///
/// Transport failures keep their `io::Error` form; everything coming
/// out of the MsgPack layer is wrapped so it can propagate with `?`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("utf8 error: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("failed to encode: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),
    #[error("failed to decode: {0}")]
    Decode(#[from] rmp::decode::ValueReadError),
    #[error("failed to decode: {0}")]
    DecodeNum(#[from] rmp::decode::NumValueReadError),
    #[error("failed to serialize tuple: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("service responded with error: {0}")]
    Response(#[from] ResponseError),
    #[error("malformed greeting: {0}")]
    Greeting(&'static str),
}

impl Error {
    /// True when the failure means "the buffer ended mid-value", i.e.
    /// the decode may be retried after more bytes arrive. Anything
    /// else coming out of a decode is a hard framing error.
    pub fn is_truncated(&self) -> bool {
        use rmp::decode::{NumValueReadError, ValueReadError};
        fn eof(e: &io::Error) -> bool {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        match self {
            Error::Io(e) => eof(e),
            Error::Decode(ValueReadError::InvalidMarkerRead(e))
            | Error::Decode(ValueReadError::InvalidDataRead(e)) => eof(e),
            Error::DecodeNum(NumValueReadError::InvalidMarkerRead(e))
            | Error::DecodeNum(NumValueReadError::InvalidDataRead(e)) => eof(e),
            _ => false,
        }
    }
}

/// An error reported by the server in a response body.
///
/// `code` is the response header code with the error bit stripped,
/// `message` is the topmost message of the error stack.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ResponseError {
    pub code: u32,
    pub message: String,
}
