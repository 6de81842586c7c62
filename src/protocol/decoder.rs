//! Streaming response decoder.
//!
//! The decoder pulls framed responses out of the buffer the transport
//! fills. It is restartable: until a whole frame is buffered,
//! [`ResponseDecoder::decode_response`] returns `Ok(None)` and leaves
//! the committed read position untouched, so the caller can `recv`
//! more bytes and retry. A decode failure inside a complete frame
//! means framing integrity is lost and the stream must be torn down.
//!
//! Tuple payloads are not copied out: a [`TupleSlice`] records where
//! a tuple starts in the buffer and how many fields it has, and the
//! caller reads the bytes through [`TupleSlice::data`] while the
//! buffer region is still retained.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use rmp::Marker;

use crate::buffer::Buffer;
use crate::error::{Error, ResponseError};
use crate::msgpack;

use super::codec::{self, Header};
use super::encoder::PREHEADER_SIZE;

/// A tuple of a DATA array, borrowed from the buffer by position.
///
/// The buffer region holding the response must not be consumed while
/// slices into it are still in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleSlice {
    /// Position of the tuple's first byte in the buffer.
    pub position: u64,
    /// Arity: array or map length, or 1 for a bare scalar.
    pub field_count: u32,
}

impl TupleSlice {
    /// The raw msgpack bytes of this tuple.
    pub fn data<'a>(&self, buf: &'a Buffer) -> Result<&'a [u8], Error> {
        let mut cur = Cursor::new(buf.slice_from(self.position));
        msgpack::skip_value(&mut cur)?;
        let len = cur.position();
        Ok(buf.slice(self.position, self.position + len))
    }

    /// Materialize the tuple as an owned value tree, for callers that
    /// cannot keep borrowing the buffer.
    pub fn decode_value(&self, buf: &Buffer) -> Result<rmpv::Value, Error> {
        let mut data = self.data(buf)?;
        rmpv::decode::read_value(&mut data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
    }
}

/// Decoded DATA body: always an array on the wire, even for a single
/// scalar result of `call`/`eval`.
#[derive(Debug, Default)]
pub struct Data {
    /// Element count of the data array.
    pub dimension: u32,
    pub tuples: Vec<TupleSlice>,
    /// Position one past the data array.
    pub end: u64,
}

/// One frame of the error stack.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub type_name: String,
    pub file: String,
    pub line: u32,
    pub msg: String,
    pub saved_errno: u32,
    pub errcode: u32,
}

/// The server-reported error stack. The wire format permits any
/// number of frames; all of them are decoded, topmost first.
#[derive(Debug, Default)]
pub struct ErrorStack {
    pub frames: Vec<ErrorFrame>,
}

impl ErrorStack {
    #[inline]
    pub fn count(&self) -> usize {
        self.frames.len()
    }

    /// The topmost (most recent) error of the stack.
    #[inline]
    pub fn top(&self) -> Option<&ErrorFrame> {
        self.frames.first()
    }
}

/// Response body. At most one of the two is populated; both empty is
/// a valid OK without data.
#[derive(Debug, Default)]
pub struct Body {
    pub data: Option<Data>,
    pub error_stack: Option<ErrorStack>,
}

#[derive(Debug)]
pub struct Response {
    pub header: Header,
    pub body: Body,
    /// Byte count of the header and body maps (preheader excluded).
    pub size: u32,
}

impl Response {
    /// The server error carried by this response, if any.
    pub fn error(&self) -> Option<ResponseError> {
        if !self.header.is_error() {
            return None;
        }
        let message = self
            .body
            .error_stack
            .as_ref()
            .and_then(|stack| stack.top())
            .map(|frame| frame.msg.clone())
            .unwrap_or_default();
        Some(ResponseError {
            code: self.header.error_code(),
            message,
        })
    }
}

/// Restartable pull decoder over a caller-owned [`Buffer`].
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    pos: u64,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed read position: everything before it has been
    /// decoded, everything after it is still unparsed input.
    #[inline]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Rewind (or fast-forward) to `pos`, typically after the caller
    /// consumed fully-processed responses from the buffer front.
    pub fn reset(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Read the 5-byte length prefix ahead of the committed position
    /// without consuming it. `Ok(None)` means more bytes are needed.
    pub fn read_response_size(&self, buf: &Buffer) -> Result<Option<u32>, Error> {
        let mut cur = Cursor::new(buf.slice_from(self.pos));
        match rmp::decode::read_u32(&mut cur) {
            Ok(size) => Ok(Some(size)),
            Err(e) => {
                let e = Error::from(e);
                if e.is_truncated() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Decode the next response. `Ok(None)` means the frame is not
    /// fully buffered yet; the position does not move. Any error is
    /// fatal to the stream.
    pub fn decode_response(&mut self, buf: &Buffer) -> Result<Option<Response>, Error> {
        let size = match self.read_response_size(buf)? {
            Some(size) => size,
            None => return Ok(None),
        };
        if size as u64 > codec::BODY_LEN_MAX {
            log::error!("response of {} bytes exceeds the sane maximum", size);
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidData).into());
        }

        let avail = buf.slice_from(self.pos);
        if avail.len() - PREHEADER_SIZE < size as usize {
            return Ok(None);
        }
        let frame_base = self.pos + PREHEADER_SIZE as u64;
        let frame = &avail[PREHEADER_SIZE..PREHEADER_SIZE + size as usize];

        let mut cur = Cursor::new(frame);
        let header = codec::decode_header(&mut cur).map_err(|e| {
            log::error!("failed to decode header: {}", e);
            e
        })?;
        let mut body = Body::default();
        decode_body(&mut cur, frame_base, &mut body).map_err(|e| {
            log::error!("failed to decode body: {}", e);
            e
        })?;

        self.pos = frame_base + size as u64;
        Ok(Some(Response { header, body, size }))
    }
}

fn decode_body(cur: &mut Cursor<&[u8]>, frame_base: u64, body: &mut Body) -> Result<(), Error> {
    let map_len = rmp::decode::read_map_len(cur)?;
    for _ in 0..map_len {
        let key = rmp::decode::read_pfix(cur)?;
        match key {
            codec::DATA => {
                body.data = Some(decode_data(cur, frame_base)?);
            }
            codec::ERROR_24 => {
                let msg = msgpack::read_str_bounded(cur, codec::DIAG_ERRMSG_MAX)?;
                let stack = body.error_stack.get_or_insert_with(ErrorStack::default);
                match stack.frames.first_mut() {
                    Some(top) => top.msg = msg,
                    None => stack.frames.push(ErrorFrame {
                        msg,
                        ..ErrorFrame::default()
                    }),
                }
            }
            codec::ERROR => {
                // The legacy message precedes the rich error on the
                // wire, so the stack normally exists already; seed an
                // empty one when the server sent the map alone.
                let stack = body.error_stack.get_or_insert_with(ErrorStack::default);
                decode_error(cur, stack)?;
            }
            _ => msgpack::skip_value(cur)?,
        }
    }
    Ok(())
}

fn decode_data(cur: &mut Cursor<&[u8]>, frame_base: u64) -> Result<Data, Error> {
    let dimension = rmp::decode::read_array_len(cur)?;
    let mut tuples = Vec::with_capacity(dimension as usize);
    for _ in 0..dimension {
        let elem_pos = cur.position();
        let field_count = peek_arity(cur)?;
        cur.set_position(elem_pos);
        msgpack::skip_value(cur)?;
        tuples.push(TupleSlice {
            position: frame_base + elem_pos,
            field_count,
        });
    }
    Ok(Data {
        dimension,
        tuples,
        end: frame_base + cur.position(),
    })
}

/// Logical arity of the value under the cursor: container length for
/// arrays and maps, 1 for anything else. Consumes the length word;
/// callers rewind and skip the whole value afterwards.
fn peek_arity(cur: &mut Cursor<&[u8]>) -> Result<u32, Error> {
    let arity = match msgpack::read_marker(cur)? {
        Marker::FixArray(len) => len as u32,
        Marker::Array16 => cur.read_u16::<BigEndian>()? as u32,
        Marker::Array32 => cur.read_u32::<BigEndian>()?,
        Marker::FixMap(len) => len as u32,
        Marker::Map16 => cur.read_u16::<BigEndian>()? as u32,
        Marker::Map32 => cur.read_u32::<BigEndian>()?,
        _ => 1,
    };
    Ok(arity)
}

fn decode_error(cur: &mut Cursor<&[u8]>, stack: &mut ErrorStack) -> Result<(), Error> {
    let map_len = rmp::decode::read_map_len(cur)?;
    for _ in 0..map_len {
        let key = rmp::decode::read_pfix(cur)?;
        if key != codec::ERROR_STACK {
            msgpack::skip_value(cur)?;
            continue;
        }
        let count = rmp::decode::read_array_len(cur)?;
        for i in 0..count {
            if i as usize >= stack.frames.len() {
                stack.frames.push(ErrorFrame::default());
            }
            let frame = &mut stack.frames[i as usize];
            decode_error_frame(cur, frame)?;
        }
    }
    Ok(())
}

fn decode_error_frame(cur: &mut Cursor<&[u8]>, frame: &mut ErrorFrame) -> Result<(), Error> {
    let map_len = rmp::decode::read_map_len(cur)?;
    for _ in 0..map_len {
        let key = rmp::decode::read_pfix(cur)?;
        match key {
            codec::ERROR_TYPE => {
                frame.type_name = msgpack::read_str_bounded(cur, codec::DIAG_TYPENAME_MAX)?;
            }
            codec::ERROR_FILE => {
                frame.file = msgpack::read_str_bounded(cur, codec::DIAG_FILENAME_MAX)?;
            }
            codec::ERROR_LINE => {
                frame.line = rmp::decode::read_int(cur)?;
            }
            codec::ERROR_MESSAGE => {
                frame.msg = msgpack::read_str_bounded(cur, codec::DIAG_ERRMSG_MAX)?;
            }
            codec::ERROR_ERRNO => {
                frame.saved_errno = rmp::decode::read_int(cur)?;
            }
            codec::ERROR_CODE => {
                frame.errcode = rmp::decode::read_int(cur)?;
            }
            codec::ERROR_FIELDS => {
                decode_error_fields(cur, frame)?;
            }
            _ => msgpack::skip_value(cur)?,
        }
    }
    Ok(())
}

/// FIELDS is a string-keyed map; `custom_type` overrides the frame's
/// type name, everything else is skipped.
fn decode_error_fields(cur: &mut Cursor<&[u8]>, frame: &mut ErrorFrame) -> Result<(), Error> {
    let map_len = rmp::decode::read_map_len(cur)?;
    for _ in 0..map_len {
        let key = msgpack::read_str_bounded(cur, 64)?;
        if key == "custom_type" {
            frame.type_name = msgpack::read_str_bounded(cur, codec::DIAG_TYPENAME_MAX)?;
        } else {
            msgpack::skip_value(cur)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncIndex;
    use pretty_assertions::assert_eq;

    /// Hand-build one framed response out of a header closure and a
    /// body closure, the way the server would send it.
    fn frame(header: impl FnOnce(&mut Vec<u8>), body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut payload = Vec::new();
        header(&mut payload);
        body(&mut payload);
        let mut packet = Vec::new();
        rmp::encode::write_u32(&mut packet, payload.len() as u32).unwrap();
        packet.extend_from_slice(&payload);
        packet
    }

    fn ok_header(sync: u64) -> impl FnOnce(&mut Vec<u8>) {
        move |w: &mut Vec<u8>| {
            rmp::encode::write_map_len(w, 3).unwrap();
            rmp::encode::write_pfix(w, codec::REQUEST_TYPE).unwrap();
            rmp::encode::write_uint(w, 0).unwrap();
            rmp::encode::write_pfix(w, codec::SYNC).unwrap();
            rmp::encode::write_uint(w, sync).unwrap();
            rmp::encode::write_pfix(w, codec::SCHEMA_VERSION).unwrap();
            rmp::encode::write_uint(w, 3).unwrap();
        }
    }

    fn error_header(sync: u64, errcode: u32) -> impl FnOnce(&mut Vec<u8>) {
        move |w: &mut Vec<u8>| {
            rmp::encode::write_map_len(w, 2).unwrap();
            rmp::encode::write_pfix(w, codec::REQUEST_TYPE).unwrap();
            rmp::encode::write_uint(w, (codec::TYPE_ERROR | errcode) as u64).unwrap();
            rmp::encode::write_pfix(w, codec::SYNC).unwrap();
            rmp::encode::write_uint(w, sync).unwrap();
        }
    }

    #[test]
    fn data_with_two_tuples() {
        let packet = frame(ok_header(11), |w| {
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_pfix(w, codec::DATA).unwrap();
            rmp::encode::write_array_len(w, 2).unwrap();
            rmp::encode::write_array_len(w, 2).unwrap();
            rmp::encode::write_uint(w, 1).unwrap();
            rmp::encode::write_str(w, "a").unwrap();
            rmp::encode::write_array_len(w, 2).unwrap();
            rmp::encode::write_uint(w, 2).unwrap();
            rmp::encode::write_str(w, "b").unwrap();
        });
        let buf = Buffer::from_vec(packet);

        let mut decoder = ResponseDecoder::new();
        let response = decoder.decode_response(&buf).unwrap().unwrap();
        assert_eq!(response.header.sync, SyncIndex(11));
        assert_eq!(response.header.schema_id, 3);
        assert!(response.error().is_none());

        let data = response.body.data.as_ref().unwrap();
        assert_eq!(data.dimension, 2);
        assert_eq!(data.tuples.len(), 2);
        for tuple in &data.tuples {
            assert_eq!(tuple.field_count, 2);
        }
        // slices point into the original buffer, no copies made
        assert_eq!(
            data.tuples[0].data(&buf).unwrap(),
            &[0x92, 0x01, 0xA1, b'a']
        );
        assert_eq!(
            data.tuples[1].data(&buf).unwrap(),
            &[0x92, 0x02, 0xA1, b'b']
        );
        assert_eq!(
            data.tuples[1].decode_value(&buf).unwrap(),
            rmpv::Value::Array(vec![rmpv::Value::from(2), rmpv::Value::from("b")])
        );
        assert_eq!(data.end, buf.end());
        assert_eq!(decoder.position(), buf.end());
        assert!(response.body.error_stack.is_none());
    }

    #[test]
    fn scalar_data_element_is_a_tuple_of_one() {
        let packet = frame(ok_header(1), |w| {
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_pfix(w, codec::DATA).unwrap();
            rmp::encode::write_array_len(w, 3).unwrap();
            rmp::encode::write_uint(w, 1000).unwrap();
            rmp::encode::write_str(w, "bare").unwrap();
            rmp::encode::write_map_len(w, 2).unwrap();
            for i in 0..2 {
                rmp::encode::write_uint(w, i).unwrap();
                rmp::encode::write_bool(w, true).unwrap();
            }
        });
        let buf = Buffer::from_vec(packet);
        let response = ResponseDecoder::new().decode_response(&buf).unwrap().unwrap();
        let data = response.body.data.unwrap();
        assert_eq!(data.dimension, 3);
        assert_eq!(data.tuples[0].field_count, 1);
        assert_eq!(data.tuples[1].field_count, 1);
        assert_eq!(data.tuples[2].field_count, 2);
    }

    #[test]
    fn error_24_with_rich_stack() {
        let packet = frame(error_header(5, 42), |w| {
            rmp::encode::write_map_len(w, 2).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_24).unwrap();
            rmp::encode::write_str(w, "msg").unwrap();
            rmp::encode::write_pfix(w, codec::ERROR).unwrap();
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_STACK).unwrap();
            rmp::encode::write_array_len(w, 1).unwrap();
            rmp::encode::write_map_len(w, 4).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_TYPE).unwrap();
            rmp::encode::write_str(w, "Type").unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_LINE).unwrap();
            rmp::encode::write_uint(w, 17).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_MESSAGE).unwrap();
            rmp::encode::write_str(w, "msg").unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_CODE).unwrap();
            rmp::encode::write_uint(w, 42).unwrap();
        });
        let buf = Buffer::from_vec(packet);
        let response = ResponseDecoder::new().decode_response(&buf).unwrap().unwrap();
        assert!(response.body.data.is_none());

        let stack = response.body.error_stack.as_ref().unwrap();
        assert_eq!(stack.count(), 1);
        let top = stack.top().unwrap();
        assert_eq!(top.type_name, "Type");
        assert_eq!(top.line, 17);
        assert_eq!(top.msg, "msg");
        assert_eq!(top.errcode, 42);

        let err = response.error().unwrap();
        assert_eq!(err.code, 42);
        assert_eq!(err.message, "msg");
    }

    #[test]
    fn multi_frame_stack_is_fully_decoded() {
        let packet = frame(error_header(5, 1), |w| {
            rmp::encode::write_map_len(w, 2).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_24).unwrap();
            rmp::encode::write_str(w, "outer").unwrap();
            rmp::encode::write_pfix(w, codec::ERROR).unwrap();
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_STACK).unwrap();
            rmp::encode::write_array_len(w, 2).unwrap();
            for (msg, fields) in [("outer", true), ("inner", false)].iter() {
                rmp::encode::write_map_len(w, if *fields { 2 } else { 1 }).unwrap();
                rmp::encode::write_pfix(w, codec::ERROR_MESSAGE).unwrap();
                rmp::encode::write_str(w, msg).unwrap();
                if *fields {
                    rmp::encode::write_pfix(w, codec::ERROR_FIELDS).unwrap();
                    rmp::encode::write_map_len(w, 1).unwrap();
                    rmp::encode::write_str(w, "custom_type").unwrap();
                    rmp::encode::write_str(w, "MyError").unwrap();
                }
            }
        });
        let buf = Buffer::from_vec(packet);
        let response = ResponseDecoder::new().decode_response(&buf).unwrap().unwrap();
        let stack = response.body.error_stack.unwrap();
        assert_eq!(stack.count(), 2);
        assert_eq!(stack.frames[0].msg, "outer");
        assert_eq!(stack.frames[0].type_name, "MyError");
        assert_eq!(stack.frames[1].msg, "inner");
    }

    #[test]
    fn unknown_body_keys_are_skipped() {
        let packet = frame(ok_header(9), |w| {
            rmp::encode::write_map_len(w, 2).unwrap();
            rmp::encode::write_pfix(w, codec::SQL_INFO).unwrap();
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_uint(w, 0).unwrap();
            rmp::encode::write_uint(w, 5).unwrap();
            rmp::encode::write_pfix(w, codec::DATA).unwrap();
            rmp::encode::write_array_len(w, 0).unwrap();
        });
        let buf = Buffer::from_vec(packet);
        let response = ResponseDecoder::new().decode_response(&buf).unwrap().unwrap();
        let data = response.body.data.unwrap();
        assert_eq!(data.dimension, 0);
        assert!(data.tuples.is_empty());
    }

    #[test]
    fn empty_body_is_a_valid_ok() {
        let packet = frame(ok_header(2), |w| {
            rmp::encode::write_map_len(w, 0).unwrap();
        });
        let buf = Buffer::from_vec(packet);
        let response = ResponseDecoder::new().decode_response(&buf).unwrap().unwrap();
        assert!(response.body.data.is_none());
        assert!(response.body.error_stack.is_none());
    }

    #[test]
    fn truncated_prefixes_need_more_and_keep_position() {
        let packet = frame(ok_header(11), |w| {
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_pfix(w, codec::DATA).unwrap();
            rmp::encode::write_array_len(w, 1).unwrap();
            rmp::encode::write_array_len(w, 2).unwrap();
            rmp::encode::write_uint(w, 1).unwrap();
            rmp::encode::write_str(w, "abc").unwrap();
        });

        let mut decoder = ResponseDecoder::new();
        for cut in 0..packet.len() {
            let buf = Buffer::from_vec(packet[..cut].to_vec());
            assert!(decoder.decode_response(&buf).unwrap().is_none());
            assert_eq!(decoder.position(), 0, "position must survive a short read");
            if cut < PREHEADER_SIZE {
                assert!(decoder.read_response_size(&buf).unwrap().is_none());
            }
        }

        let buf = Buffer::from_vec(packet.clone());
        assert_eq!(
            decoder.read_response_size(&buf).unwrap(),
            Some((packet.len() - PREHEADER_SIZE) as u32)
        );
        let response = decoder.decode_response(&buf).unwrap().unwrap();
        assert_eq!(response.size as usize, packet.len() - PREHEADER_SIZE);
        assert_eq!(decoder.position(), buf.end());
    }

    #[test]
    fn two_responses_back_to_back_with_consume_and_reset() {
        let mut bytes = frame(ok_header(1), |w| {
            rmp::encode::write_map_len(w, 0).unwrap();
        });
        bytes.extend(frame(ok_header(2), |w| {
            rmp::encode::write_map_len(w, 0).unwrap();
        }));

        let mut buf = Buffer::from_vec(bytes);
        let mut decoder = ResponseDecoder::new();
        let first = decoder.decode_response(&buf).unwrap().unwrap();
        assert_eq!(first.header.sync, SyncIndex(1));

        // drop the first frame from the front, then resynchronize
        buf.consume((decoder.position() - buf.begin()) as usize);
        decoder.reset(buf.begin());

        let second = decoder.decode_response(&buf).unwrap().unwrap();
        assert_eq!(second.header.sync, SyncIndex(2));
        assert_eq!(decoder.position(), buf.end());
    }

    #[test]
    fn bad_preheader_is_fatal() {
        let mut packet = frame(ok_header(1), |w| {
            rmp::encode::write_map_len(w, 0).unwrap();
        });
        packet[0] = 0x91;
        let buf = Buffer::from_vec(packet);
        assert!(ResponseDecoder::new().decode_response(&buf).is_err());
    }

    #[test]
    fn oversized_diag_strings_are_truncated() {
        let long_msg = "m".repeat(codec::DIAG_ERRMSG_MAX + 100);
        let packet = frame(error_header(5, 3), |w| {
            rmp::encode::write_map_len(w, 1).unwrap();
            rmp::encode::write_pfix(w, codec::ERROR_24).unwrap();
            rmp::encode::write_str(w, &long_msg).unwrap();
        });
        let buf = Buffer::from_vec(packet);
        let response = ResponseDecoder::new().decode_response(&buf).unwrap().unwrap();
        let stack = response.body.error_stack.unwrap();
        assert_eq!(stack.top().unwrap().msg.len(), codec::DIAG_ERRMSG_MAX);
    }
}
