//! Protocol description without actual network layer.
//!
//! [`Protocol`] is a sans-io connection handler: bytes received from
//! the wire go in through [`Protocol::feed`], framed requests come
//! out of [`Protocol::outgoing_data`], and the embedding event loop
//! owns every socket and readiness concern. The handshake (greeting,
//! then authentication when credentials are configured) is driven
//! internally; once ready, responses are demultiplexed by sync.

pub mod api;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod greeting;

use std::collections::HashMap;

use crate::buffer::Buffer;
use crate::error::{Error, ResponseError};

use api::Request;
use decoder::{Response, ResponseDecoder};
use encoder::RequestEncoder;
use greeting::{parse_greeting, Greeting, GREETING_SIZE};

/// Client-assigned request id, echoed by the server to correlate
/// responses with outstanding requests on one stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncIndex(pub(crate) u64);

impl SyncIndex {
    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(&mut self) -> Self {
        self.0 += 1;
        Self(self.0)
    }

    pub(crate) fn revert(&mut self) {
        self.0 -= 1;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    /// Awaits greeting
    Init,
    /// Awaits auth
    Auth,
    /// Ready to accept new messages
    Ready,
}

impl Default for State {
    fn default() -> Self {
        State::Init
    }
}

/// How many bytes the embedder should read next.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum SizeHint {
    Hint(usize),
    FirstU32,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Config {
    /// (user, password)
    pub creds: Option<(String, String)>,
}

/// One complete response frame taken out of the session, owning its
/// bytes so tuple slices of the decoded [`Response`] stay valid for
/// as long as the frame lives.
#[derive(Debug)]
pub struct IncomingFrame {
    buf: Buffer,
}

impl IncomingFrame {
    pub fn decode(&self) -> Result<Response, Error> {
        ResponseDecoder::new()
            .decode_response(&self.buf)?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
    }

    /// The buffer tuple slices of the decoded response point into.
    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }
}

/// A sans-io connection handler.
///
/// Owns the request encoder, the response decoder and the buffers
/// between them, but performs no I/O of its own.
#[derive(Debug, Default)]
pub struct Protocol {
    state: State,
    encoder: RequestEncoder,
    decoder: ResponseDecoder,
    in_buf: Buffer,
    outgoing: Buffer,
    pending_outgoing: Buffer,
    incoming: HashMap<SyncIndex, Result<IncomingFrame, ResponseError>>,
    greeting: Option<Greeting>,
    /// (user, password)
    creds: Option<(String, String)>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        let mut protocol = Self::new();
        protocol.creds = config.creds;
        protocol
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready)
    }

    /// The greeting received from the server, once there is one.
    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Data can be sent independently of whether the protocol
    /// [`is_ready`](Self::is_ready). If it is not, data is queued and
    /// released to the wire once auth is done.
    pub fn send_request(&mut self, request: &impl Request) -> Result<SyncIndex, Error> {
        let (sync, _) = self.encoder.encode(&mut self.pending_outgoing, request)?;
        self.process_pending_data();
        Ok(sync)
    }

    /// Take an existing response by [`SyncIndex`].
    pub fn take_response(
        &mut self,
        sync: SyncIndex,
    ) -> Option<Result<IncomingFrame, ResponseError>> {
        self.incoming.remove(&sync)
    }

    pub fn drop_response(&mut self, sync: SyncIndex) {
        self.incoming.remove(&sync);
    }

    pub fn read_size_hint(&self) -> SizeHint {
        if let State::Init = self.state {
            // Greeting message is exactly 128 bytes
            SizeHint::Hint(GREETING_SIZE)
        } else {
            SizeHint::FirstU32
        }
    }

    /// Append bytes received from the wire.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.in_buf.write_slice(bytes);
    }

    /// Process at most one buffered incoming message.
    ///
    /// Returns a [`SyncIndex`] when a demultiplexable response was
    /// received; the response can then be retrieved by that index.
    /// `Ok(None)` means either that more bytes are needed or that a
    /// technical message (greeting, auth result) was consumed.
    pub fn process_incoming(&mut self) -> Result<Option<SyncIndex>, Error> {
        let sync = match self.state {
            State::Init => {
                if self.in_buf.len() < GREETING_SIZE {
                    return Ok(None);
                }
                let greeting = parse_greeting(&self.in_buf.readable()[..GREETING_SIZE])?;
                self.consume_input(GREETING_SIZE);
                if let Some((user, pass)) = self.creds.clone() {
                    self.state = State::Auth;
                    // Write straight to outgoing ahead of anything queued
                    self.encoder
                        .encode_auth(&mut self.outgoing, &user, &pass, &greeting)?;
                } else {
                    self.state = State::Ready;
                }
                self.greeting = Some(greeting);
                None
            }
            State::Auth => {
                let response = match self.decode_one()? {
                    Some(response) => response,
                    None => return Ok(None),
                };
                if let Some(err) = response.decoded.error() {
                    return Err(err.into());
                }
                self.state = State::Ready;
                None
            }
            State::Ready => {
                let response = match self.decode_one()? {
                    Some(response) => response,
                    None => return Ok(None),
                };
                let sync = response.decoded.header.sync;
                let entry = match response.decoded.error() {
                    Some(err) => Err(err),
                    None => Ok(response.frame),
                };
                self.incoming.insert(sync, entry);
                Some(sync)
            }
        };
        self.process_pending_data();
        Ok(sync)
    }

    pub fn ready_outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Bytes ready to be handed to the transport.
    pub fn outgoing_data(&self) -> &[u8] {
        self.outgoing.readable()
    }

    /// The outgoing bytes as an iovec list for a vectored send.
    pub fn outgoing_io_slices(&self) -> [std::io::IoSlice<'_>; 1] {
        self.outgoing.io_slices()
    }

    /// Drop the first `n` outgoing bytes after the transport sent them.
    pub fn advance_outgoing(&mut self, n: usize) {
        self.outgoing.consume(n);
    }

    fn decode_one(&mut self) -> Result<Option<DecodedFrame>, Error> {
        let decoded = match self.decoder.decode_response(&self.in_buf)? {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        let consumed = (self.decoder.position() - self.in_buf.begin()) as usize;
        let frame = IncomingFrame {
            buf: Buffer::from_vec(self.in_buf.readable()[..consumed].to_vec()),
        };
        self.consume_input(consumed);
        Ok(Some(DecodedFrame { decoded, frame }))
    }

    fn consume_input(&mut self, n: usize) {
        self.in_buf.consume(n);
        self.decoder.reset(self.in_buf.begin());
    }

    fn process_pending_data(&mut self) {
        if self.is_ready() && !self.pending_outgoing.is_empty() {
            let n = self.pending_outgoing.len();
            let pending = self.pending_outgoing.readable().to_vec();
            self.outgoing.write_slice(&pending);
            self.pending_outgoing.consume(n);
        }
    }
}

/// A frame together with the header/body decoded against the
/// session's input buffer; the frame re-decodes against its own copy.
struct DecodedFrame {
    decoded: Response,
    frame: IncomingFrame,
}
