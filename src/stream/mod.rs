//! Non-blocking stream transports.
//!
//! A stream carries framed packets over a socket it never blocks on.
//! Would-block outcomes are not errors: the operation returns 0 and
//! the status word records which readiness event (read or write) is
//! required for which user operation to make progress. The embedding
//! event loop observes the status after every call, arms its watcher
//! accordingly and retries the same operation on wakeup.

pub mod plain;
pub mod resolve;
pub mod ssl;

use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::path::PathBuf;

use bitflags::bitflags;

bitflags! {
    /// Stream status word. Exactly one readiness bit of
    /// {[`DEAD`](Self::DEAD), [`CONNECT_PENDING`](Self::CONNECT_PENDING),
    /// [`ESTABLISHED`](Self::ESTABLISHED)} is set at all times, plus
    /// any needs-event bits. The whole word lives in one `u32` so an
    /// event loop observes readiness and pending-event state in one
    /// load.
    pub struct StreamStatus: u32 {
        /// The stream was not opened or was closed.
        const DEAD = 1 << 0;
        /// Non-blocking connect was initiated.
        const CONNECT_PENDING = 1 << 1;
        /// Connection was established.
        const ESTABLISHED = 1 << 2;
        /// Mask of the statuses above.
        const READINESS_STATUS = Self::DEAD.bits | Self::CONNECT_PENDING.bits | Self::ESTABLISHED.bits;

        /// Non-blocking read requires a 'read' event on the socket.
        const NEED_READ_EVENT_FOR_READ = 1 << 5;
        /// Non-blocking write requires a 'read' event on the socket.
        const NEED_READ_EVENT_FOR_WRITE = 1 << 6;
        /// Non-blocking i/o requires a 'read' event on the socket.
        const NEED_READ_EVENT = Self::NEED_READ_EVENT_FOR_READ.bits | Self::NEED_READ_EVENT_FOR_WRITE.bits;

        /// Non-blocking read requires a 'write' event on the socket.
        const NEED_WRITE_EVENT_FOR_READ = 1 << 8;
        /// Non-blocking write requires a 'write' event on the socket.
        const NEED_WRITE_EVENT_FOR_WRITE = 1 << 9;
        /// Non-blocking i/o requires a 'write' event on the socket.
        const NEED_WRITE_EVENT = Self::NEED_WRITE_EVENT_FOR_READ.bits
            | Self::NEED_WRITE_EVENT_FOR_WRITE.bits
            | Self::CONNECT_PENDING.bits;

        /// Non-blocking read requires some event on the socket.
        const NEED_EVENT_FOR_READ = Self::NEED_READ_EVENT_FOR_READ.bits | Self::NEED_WRITE_EVENT_FOR_READ.bits;
        /// Non-blocking write requires some event on the socket.
        const NEED_EVENT_FOR_WRITE = Self::NEED_READ_EVENT_FOR_WRITE.bits | Self::NEED_WRITE_EVENT_FOR_WRITE.bits;
    }
}

/// The status word with its update discipline: setting a readiness
/// bit replaces the previous readiness state and clears event bits,
/// setting an event bit accumulates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusWord(StreamStatus);

impl Default for StatusWord {
    fn default() -> Self {
        StatusWord(StreamStatus::DEAD)
    }
}

impl StatusWord {
    #[inline]
    pub fn get(&self) -> StreamStatus {
        self.0
    }

    #[inline]
    pub fn has(&self, st: StreamStatus) -> bool {
        self.0.intersects(st)
    }

    pub fn set(&mut self, st: StreamStatus) {
        if st.intersects(StreamStatus::READINESS_STATUS) {
            self.0 = st;
        } else {
            self.0 |= st;
        }
        debug_assert!(
            self.has(StreamStatus::ESTABLISHED)
                || (self.0 & !StreamStatus::READINESS_STATUS).is_empty(),
            "event bits may only accompany an established stream"
        );
        debug_assert!(
            !(self.has(StreamStatus::NEED_READ_EVENT_FOR_READ)
                && self.has(StreamStatus::NEED_WRITE_EVENT_FOR_READ)),
            "at most one event may be pending per direction"
        );
        debug_assert!(
            !(self.has(StreamStatus::NEED_READ_EVENT_FOR_WRITE)
                && self.has(StreamStatus::NEED_WRITE_EVENT_FOR_WRITE)),
            "at most one event may be pending per direction"
        );
    }

    pub fn remove(&mut self, st: StreamStatus) {
        debug_assert!(!st.intersects(StreamStatus::READINESS_STATUS));
        self.0.remove(st);
    }
}

/// Desired transport of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Simple non-encrypted stream.
    Plain,
    /// SSL encrypted stream.
    Ssl,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Plain
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain => f.write_str("plain"),
            Transport::Ssl => f.write_str("SSL"),
        }
    }
}

pub const DEFAULT_CONNECT_TIMEOUT: u64 = 2;

/// Common connection options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server address or unix socket path.
    pub address: String,
    /// Internet service or port; empty or `"unix"` for a unix domain
    /// socket.
    pub service: String,
    /// Desired transport. Actual stream can reject some values.
    pub transport: Transport,
    /// Time span limit for connection establishment, in seconds.
    pub connect_timeout: u64,

    /// Optional login and password.
    pub user: String,
    pub passwd: String,

    /// SSL settings.
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub ssl_ca_file: Option<PathBuf>,
    pub ssl_ciphers: Option<String>,
    /// Private key password, tried first.
    pub ssl_passwd: Option<String>,
    /// File whose lines are candidate private key passwords, tried
    /// after `ssl_passwd` and before the empty password.
    pub ssl_passwd_file: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            address: String::new(),
            service: String::new(),
            transport: Transport::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user: String::new(),
            passwd: String::new(),
            ssl_cert_file: None,
            ssl_key_file: None,
            ssl_ca_file: None,
            ssl_ciphers: None,
            ssl_passwd: None,
            ssl_passwd_file: None,
        }
    }
}

impl fmt::Display for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if !self.service.is_empty() {
            write!(f, ":{}", self.service)?;
        }
        if self.transport != Transport::Plain {
            write!(f, "({})", self.transport)?;
        }
        Ok(())
    }
}

/// A connected byte stream over a non-blocking socket.
///
/// `send` and `recv` return `Ok(n > 0)` on progress and `Ok(0)` when
/// nothing could be moved; in the would-block case the status word
/// says which event unblocks which operation. Fatal conditions come
/// back as `Err` with the stream moved to [`StreamStatus::DEAD`],
/// after which all further i/o is rejected.
pub trait Stream {
    /// Connect per `opts`. Refused unless the stream is dead. A
    /// connection still pending when the timeout elapses counts as a
    /// failed candidate.
    fn connect(&mut self, opts: &ConnectOptions) -> io::Result<()>;

    /// Close the underlying socket. Reentrant.
    fn close(&mut self);

    /// Vectored send with no blocking and no SIGPIPE.
    fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Vectored receive. `Ok(0)` with no needs-event bit set means
    /// the peer performed an orderly TLS shutdown.
    fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    fn status(&self) -> StreamStatus;

    fn has_status(&self, st: StreamStatus) -> bool {
        self.status().intersects(st)
    }
}
