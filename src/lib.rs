//! Client core for the Tarantool binary protocol (IPROTO).
//!
//! This crate is the wire-protocol codec and transport state machine
//! of a client: everything between a caller-built value tree and the
//! socket, with no event loop of its own.
//!
//! - [`protocol::encoder`] frames typed requests into a [`Buffer`]:
//!   length preheader, header map, body map, back-patched size;
//! - [`protocol::decoder`] is a restartable streaming decoder that
//!   turns buffered bytes into typed responses with zero-copy tuple
//!   slices;
//! - [`protocol::greeting`] parses the 128-byte server greeting and
//!   computes the chap-sha1 scramble;
//! - [`protocol::Protocol`] is a sans-io session gluing those parts
//!   together: greeting, authentication, demultiplexing by sync;
//! - [`stream`] holds the non-blocking transports (plain and TLS)
//!   with the readiness status word the embedding event loop drives.
//!
//! Scheduling is single-threaded cooperative: nothing here blocks,
//! nothing locks, and one stream with its codec state must stay
//! confined to one task. Would-block outcomes return 0 with a
//! needs-event bit recorded in the stream status; the caller arms a
//! readiness watcher and retries.

pub mod buffer;
pub mod error;
pub mod msgpack;
pub mod protocol;
pub mod stream;
pub mod tuple;

pub use buffer::Buffer;
pub use error::Error;
pub use protocol::{Config, Protocol, SizeHint, SyncIndex};
pub use stream::{plain::PlainStream, ssl::SslStream, ConnectOptions, Stream, StreamStatus, Transport};
pub use tuple::ToTupleBuffer;

pub type Result<T> = std::result::Result<T, Error>;
