//! TLS stream layered over the plain socket transport.
//!
//! The readiness mapping is the subtle part: OpenSSL may need the
//! socket to become *readable* to finish a *write* (renegotiation,
//! mid-handshake) and vice versa, so `WANT_READ` out of a send sets
//! [`NEED_READ_EVENT_FOR_WRITE`] rather than the write-event bit.
//! A `SYSCALL` error with errno 0 is OpenSSL's rendition of the peer
//! closing one side of the socket: it becomes `EPIPE` on send and a
//! clean end-of-stream 0 on recv.
//!
//! [`NEED_READ_EVENT_FOR_WRITE`]: StreamStatus::NEED_READ_EVENT_FOR_WRITE

use std::fs;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;

use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{self, ErrorCode, SslContext, SslContextBuilder, SslFiletype, SslMethod,
                   SslVerifyMode, SslVersion};

use super::plain::PlainStream;
use super::{ConnectOptions, Stream, StreamStatus, Transport};

/// `Read`/`Write` view of the non-blocking socket for OpenSSL to
/// drive. Would-block surfaces as `io::ErrorKind::WouldBlock`, which
/// OpenSSL converts into `WANT_READ`/`WANT_WRITE`.
#[derive(Debug)]
struct FdAdapter {
    fd: RawFd,
}

impl Read for FdAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: fd stays open for the adapter's lifetime, buf is valid
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FdAdapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: fd stays open for the adapter's lifetime, buf is valid
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn stack_to_io(e: ErrorStack) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn ssl_error_to_io(e: &ssl::Error) -> io::Error {
    match e.io_error() {
        Some(io_e) => match io_e.raw_os_error() {
            Some(code) => io::Error::from_raw_os_error(code),
            None => io::Error::new(io_e.kind(), e.to_string()),
        },
        None => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}

/// Private key passwords in the order they are tried: the literal
/// option, then every line of the password file, then the empty
/// password. A passphrase is ignored by OpenSSL when the key is not
/// encrypted, so the first candidate opens unencrypted keys too.
fn passwd_candidates(opts: &ConnectOptions) -> io::Result<Vec<String>> {
    let mut candidates = Vec::new();
    if let Some(passwd) = &opts.ssl_passwd {
        candidates.push(passwd.clone());
    }
    if let Some(file) = &opts.ssl_passwd_file {
        let content = fs::read_to_string(file)?;
        candidates.extend(content.lines().map(str::to_string));
    }
    candidates.push(String::new());
    Ok(candidates)
}

fn load_private_key(
    builder: &mut SslContextBuilder,
    key_file: &Path,
    opts: &ConnectOptions,
) -> io::Result<()> {
    let pem = fs::read(key_file)?;
    for passwd in passwd_candidates(opts)? {
        if let Ok(pkey) = PKey::private_key_from_pem_passphrase(&pem, passwd.as_bytes()) {
            builder.set_private_key(&pkey).map_err(stack_to_io)?;
            return Ok(());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "failed to load the private key with any of the configured passwords",
    ))
}

/// Build the context: TLS 1.2 pinned, optional certificate, key, CA
/// and cipher configuration from the connect options.
fn create_context(opts: &ConnectOptions) -> io::Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client()).map_err(stack_to_io)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(stack_to_io)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(stack_to_io)?;

    if let Some(cert_file) = &opts.ssl_cert_file {
        builder
            .set_certificate_file(cert_file, SslFiletype::PEM)
            .map_err(stack_to_io)?;
    }
    if let Some(key_file) = &opts.ssl_key_file {
        load_private_key(&mut builder, key_file, opts)?;
    }
    if let Some(ca_file) = &opts.ssl_ca_file {
        builder.set_ca_file(ca_file).map_err(stack_to_io)?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }
    if let Some(ciphers) = &opts.ssl_ciphers {
        builder.set_cipher_list(ciphers).map_err(stack_to_io)?;
    }
    Ok(builder.build())
}

/// A stream that supports TLS. Plain connections are supported too
/// and delegate straight to the inner [`PlainStream`].
#[derive(Debug, Default)]
pub struct SslStream {
    // dropped before `plain` so the SSL state goes before the fd
    ssl: Option<ssl::SslStream<FdAdapter>>,
    plain: PlainStream,
}

impl SslStream {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn is_plain(&self) -> bool {
        self.plain.opts().transport == Transport::Plain
    }
}

impl Stream for SslStream {
    fn connect(&mut self, opts: &ConnectOptions) -> io::Result<()> {
        self.ssl = None;

        self.plain.connect_socket(opts)?;
        if opts.transport == Transport::Plain {
            return Ok(());
        }

        let ctx = match create_context(opts) {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.plain.die("SSL context create failed", e)),
        };
        let mut ssl = match ssl::Ssl::new(&ctx) {
            Ok(ssl) => ssl,
            Err(e) => return Err(self.plain.die("SSL handle create failed", stack_to_io(e))),
        };
        ssl.set_connect_state();

        let adapter = FdAdapter {
            fd: self.plain.fd(),
        };
        let mut stream = match ssl::SslStream::new(ssl, adapter) {
            Ok(stream) => stream,
            Err(e) => return Err(self.plain.die("SSL attach failed", stack_to_io(e))),
        };

        // Trigger the client-server negotiation; it completes inside
        // subsequent send/recv calls once the socket is ready.
        if let Err(e) = stream.do_handshake() {
            match e.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {}
                _ => return Err(self.plain.die("SSL handshake failed", ssl_error_to_io(&e))),
            }
        }

        self.ssl = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.ssl = None;
        self.plain.close();
    }

    fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.is_plain() {
            return self.plain.send(iov);
        }

        if !self.plain.has_status(StreamStatus::ESTABLISHED) {
            if self.plain.has_status(StreamStatus::DEAD) {
                return Err(self.plain.die(
                    "Send to dead stream",
                    io::Error::from(io::ErrorKind::NotConnected),
                ));
            }
            self.plain.check_pending()?;
        }
        let data = match iov.iter().find(|slice| !slice.is_empty()) {
            Some(slice) => &slice[..],
            None => return Ok(0),
        };

        self.plain.remove_status(StreamStatus::NEED_EVENT_FOR_WRITE);
        let result = self
            .ssl
            .as_mut()
            .expect("transport is ssl, so the handshake state exists")
            .ssl_write(data);
        match result {
            Ok(sent) => Ok(sent),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => {
                    self.plain.set_status(StreamStatus::NEED_READ_EVENT_FOR_WRITE);
                    Ok(0)
                }
                ErrorCode::WANT_WRITE => {
                    self.plain.set_status(StreamStatus::NEED_WRITE_EVENT_FOR_WRITE);
                    Ok(0)
                }
                ErrorCode::SSL => Err(self.plain.die("SSL send failed", ssl_error_to_io(&e))),
                _ => {
                    // SYSCALL with errno 0: the remote end closed the
                    // socket for reading, which is a broken pipe here
                    let errno = e
                        .io_error()
                        .and_then(|io_e| io_e.raw_os_error())
                        .unwrap_or(0);
                    let err = if errno == 0 {
                        io::Error::from_raw_os_error(libc::EPIPE)
                    } else {
                        io::Error::from_raw_os_error(errno)
                    };
                    Err(self.plain.die("Send failed", err))
                }
            },
        }
    }

    fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        if self.is_plain() {
            return self.plain.recv(iov);
        }

        if !self.plain.has_status(StreamStatus::ESTABLISHED) {
            if self.plain.has_status(StreamStatus::DEAD) {
                return Err(self.plain.die(
                    "Recv from dead stream",
                    io::Error::from(io::ErrorKind::NotConnected),
                ));
            }
            return Err(self.plain.die(
                "Recv from pending stream",
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        }
        let data = match iov.iter_mut().find(|slice| !slice.is_empty()) {
            Some(slice) => &mut slice[..],
            None => return Ok(0),
        };

        self.plain.remove_status(StreamStatus::NEED_EVENT_FOR_READ);
        let result = self
            .ssl
            .as_mut()
            .expect("transport is ssl, so the handshake state exists")
            .ssl_read(data);
        match result {
            Ok(rcvd) => Ok(rcvd),
            Err(e) => match e.code() {
                ErrorCode::ZERO_RETURN => Ok(0),
                ErrorCode::WANT_READ => {
                    self.plain.set_status(StreamStatus::NEED_READ_EVENT_FOR_READ);
                    Ok(0)
                }
                ErrorCode::WANT_WRITE => {
                    self.plain.set_status(StreamStatus::NEED_WRITE_EVENT_FOR_READ);
                    Ok(0)
                }
                ErrorCode::SSL => Err(self.plain.die("SSL recv failed", ssl_error_to_io(&e))),
                _ => {
                    let errno = e
                        .io_error()
                        .and_then(|io_e| io_e.raw_os_error())
                        .unwrap_or(0);
                    if errno == 0 {
                        // the remote end closed the socket for
                        // writing; plain end-of-stream
                        Ok(0)
                    } else {
                        Err(self
                            .plain
                            .die("Recv failed", io::Error::from_raw_os_error(errno)))
                    }
                }
            },
        }
    }

    fn status(&self) -> StreamStatus {
        self.plain.status()
    }
}
