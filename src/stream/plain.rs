//! Plain (non-encrypted) stream over a non-blocking socket.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::unix::io::RawFd;

use super::resolve::{AddrInfo, Candidate};
use super::{ConnectOptions, Stream, StreamStatus, StatusWord, Transport};

fn cvt(t: libc::c_int) -> io::Result<libc::c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

pub(crate) fn check_socket_error(fd: RawFd) -> io::Result<()> {
    let mut val: libc::c_int = 0;
    let mut val_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the out-pointers are valid for the duration of the call
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut val as *mut libc::c_int as *mut _,
            &mut val_len,
        )
    })?;
    match val {
        0 => Ok(()),
        v => Err(io::Error::from_raw_os_error(v)),
    }
}

#[cfg(target_os = "linux")]
fn nonblocking_socket(candidate: &Candidate) -> io::Result<RawFd> {
    // SAFETY: plain syscall, no pointers involved
    let fd = cvt(unsafe {
        libc::socket(
            candidate.family,
            candidate.socktype | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            candidate.protocol,
        )
    })?;
    Ok(fd)
}

#[cfg(target_os = "macos")]
fn nonblocking_socket(candidate: &Candidate) -> io::Result<RawFd> {
    // SAFETY: plain syscall, no pointers involved
    let fd = cvt(unsafe { libc::socket(candidate.family, candidate.socktype, candidate.protocol) })?;
    // SAFETY: fd is open; ioctl arguments are valid
    let rc = unsafe {
        libc::ioctl(fd, libc::FIOCLEX)
            | libc::ioctl(fd, libc::FIONBIO, &mut 1)
    };
    if rc != 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// A non-blocking stream without encryption.
///
/// Created dead; [`connect`](Stream::connect) walks the resolved
/// candidates and leaves the stream established or dead. The fd is
/// closed on drop.
#[derive(Debug)]
pub struct PlainStream {
    fd: RawFd,
    status: StatusWord,
    opts: ConnectOptions,
}

impl Default for PlainStream {
    fn default() -> Self {
        PlainStream {
            fd: -1,
            status: StatusWord::default(),
            opts: ConnectOptions::default(),
        }
    }
}

impl PlainStream {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn opts(&self) -> &ConnectOptions {
        &self.opts
    }

    /// Record a fatal condition: log it, mark the stream dead and
    /// hand the error back for propagation.
    pub(crate) fn die(&mut self, msg: &str, err: io::Error) -> io::Error {
        log::error!("{}: {} (fd {})", msg, err, self.fd);
        self.status.set(StreamStatus::DEAD);
        err
    }

    fn tell(&mut self, st: StreamStatus, msg: &str) {
        log::debug!("{}: {} (fd {})", msg, self.opts, self.fd);
        self.status.set(st);
    }

    pub(crate) fn set_status(&mut self, st: StreamStatus) {
        self.status.set(st);
    }

    pub(crate) fn remove_status(&mut self, st: StreamStatus) {
        self.status.remove(st);
    }

    /// Finish a connect that was left pending: a writable socket with
    /// zero `SO_ERROR` is established, anything else is fatal.
    pub(crate) fn check_pending(&mut self) -> io::Result<()> {
        debug_assert!(self.status.has(StreamStatus::CONNECT_PENDING));
        match check_socket_error(self.fd) {
            Ok(()) => {
                self.tell(StreamStatus::ESTABLISHED, "Pending connected");
                Ok(())
            }
            Err(e) => Err(self.die("Failed to connect", e)),
        }
    }

    fn connect_candidate(&mut self, candidate: &Candidate) -> io::Result<()> {
        self.fd = nonblocking_socket(candidate)?;
        loop {
            // SAFETY: candidate addr outlives the call, fd is open
            let rc =
                unsafe { libc::connect(self.fd, candidate.sockaddr(), candidate.addr_len()) };
            if rc == 0 {
                self.tell(StreamStatus::ESTABLISHED, "Connected");
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {
                    self.status.set(StreamStatus::CONNECT_PENDING);
                    self.wait_writable()?;
                    return match check_socket_error(self.fd) {
                        Ok(()) => {
                            self.tell(StreamStatus::ESTABLISHED, "Pending connected");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                }
                _ => return Err(err),
            }
        }
    }

    /// Poll the fd for writability up to the configured connect
    /// timeout.
    fn wait_writable(&mut self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let timeout_ms = self
            .opts
            .connect_timeout
            .saturating_mul(1000)
            .min(i32::MAX as u64) as libc::c_int;
        loop {
            // SAFETY: pfd is valid for the duration of the call
            match cvt(unsafe { libc::poll(&mut pfd, 1, timeout_ms) }) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve and connect the socket, ignoring the transport kind.
    /// Shared by the plain and the TLS connect paths.
    pub(crate) fn connect_socket(&mut self, opts: &ConnectOptions) -> io::Result<()> {
        if !self.status.has(StreamStatus::DEAD) {
            return Err(self.die(
                "Double connect",
                io::Error::from(io::ErrorKind::AlreadyExists),
            ));
        }

        self.opts = opts.clone();

        let addr_info = AddrInfo::resolve(&opts.address, &opts.service);
        if addr_info.last_rc() != 0 {
            let err = io::Error::new(io::ErrorKind::Other, addr_info.last_error());
            return Err(self.die("Network address resolve failed", err));
        }

        let mut last_error: Option<io::Error> = None;
        for candidate in &addr_info {
            match self.connect_candidate(candidate) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let _ = self.close_fd();
                    last_error = Some(e);
                }
            }
        }
        let err = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no address candidates"));
        Err(self.die("Failed to connect", err))
    }

    fn close_fd(&mut self) -> io::Result<()> {
        if self.fd < 0 {
            return Ok(());
        }
        // SAFETY: fd is open and closed exactly once
        let rc = unsafe { libc::close(self.fd) };
        self.fd = -1;
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Stream for PlainStream {
    fn connect(&mut self, opts: &ConnectOptions) -> io::Result<()> {
        if opts.transport != Transport::Plain {
            return Err(self.die(
                "Non-plain transport is unsupported by this stream",
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        self.connect_socket(opts)
    }

    fn close(&mut self) {
        if self.fd < 0 {
            return;
        }
        match self.close_fd() {
            Ok(()) => self.tell(StreamStatus::DEAD, "Socket closed"),
            Err(e) => {
                self.die("Socket close error", e);
            }
        }
    }

    fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        if !self.status.has(StreamStatus::ESTABLISHED) {
            if self.status.has(StreamStatus::DEAD) {
                return Err(self.die(
                    "Send to dead stream",
                    io::Error::from(io::ErrorKind::NotConnected),
                ));
            }
            self.check_pending()?;
        }
        if iov.is_empty() {
            return Ok(0);
        }

        self.status.remove(StreamStatus::NEED_EVENT_FOR_WRITE);
        // SAFETY: an all-zeroes msghdr is a valid value
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        // IoSlice is ABI-compatible with iovec
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len() as _;
        loop {
            let flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
            // SAFETY: msg and the iovecs it refers to are live across the call
            let sent = unsafe { libc::sendmsg(self.fd, &msg, flags) };

            if sent >= 0 {
                return Ok(sent as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                    self.status.set(StreamStatus::NEED_WRITE_EVENT_FOR_WRITE);
                    return Ok(0);
                }
                _ => return Err(self.die("Send failed", err)),
            }
        }
    }

    fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        if !self.status.has(StreamStatus::ESTABLISHED) {
            if self.status.has(StreamStatus::DEAD) {
                return Err(self.die(
                    "Recv from dead stream",
                    io::Error::from(io::ErrorKind::NotConnected),
                ));
            }
            return Err(self.die(
                "Recv from pending stream",
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        }
        if iov.is_empty() {
            return Ok(0);
        }

        self.status.remove(StreamStatus::NEED_EVENT_FOR_READ);
        // SAFETY: an all-zeroes msghdr is a valid value
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        // IoSliceMut is ABI-compatible with iovec
        msg.msg_iov = iov.as_mut_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len() as _;
        loop {
            let flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
            // SAFETY: msg and the iovecs it refers to are live across the call
            let rcvd = unsafe { libc::recvmsg(self.fd, &mut msg, flags) };

            if rcvd > 0 {
                return Ok(rcvd as usize);
            }
            if rcvd == 0 {
                return Err(self.die(
                    "Peer shutdown",
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                ));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                    self.status.set(StreamStatus::NEED_READ_EVENT_FOR_READ);
                    return Ok(0);
                }
                _ => return Err(self.die("Recv failed", err)),
            }
        }
    }

    fn status(&self) -> StreamStatus {
        self.status.get()
    }
}

impl Drop for PlainStream {
    fn drop(&mut self) {
        if let Err(e) = self.close_fd() {
            log::error!("failed closing socket descriptor: {}", e);
        }
    }
}
