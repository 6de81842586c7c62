//! Endpoint resolution for [`connect`](super::Stream::connect).

use std::ffi::{CStr, CString};
use std::mem;
use std::os::raw::c_int;
use std::ptr;
use std::slice;

/// One connect candidate: everything `socket(2)` and `connect(2)`
/// need for an attempt.
#[derive(Clone)]
pub struct Candidate {
    pub family: c_int,
    pub socktype: c_int,
    pub protocol: c_int,
    addr: libc::sockaddr_storage,
    addr_len: libc::socklen_t,
}

impl Candidate {
    #[inline]
    pub fn sockaddr(&self) -> *const libc::sockaddr {
        &self.addr as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    #[inline]
    pub fn addr_len(&self) -> libc::socklen_t {
        self.addr_len
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("family", &self.family)
            .field("socktype", &self.socktype)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Resolved candidate list for an `(address, service)` pair.
///
/// An empty or `"unix"` service means `address` is a unix domain
/// socket path and yields a single AF_UNIX candidate; anything else
/// goes through `getaddrinfo` with AF_UNSPEC/SOCK_STREAM hints.
#[derive(Debug, Default)]
pub struct AddrInfo {
    candidates: Vec<Candidate>,
    rc: c_int,
}

impl AddrInfo {
    pub fn resolve(address: &str, service: &str) -> Self {
        if service.is_empty() || service == "unix" {
            return Self::unix(address);
        }
        Self::inet(address, service)
    }

    /// Return code of the last resolution, `getaddrinfo` convention.
    #[inline]
    pub fn last_rc(&self) -> c_int {
        self.rc
    }

    /// Human-readable description of the last failure.
    pub fn last_error(&self) -> String {
        if self.rc == 0 {
            return String::new();
        }
        // SAFETY: gai_strerror returns a pointer to a static string
        unsafe { CStr::from_ptr(libc::gai_strerror(self.rc)) }
            .to_string_lossy()
            .into_owned()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, Candidate> {
        self.candidates.iter()
    }

    fn unix(path: &str) -> Self {
        // SAFETY: an all-zeroes sockaddr_un is a valid value
        let mut unix_addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        unix_addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        // leave room for the terminating zero, truncating the path to fit
        let len = bytes.len().min(unix_addr.sun_path.len() - 1);
        for (dst, src) in unix_addr.sun_path.iter_mut().zip(&bytes[..len]) {
            *dst = *src as libc::c_char;
        }

        // SAFETY: an all-zeroes sockaddr_storage is a valid value,
        // and sockaddr_un fits into it by definition
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            ptr::copy_nonoverlapping(
                &unix_addr as *const libc::sockaddr_un as *const u8,
                &mut addr as *mut libc::sockaddr_storage as *mut u8,
                mem::size_of::<libc::sockaddr_un>(),
            );
        }

        AddrInfo {
            candidates: vec![Candidate {
                family: libc::AF_UNIX,
                socktype: libc::SOCK_STREAM,
                protocol: 0,
                addr,
                addr_len: mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            }],
            rc: 0,
        }
    }

    fn inet(address: &str, service: &str) -> Self {
        let (host, serv) = match (CString::new(address), CString::new(service)) {
            (Ok(host), Ok(serv)) => (host, serv),
            _ => {
                return AddrInfo {
                    candidates: Vec::new(),
                    rc: libc::EAI_NONAME,
                }
            }
        };

        // SAFETY: an all-zeroes addrinfo is a valid hints value
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut infos: *mut libc::addrinfo = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call
        let rc =
            unsafe { libc::getaddrinfo(host.as_ptr(), serv.as_ptr(), &hints, &mut infos) };
        if rc != 0 {
            return AddrInfo {
                candidates: Vec::new(),
                rc,
            };
        }

        let mut candidates = Vec::with_capacity(4);
        let mut current = infos;
        while !current.is_null() {
            // SAFETY: walking the list getaddrinfo allocated
            let ai = unsafe { &*current };
            if !ai.ai_addr.is_null() {
                // SAFETY: ai_addr points at ai_addrlen valid bytes,
                // which never exceed sockaddr_storage
                let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let len = (ai.ai_addrlen as usize).min(mem::size_of::<libc::sockaddr_storage>());
                unsafe {
                    ptr::copy_nonoverlapping(
                        ai.ai_addr as *const u8,
                        &mut addr as *mut libc::sockaddr_storage as *mut u8,
                        len,
                    );
                }
                candidates.push(Candidate {
                    family: ai.ai_family,
                    socktype: ai.ai_socktype,
                    protocol: ai.ai_protocol,
                    addr,
                    addr_len: ai.ai_addrlen,
                });
            }
            current = ai.ai_next;
        }
        // SAFETY: allocated by getaddrinfo above
        unsafe { libc::freeaddrinfo(infos) };

        AddrInfo { candidates, rc: 0 }
    }
}

impl<'a> IntoIterator for &'a AddrInfo {
    type Item = &'a Candidate;
    type IntoIter = slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
