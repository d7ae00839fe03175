//! Netlink socket management
//!
//! Safe wrapper around an `AF_NETLINK` / `NETLINK_NETFILTER` socket.
//! The socket is closed when the wrapper is dropped (RAII).
//!
//! # Platform Support
//!
//! **Linux only:** Netlink is a Linux-specific kernel interface.
//!
//! ## Unsafe Rust
//!
//! `socket()`, `bind()`, `setsockopt()`, `sendto()` and `recv()` are libc
//! calls on raw pointers. Each call sits in its own `unsafe` block, checks
//! its return value and closes the descriptor on the error paths of `new()`.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;
use tracing::debug;

use crate::SocketConfig;

/// Errors that can occur during Netlink socket operations
///
/// Carries the failing syscall as context and keeps the `io::ErrorKind`
/// so callers can tell timeouts apart from real failures.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SocketError {
    message: String,
    kind: io::ErrorKind,
    raw_os_error: Option<i32>,
}

impl SocketError {
    fn new(message: String, kind: io::ErrorKind) -> Self {
        Self {
            message,
            kind,
            raw_os_error: None,
        }
    }

    fn from_io_error(context: &str, err: io::Error) -> Self {
        Self {
            message: format!("{context}: {err}"),
            kind: err.kind(),
            raw_os_error: err.raw_os_error(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// errno of the failed syscall, if there was one
    #[must_use]
    pub const fn raw_os_error(&self) -> Option<i32> {
        self.raw_os_error
    }

    /// Receive timed out (SO_RCVTIMEO expired)
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == io::ErrorKind::WouldBlock || self.kind == io::ErrorKind::TimedOut
    }
}

/// Netlink socket wrapper with automatic cleanup
///
/// # Example
///
/// ```no_run
/// use ctnetlink::SocketConfig;
/// use ctnetlink::netlink::socket::NetlinkSocket;
///
/// let socket = NetlinkSocket::new(&SocketConfig::default())?;
/// # let request_bytes = vec![0u8; 80];
/// socket.send(&request_bytes)?;
/// let mut buffer = vec![0u8; 32768];
/// let len = socket.recv(&mut buffer)?;
/// # Ok::<(), ctnetlink::netlink::socket::SocketError>(())
/// ```
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Create a `NETLINK_NETFILTER` socket bound to the configured groups
    ///
    /// 1. Create the socket
    /// 2. Bind with `nl_pid = 0` (kernel assigns) and the group mask
    /// 3. Apply `SO_RCVBUF` and `SO_RCVTIMEO`
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if any of the syscalls fail. Subscribing to
    /// conntrack groups or changing entries requires `CAP_NET_ADMIN`.
    pub fn new(config: &SocketConfig) -> Result<Self, SocketError> {
        // === STEP 1: Create Netlink socket ===
        //
        // SAFETY: plain syscall with constant arguments; the return value is checked.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error("socket() failed", err));
        }

        // From here on the descriptor is owned by `socket` and closed on drop
        let socket = Self { fd };

        // === STEP 2: Bind socket to kernel ===
        //
        // SAFETY: sockaddr_nl is POD, so all-zeros is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0;
        addr.nl_groups = config.group_mask();

        // SAFETY: addr is a live sockaddr_nl and the length matches its type.
        let ret = unsafe {
            libc::bind(
                socket.fd,
                (&raw const addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error("bind() failed", err));
        }

        // === STEP 3: Set socket options ===
        //
        // Event bursts (e.g. a conntrack flush) overflow the default
        // receive buffer, so it is sized from the configuration.
        let rcvbuf = libc::c_int::try_from(config.recv_buffer_size).unwrap_or(libc::c_int::MAX);
        socket.set_option(libc::SO_RCVBUF, &rcvbuf, "setsockopt(SO_RCVBUF) failed")?;

        let timeout = libc::timeval {
            tv_sec: libc::time_t::try_from(config.recv_timeout_secs).unwrap_or(libc::time_t::MAX),
            tv_usec: 0,
        };
        socket.set_option(libc::SO_RCVTIMEO, &timeout, "setsockopt(SO_RCVTIMEO) failed")?;

        debug!(
            fd = socket.fd,
            groups = config.group_mask(),
            "netfilter netlink socket ready"
        );
        Ok(socket)
    }

    fn set_option<T>(&self, option: libc::c_int, value: &T, context: &str) -> Result<(), SocketError> {
        // SAFETY: value points to a live T and the length is size_of::<T>().
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                option,
                (value as *const T).cast::<libc::c_void>(),
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error(context, err));
        }
        Ok(())
    }

    /// Send one request to the kernel
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if `sendto()` fails or sends fewer bytes than given.
    pub fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        // SAFETY: sockaddr_nl is POD, so all-zeros is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0; // Kernel

        // SAFETY: data is valid for data.len() bytes; addr as in bind().
        let ret = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr().cast::<libc::c_void>(),
                data.len(),
                0,
                (&raw const addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error("sendto() failed", err));
        }

        if ret as usize != data.len() {
            return Err(SocketError::new(
                format!("Short send: sent {} of {} bytes", ret, data.len()),
                io::ErrorKind::WriteZero,
            ));
        }

        Ok(())
    }

    /// Receive one datagram into `buffer`
    ///
    /// # Returns
    ///
    /// Number of bytes received
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if `recv()` fails; check
    /// [`SocketError::is_timeout`] for an expired receive timeout.
    pub fn recv(&self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        // SAFETY: buffer is valid for writes of buffer.len() bytes.
        let ret = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr().cast::<libc::c_void>(),
                buffer.len(),
                0,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut {
                return Err(SocketError::new("recv() timeout".to_string(), err.kind()));
            }
            return Err(SocketError::from_io_error("recv() failed", err));
        }

        Ok(ret as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // Errors are ignored: there is nothing left to do with the descriptor.
        //
        // SAFETY: fd was returned by socket() and is closed exactly once here.
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_creation() {
        // Plain sockets without groups work unprivileged on most kernels,
        // but sandboxes may forbid AF_NETLINK entirely
        match NetlinkSocket::new(&SocketConfig::default()) {
            Ok(_socket) => {}
            Err(e) => eprintln!("Socket creation failed (expected in sandboxes): {e}"),
        }
    }

    #[test]
    fn test_timeout_classification() {
        let err = SocketError::new("recv() timeout".to_string(), io::ErrorKind::WouldBlock);
        assert!(err.is_timeout());
        assert_eq!(err.raw_os_error(), None);

        let err = SocketError::from_io_error(
            "recv() failed",
            io::Error::from_raw_os_error(libc::ENOBUFS),
        );
        assert!(!err.is_timeout());
        assert_eq!(err.raw_os_error(), Some(libc::ENOBUFS));
        assert!(err.to_string().starts_with("recv() failed: "));
    }
}
