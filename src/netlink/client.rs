//! High-level conntrack operations over a netfilter netlink socket
//!
//! This is the glue between the codec and the socket:
//! 1. Build the request bytes
//! 2. Send them to the kernel
//! 3. Receive and walk the reply datagram
//! 4. Map kernel errnos to [`ConntrackError`]
//!
//! Two entry points:
//! - [`update_conntrack_timeout`] - replace the timeout of one IPv4 entry
//! - [`ConntrackMonitor`] - receive NEW/UPDATE/DESTROY events as records

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, warn};

use crate::SocketConfig;
use crate::netlink::conntrack::{ConntrackRecord, new_ipv4_timeout_update_request};
use crate::netlink::message::{ConntrackEvent, MessageError, ParsedMessage, parse_netlink_messages};
use crate::netlink::socket::{NetlinkSocket, SocketError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors from conntrack operations
#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// No conntrack entry matches the tuple (ENOENT)
    #[error("Conntrack entry not found")]
    NotFound,

    /// EPERM / EACCES
    #[error("Permission denied (need CAP_NET_ADMIN)")]
    PermissionDenied,

    #[error("Kernel returned error: errno {0}")]
    Kernel(i32),

    #[error("No acknowledgement received from kernel")]
    NoAck,
}

impl ConntrackError {
    const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Self::NotFound,
            libc::EPERM | libc::EACCES => Self::PermissionDenied,
            other => Self::Kernel(other),
        }
    }
}

// ============================================================================
// TIMEOUT UPDATE
// ============================================================================

/// Replace the timeout of the conntrack entry matching an IPv4 flow
///
/// The request asks for an ACK, so the reply is a single `NLMSG_ERROR`
/// message carrying errno 0 on success.
///
/// # Errors
///
/// * `ConntrackError::NotFound` - no entry for this tuple
/// * `ConntrackError::PermissionDenied` - missing `CAP_NET_ADMIN`
/// * `ConntrackError::NoAck` - the reply held no `NLMSG_ERROR`
/// * socket and message errors otherwise
///
/// # Example
///
/// ```no_run
/// # use ctnetlink::SocketConfig;
/// # use ctnetlink::netlink::socket::NetlinkSocket;
/// # use ctnetlink::netlink::client::update_conntrack_timeout;
/// # use std::net::Ipv4Addr;
/// let socket = NetlinkSocket::new(&SocketConfig::default())?;
/// update_conntrack_timeout(
///     &socket,
///     6,
///     Ipv4Addr::new(192, 168, 80, 12),
///     62449,
///     Ipv4Addr::new(140, 112, 8, 116),
///     433,
///     120,
/// )?;
/// # Ok::<(), ctnetlink::netlink::client::ConntrackError>(())
/// ```
pub fn update_conntrack_timeout(
    socket: &NetlinkSocket,
    proto: u8,
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    timeout_secs: u32,
) -> Result<(), ConntrackError> {
    let request = new_ipv4_timeout_update_request(proto, src, sport, dst, dport, timeout_secs);
    socket.send(&request)?;

    // An ACK is 36 bytes; an error echoes the request after the errno
    let mut buffer = vec![0u8; 4096];
    let len = socket.recv(&mut buffer)?;

    for msg in parse_netlink_messages(&buffer[..len])? {
        if let ParsedMessage::Error(errno) = msg {
            if errno == 0 {
                debug!(%src, sport, %dst, dport, timeout_secs, "conntrack timeout updated");
                return Ok(());
            }
            return Err(ConntrackError::from_errno(errno));
        }
    }

    Err(ConntrackError::NoAck)
}

// ============================================================================
// EVENT MONITOR
// ============================================================================

/// Receives conntrack events from the kernel multicast groups
pub struct ConntrackMonitor {
    socket: NetlinkSocket,
    buffer: Vec<u8>,
}

impl ConntrackMonitor {
    /// Open a socket subscribed to `config.groups`
    ///
    /// # Errors
    ///
    /// Returns `ConntrackError::Socket` if the socket cannot be created or bound.
    pub fn subscribe(config: &SocketConfig) -> Result<Self, ConntrackError> {
        let socket = NetlinkSocket::new(config)?;
        Ok(Self {
            socket,
            buffer: vec![0u8; config.recv_buffer_size.max(4096)],
        })
    }

    /// Receive one datagram and decode the conntrack records in it
    ///
    /// Returns an empty batch when the receive timeout expires, and also
    /// after `ENOBUFS`, which means the kernel dropped events because the
    /// receive buffer was full.
    ///
    /// # Errors
    ///
    /// Any other socket error, or a malformed datagram.
    pub fn next_batch(&mut self) -> Result<Vec<(ConntrackEvent, ConntrackRecord)>, ConntrackError> {
        let len = match self.socket.recv(&mut self.buffer) {
            Ok(len) => len,
            Err(e) if e.is_timeout() => return Ok(Vec::new()),
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("conntrack events lost: socket receive buffer overrun");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let events = parse_netlink_messages(&self.buffer[..len])?
            .into_iter()
            .filter_map(|msg| match msg {
                ParsedMessage::Conntrack { event, record } => Some((event, record)),
                _ => None,
            })
            .collect();
        Ok(events)
    }
}
