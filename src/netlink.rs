//! Netlink conntrack (ctnetlink) implementation
//!
//! This module speaks the kernel's nfnetlink conntrack protocol: it builds
//! timeout update requests and decodes conntrack messages into records.
//!
//! # Architecture
//!
//! ## Codec (portable)
//! - `structures`: netlink / nfnetlink headers, constants, alignment helpers
//! - `attr`: TLV attribute cursor, scanner and builder
//! - `conntrack`: request encoder and message decoder
//! - `message`: walks all messages of one received datagram
//!
//! ## Transport (Linux only)
//! - `socket`: `NETLINK_NETFILTER` socket management (syscalls, RAII)
//! - `client`: timeout updates and the event monitor
//!
//! The codec modules only touch byte slices, so they build and test on any
//! platform. Netlink sockets exist only on Linux, hence the `cfg` gates.

// ============================================================================
// SUBMODULE DECLARATIONS
// ============================================================================

pub mod attr; // TLV primitives
pub mod conntrack; // ctnetlink codec
pub mod message; // Datagram walking
pub mod structures; // Binary headers and constants

#[cfg(all(target_os = "linux", feature = "netlink"))]
pub mod client; // High-level operations (Linux only)
#[cfg(all(target_os = "linux", feature = "netlink"))]
pub mod socket; // Netlink socket management (Linux only)

// ============================================================================
// PUBLIC RE-EXPORTS
// ============================================================================

pub use attr::{ByteCursor, NlAttr, NlAttrBuilder, find_next_attr_of_type};
pub use conntrack::{
    ConntrackRecord, CtAttr, CtIpAttr, CtProtoAttr, CtTupleAttr, Tuple, TupleIpv4,
    new_ipv4_timeout_update_request, parse_conntrack_message,
};
pub use message::{ConntrackEvent, MessageError, ParsedMessage, parse_netlink_messages};
pub use structures::{NfGenMsg, NlMsgHdr};

#[cfg(all(target_os = "linux", feature = "netlink"))]
pub use client::{ConntrackError, ConntrackMonitor, update_conntrack_timeout};
#[cfg(all(target_os = "linux", feature = "netlink"))]
pub use socket::{NetlinkSocket, SocketError};
