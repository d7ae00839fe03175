// ============================================================================
// CONNTRACK NETLINK LIBRARY
// ============================================================================
// This library talks to the Linux connection tracking subsystem over
// nfnetlink (ctnetlink).
//
// === KEY FEATURES ===
// 1. Build requests that replace the timeout of an IPv4 conntrack entry
// 2. Decode conntrack messages (tuples, status bits, timeout) from raw bytes
// 3. Walk multi-message datagrams, including kernel ACKs and errors
// 4. Subscribe to conntrack NEW/UPDATE/DESTROY events (Linux)
//
// === DECODING GUARANTEES ===
// - Every read is bounds checked; malformed input never panics
// - A message shorter than its declared length is rejected as a whole
// - Missing or malformed optional attributes only default their own field

use serde::{Deserialize, Serialize};

// === MODULE DECLARATIONS ===
pub mod netlink;

pub use netlink::{
    ConntrackEvent, ConntrackRecord, MessageError, ParsedMessage, Tuple,
    new_ipv4_timeout_update_request, parse_conntrack_message, parse_netlink_messages,
};

#[cfg(all(target_os = "linux", feature = "netlink"))]
pub use netlink::{ConntrackError, ConntrackMonitor, NetlinkSocket, update_conntrack_timeout};

// ============================================================================
// CONSTANTS: SOCKET DEFAULTS
// ============================================================================
// A conntrack flush can emit thousands of DESTROY events at once, so the
// receive buffer is larger than the kernel default.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 32768; // 32KB
pub const DEFAULT_RECV_TIMEOUT_SECS: u64 = 1; // recv() returns WouldBlock after this

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Socket settings, loadable from JSON
///
/// Every field is optional in the JSON document; missing fields take the
/// defaults above.
///
/// ```json
/// { "recv_buffer_size": 262144, "recv_timeout_secs": 2, "groups": [1, 3] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// SO_RCVBUF in bytes
    pub recv_buffer_size: usize,
    /// SO_RCVTIMEO in seconds (0 blocks forever)
    pub recv_timeout_secs: u64,
    /// nfnetlink multicast groups (NFNLGRP_*) to join
    pub groups: Vec<u32>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            recv_timeout_secs: DEFAULT_RECV_TIMEOUT_SECS,
            groups: Vec::new(),
        }
    }
}

impl SocketConfig {
    /// Defaults plus the three conntrack event groups
    #[must_use]
    pub fn conntrack_events() -> Self {
        use netlink::structures::{
            NFNLGRP_CONNTRACK_DESTROY, NFNLGRP_CONNTRACK_NEW, NFNLGRP_CONNTRACK_UPDATE,
        };

        Self {
            groups: vec![
                NFNLGRP_CONNTRACK_NEW,
                NFNLGRP_CONNTRACK_UPDATE,
                NFNLGRP_CONNTRACK_DESTROY,
            ],
            ..Self::default()
        }
    }

    /// Bitmask for `sockaddr_nl.nl_groups`
    ///
    /// Only groups 1-32 fit the legacy bind mask; others are ignored.
    #[must_use]
    pub fn group_mask(&self) -> u32 {
        self.groups.iter().fold(0, |mask, &group| {
            mask | netlink::structures::nfnl_group_mask(group)
        })
    }
}
