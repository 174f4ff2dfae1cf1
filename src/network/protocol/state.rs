//! Connection state machine of a [`PeerHandle`](super::PeerHandle).
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                                                               │
//! │   ┌─────────┐   num_sync_packets matching   ┌─────────┐       │
//! │   │ Syncing │ ─────────────────────────────►│ Running │◄──┐   │
//! │   └────┬────┘        SyncReply nonces       └────┬────┘   │   │
//! │        │                                         │        │   │
//! │        │                       disconnect_timeout│  resume│   │
//! │        │                                         │  ┌─────┴─────────┐
//! │        │ disconnect()                            │  │ (interrupted) │
//! │        │                                         │  └───────────────┘
//! │        ▼                                         ▼            │
//! │   ┌──────────────────────────────────────────────────┐        │
//! │   │                   Disconnected                   │        │
//! │   └──────────────────────────────────────────────────┘        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! | From    | To           | Trigger                                           |
//! |---------|--------------|---------------------------------------------------|
//! | Syncing | Running      | The last required `SyncReply` arrived             |
//! | Syncing | Disconnected | `disconnect()`                                    |
//! | Running | Disconnected | No traffic for `disconnect_timeout`, `disconnect()`, or too much unacknowledged input |
//!
//! Being interrupted is not a state of its own. A running handle raises
//! `NetworkInterrupted` after `disconnect_notify_start` of silence and
//! `NetworkResumed` once traffic returns.

/// Connection state of one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Exchanging `SyncRequest` / `SyncReply` roundtrips. No input flows yet.
    Syncing,
    /// Handshake complete. Input, quality reports and keepalives flow.
    Running,
    /// Terminal. Nothing is sent and everything received is ignored.
    Disconnected,
}

impl PeerState {
    /// Returns a static name, for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_state_names() {
        assert_eq!(PeerState::Syncing.to_string(), "Syncing");
        assert_eq!(PeerState::Running.as_str(), "Running");
        assert_eq!(format!("{:?}", PeerState::Disconnected), "Disconnected");
    }
}
