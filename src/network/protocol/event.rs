use crate::frame_info::Input;

/// Notifications raised by a [`PeerHandle`](super::PeerHandle) and drained with `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The handshake is in progress. It completes once `count` reaches `total`.
    Synchronizing {
        /// Total sync roundtrips required.
        total: u32,
        /// Completed sync roundtrips so far.
        count: u32,
    },
    /// The handshake completed and the handle is running.
    Synchronized,
    /// A remote input arrived, in frame order and exactly once.
    Input(Input),
    /// Nothing was received for a while. The peer is disconnected if the silence lasts
    /// another `disconnect_timeout` milliseconds.
    NetworkInterrupted {
        /// Milliseconds left until the disconnect.
        disconnect_timeout: u128,
    },
    /// Traffic resumed after a [`PeerEvent::NetworkInterrupted`].
    NetworkResumed,
    /// The peer is gone.
    Disconnected,
}
