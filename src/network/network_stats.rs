/// Statistics about the connection to one remote peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// The number of inputs that have been sent but not acknowledged yet.
    /// A long queue points to high latency or packet loss.
    pub send_queue_len: usize,
    /// The round-trip time in milliseconds, measured with quality reports.
    pub ping: u128,
    /// The estimated outgoing bandwidth in kilobytes per second, including UDP header overhead.
    pub kbps_sent: usize,
    /// The number of envelopes sent to this peer so far.
    pub packets_sent: usize,

    /// How many frames the local simulation is behind the remote one, as last measured.
    /// For example, if the local client is running frame 1002 and the remote client
    /// frame 1009, this will be roughly 7.
    pub local_frames_behind: i32,
    /// The same as [`local_frames_behind`], from the remote peer's perspective.
    ///
    /// [`local_frames_behind`]: #structfield.local_frames_behind
    pub remote_frames_behind: i32,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            send_queue_len,
            ping,
            kbps_sent,
            packets_sent,
            local_frames_behind,
            remote_frames_behind,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, queue: {}, kbps: {}, packets: {}, local_behind: {}, remote_behind: {} }}",
            ping, send_queue_len, kbps_sent, packets_sent, local_frames_behind, remote_frames_behind
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_network_stats_default() {
        let stats = NetworkStats::new();
        assert_eq!(stats.send_queue_len, 0);
        assert_eq!(stats.ping, 0);
        assert_eq!(stats.kbps_sent, 0);
        assert_eq!(stats.local_frames_behind, 0);
    }

    #[test]
    fn test_network_stats_display() {
        let stats = NetworkStats {
            send_queue_len: 3,
            ping: 48,
            kbps_sent: 12,
            packets_sent: 400,
            local_frames_behind: -2,
            remote_frames_behind: 2,
        };
        let text = stats.to_string();
        assert!(text.contains("ping: 48ms"));
        assert!(text.contains("queue: 3"));
        assert!(text.contains("packets: 400"));
        assert!(text.contains("local_behind: -2"));
    }
}
