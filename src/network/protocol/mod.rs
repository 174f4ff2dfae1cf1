//! Per-peer connection protocol.
//!
//! A [`PeerHandle`] owns everything the local session knows about one remote participant:
//! handshake progress, the session tokens of both sides, send and receive sequence numbers,
//! unacknowledged local input and connection quality. It never touches a socket directly.
//! Outbound envelopes collect in a send queue that the session flushes with
//! [`PeerHandle::send_all_messages`], and inbound envelopes are fed in through
//! [`PeerHandle::handle_message`].

mod event;
mod state;

pub use event::PeerEvent;
pub use state::PeerState;

use crate::frame_info::Input;
use crate::network::messages::{ConnectionStatus, Message, MessageBody};
use crate::network::network_stats::NetworkStats;
use crate::network::router::MessageHandler;
use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{report_violation, Frame, ParticipantIndex, RollbackError, Transport};
use tracing::{debug, trace};

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use web_time::{Duration, Instant};

/// Envelopes whose sequence number is further than this ahead of the expected one
/// (modulo 2^16) are treated as stale or duplicated and dropped.
pub const MAX_SEQ_DISTANCE: u16 = 1 << 15;

const UDP_HEADER_SIZE: usize = 28; // Size of IP + UDP headers

/// Returns the current wall-clock time as milliseconds since UNIX_EPOCH, or `None` if the
/// clock is before the epoch. Only used for ping timestamps, which both sides compare.
fn millis_since_epoch() -> Option<u128> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(duration) => Some(duration.as_millis()),
            Err(_) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InternalError,
                    "System time is before UNIX_EPOCH - clock may have gone backwards"
                );
                None
            },
        }
    }
    #[cfg(target_arch = "wasm32")]
    {
        let time = js_sys::Date::new_0().get_time();
        if time >= 0.0 {
            Some(time as u128)
        } else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InternalError,
                "WASM Date.getTime() returned negative value - clock may be misconfigured"
            );
            None
        }
    }
}

/// Connection state for one remote participant.
#[derive(Debug)]
pub struct PeerHandle {
    local: ParticipantIndex,
    remote: ParticipantIndex,
    state: PeerState,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    fps: usize,

    // handshake
    sync_remaining: u32,
    sync_nonce: Option<u32>,
    /// Our token. The remote stamps it on everything it sends us after the handshake.
    session_magic: u16,
    /// The remote's token, 0 until the handshake completes.
    magic_number: u16,

    // sequencing
    next_send_seq: u16,
    next_recv_seq: u16,

    send_queue: VecDeque<Message>,
    event_queue: VecDeque<PeerEvent>,

    // timers, set on the first poll
    last_send_time: Option<Instant>,
    last_recv_time: Option<Instant>,
    last_sync_request: Option<Instant>,
    last_input_resend: Option<Instant>,
    last_quality_report: Option<Instant>,
    last_stats_time: Option<Instant>,
    running_since: Option<Instant>,
    disconnect_notify_sent: bool,

    // input
    pending_output: VecDeque<Input>,
    last_sent_input: Option<Input>,
    last_recv_input_frame: Frame,
    /// Our view of every participant, attached to outbound input.
    local_connect_status: Vec<ConnectionStatus>,
    /// The remote's view of every participant, from its newest input envelope.
    peer_connect_status: Vec<ConnectionStatus>,

    // network
    packets_sent: usize,
    bytes_sent: usize,
    kbps_sent: usize,
    round_trip_time: u128,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    rng: Pcg32,
}

impl PeerHandle {
    /// Creates a handle in [`PeerState::Syncing`]. The handshake starts with the first poll.
    #[must_use]
    pub fn new(
        local: ParticipantIndex,
        remote: ParticipantIndex,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        fps: usize,
    ) -> Self {
        // mix both indices into a fixed seed so peers sharing a config still get distinct tokens
        let mut rng = match protocol_config.protocol_rng_seed {
            Some(seed) => Pcg32::seed_from_u64(
                seed ^ ((local.as_usize() as u64) << 32 | remote.as_usize() as u64),
            ),
            None => Pcg32::from_entropy(),
        };
        let mut session_magic: u16 = rng.gen();
        while session_magic == 0 {
            session_magic = rng.gen();
        }

        Self {
            local,
            remote,
            state: PeerState::Syncing,
            sync_config,
            protocol_config,
            fps,

            sync_remaining: sync_config.num_sync_packets,
            sync_nonce: None,
            session_magic,
            magic_number: 0,

            next_send_seq: 0,
            next_recv_seq: 0,

            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            last_send_time: None,
            last_recv_time: None,
            last_sync_request: None,
            last_input_resend: None,
            last_quality_report: None,
            last_stats_time: None,
            running_since: None,
            disconnect_notify_sent: false,

            pending_output: VecDeque::new(),
            last_sent_input: None,
            last_recv_input_frame: Frame::NULL,
            local_connect_status: Vec::new(),
            peer_connect_status: Vec::new(),

            packets_sent: 0,
            bytes_sent: 0,
            kbps_sent: 0,
            round_trip_time: 0,
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            rng,
        }
    }

    /// The remote participant this handle talks to.
    #[must_use]
    pub fn remote_index(&self) -> ParticipantIndex {
        self.remote
    }

    /// The local participant, stamped as `from` on every outbound envelope.
    #[must_use]
    pub fn local_index(&self) -> ParticipantIndex {
        self.local
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// `true` once the handshake has completed and the peer has not disconnected.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == PeerState::Running
    }

    /// Our session token.
    #[must_use]
    pub fn session_magic(&self) -> u16 {
        self.session_magic
    }

    /// The remote's session token, 0 before the handshake completes.
    #[must_use]
    pub fn magic_number(&self) -> u16 {
        self.magic_number
    }

    /// Sync roundtrips still required.
    #[must_use]
    pub fn sync_remaining(&self) -> u32 {
        self.sync_remaining
    }

    /// The sequence number the next inbound envelope is expected to carry.
    #[must_use]
    pub fn next_recv_seq(&self) -> u16 {
        self.next_recv_seq
    }

    /// The sequence number of the next outbound envelope.
    #[must_use]
    pub fn next_send_seq(&self) -> u16 {
        self.next_send_seq
    }

    /// The newest remote input forwarded to the session.
    #[must_use]
    pub fn last_recv_input_frame(&self) -> Frame {
        self.last_recv_input_frame
    }

    /// Number of local inputs the remote has not acknowledged yet.
    #[must_use]
    pub fn pending_output_len(&self) -> usize {
        self.pending_output.len()
    }

    /// The remote's view of `participant`, or `None` before its first input arrived.
    #[must_use]
    pub fn peer_connect_status(&self, participant: ParticipantIndex) -> Option<ConnectionStatus> {
        self.peer_connect_status.get(participant.as_usize()).copied()
    }

    /// Sets the connection statuses attached to outbound input. When a participant was
    /// newly disconnected or its disconnect frame moved, the newest input is sent again
    /// so the remote learns about it without waiting for the next frame.
    pub fn set_connect_status(&mut self, connect_status: &[ConnectionStatus]) {
        self.set_connect_status_at(connect_status, Instant::now());
    }

    /// [`set_connect_status`](Self::set_connect_status) with an explicit clock.
    pub fn set_connect_status_at(&mut self, connect_status: &[ConnectionStatus], now: Instant) {
        let disconnects_changed = connect_status.iter().enumerate().any(|(index, status)| {
            status.disconnected && self.local_connect_status.get(index) != Some(status)
        });
        self.local_connect_status.clear();
        self.local_connect_status.extend_from_slice(connect_status);

        if !disconnects_changed || self.state != PeerState::Running {
            return;
        }
        if self.pending_output.is_empty() {
            if let Some(input) = self.last_sent_input {
                self.pending_output.push_back(input);
            }
        }
        trace!(remote = %self.remote, "connection status changed; resending input");
        self.send_pending_output(now);
    }

    /// Forces the handle into [`PeerState::Disconnected`].
    pub fn disconnect(&mut self) {
        if self.state == PeerState::Disconnected {
            return;
        }
        debug!(remote = %self.remote, "disconnecting peer");
        self.state = PeerState::Disconnected;
        self.event_queue.push_back(PeerEvent::Disconnected);
    }

    /// Estimates how many frames we are behind the remote, from its newest input and half the RTT.
    pub fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame.is_null() || self.last_recv_input_frame.is_null() {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).unwrap_or(i32::MAX);
        let remote_frame =
            self.last_recv_input_frame + ping.saturating_mul(self.fps as i32) / 1000;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    /// Connection statistics.
    ///
    /// # Errors
    /// Returns [`RollbackError::NotSynchronized`] unless the handle is running.
    pub fn network_stats(&self) -> Result<NetworkStats, RollbackError> {
        if self.state != PeerState::Running {
            return Err(RollbackError::NotSynchronized);
        }
        Ok(NetworkStats {
            send_queue_len: self.pending_output.len(),
            ping: self.round_trip_time,
            kbps_sent: self.kbps_sent,
            packets_sent: self.packets_sent,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    /// Runs the timers against the current time and drains the pending events.
    pub fn poll(&mut self) -> Drain<'_, PeerEvent> {
        self.poll_at(Instant::now())
    }

    /// Runs the timers against `now` and drains the pending events.
    pub fn poll_at(&mut self, now: Instant) -> Drain<'_, PeerEvent> {
        if self.last_recv_time.is_none() {
            self.last_recv_time = Some(now);
        }

        match self.state {
            PeerState::Syncing => {
                let interval = if self.sync_remaining == self.sync_config.num_sync_packets {
                    self.sync_config.sync_first_retry_interval
                } else {
                    self.sync_config.sync_retry_interval
                };
                if elapsed(self.last_sync_request, interval, now) {
                    self.send_sync_request(now);
                }
            },
            PeerState::Running => {
                // resend unacknowledged input
                if elapsed(
                    self.last_input_resend,
                    self.sync_config.running_retry_interval,
                    now,
                ) {
                    self.send_pending_output(now);
                    self.last_input_resend = Some(now);
                }

                if elapsed(
                    self.last_quality_report,
                    self.protocol_config.quality_report_interval,
                    now,
                ) {
                    self.send_quality_report(now);
                }

                if elapsed(
                    self.last_stats_time,
                    self.protocol_config.network_stats_interval,
                    now,
                ) {
                    self.update_network_stats(now);
                }

                if elapsed(self.last_send_time, self.sync_config.keepalive_interval, now) {
                    self.queue_message(MessageBody::KeepAlive, now);
                }

                if !self.disconnect_notify_sent
                    && elapsed(
                        self.last_recv_time,
                        self.protocol_config.disconnect_notify_start,
                        now,
                    )
                {
                    let remaining = self
                        .protocol_config
                        .disconnect_timeout
                        .saturating_sub(self.protocol_config.disconnect_notify_start);
                    self.event_queue.push_back(PeerEvent::NetworkInterrupted {
                        disconnect_timeout: remaining.as_millis(),
                    });
                    self.disconnect_notify_sent = true;
                }

                if elapsed(
                    self.last_recv_time,
                    self.protocol_config.disconnect_timeout,
                    now,
                ) {
                    debug!(remote = %self.remote, "disconnect timeout");
                    self.disconnect();
                }
            },
            PeerState::Disconnected => (),
        }
        self.event_queue.drain(..)
    }

    /// Hands every queued envelope to the transport. A disconnected handle drops them instead.
    pub fn send_all_messages(&mut self, transport: &mut dyn Transport) {
        if self.state == PeerState::Disconnected {
            if !self.send_queue.is_empty() {
                trace!(
                    remote = %self.remote,
                    "Peer is disconnected; dropping {} messages",
                    self.send_queue.len()
                );
                self.send_queue.clear();
            }
            return;
        }

        if self.send_queue.is_empty() {
            return;
        }

        trace!("Sending {} messages to {}", self.send_queue.len(), self.remote);
        for msg in self.send_queue.drain(..) {
            transport.send_to(&msg, self.remote);
        }
    }

    /// Queues a local input for the remote and keeps it until acknowledged.
    pub fn send_input(&mut self, input: Input) {
        self.send_input_at(input, Instant::now());
    }

    /// [`send_input`](Self::send_input) with an explicit clock.
    pub fn send_input_at(&mut self, input: Input, now: Instant) {
        if self.state != PeerState::Running {
            return;
        }

        self.pending_output.push_back(input);
        if self.pending_output.len() > self.protocol_config.pending_output_limit {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "peer {} left {} inputs unacknowledged",
                self.remote,
                self.pending_output.len()
            );
            self.disconnect();
            return;
        }
        self.last_sent_input = Some(input);

        self.queue_message(
            MessageBody::Input {
                frame: input.frame,
                data: input.data,
                connect_status: self.local_connect_status.clone(),
            },
            now,
        );
    }

    /// Processes one inbound envelope.
    ///
    /// # Errors
    /// Returns [`RollbackError::StaleOrDuplicatePacket`] if the sequence number is too far
    /// behind. Such envelopes are dropped without touching any state.
    pub fn handle_message(&mut self, msg: &Message) -> Result<(), RollbackError> {
        self.handle_message_at(msg, Instant::now())
    }

    /// [`handle_message`](Self::handle_message) with an explicit clock.
    pub fn handle_message_at(&mut self, msg: &Message, now: Instant) -> Result<(), RollbackError> {
        trace!("Handling message from {}: {:?}", self.remote, msg);

        if self.state == PeerState::Disconnected {
            trace!("Peer is disconnected; ignoring message");
            return Ok(());
        }

        // after the handshake the remote stamps our token on everything
        if !msg.body.is_handshake() && msg.magic != self.session_magic {
            trace!(
                magic = msg.magic,
                expected = self.session_magic,
                "Received message with wrong magic; ignoring"
            );
            return Ok(());
        }

        let skipped = msg.sequence.wrapping_sub(self.next_recv_seq);
        if skipped > MAX_SEQ_DISTANCE {
            trace!(
                sequence = msg.sequence,
                expected = self.next_recv_seq,
                "dropping stale or duplicate message"
            );
            return Err(RollbackError::StaleOrDuplicatePacket {
                sequence: msg.sequence,
                expected: self.next_recv_seq,
            });
        }
        self.next_recv_seq = msg.sequence.wrapping_add(1);

        let refresh = match &msg.body {
            MessageBody::SyncRequest { random } => self.on_sync_request(*random, now),
            MessageBody::SyncReply { random } => self.on_sync_reply(msg.magic, *random, now),
            MessageBody::Input {
                frame,
                data,
                connect_status,
            } => self.on_input(Input::new(*frame, *data), connect_status, now),
            MessageBody::InputAck { ack_frame } => self.on_input_ack(*ack_frame),
            MessageBody::QualityReport {
                ping,
                frame_advantage,
            } => self.on_quality_report(*ping, *frame_advantage, now),
            MessageBody::QualityReply { pong } => self.on_quality_reply(*pong),
            MessageBody::KeepAlive | MessageBody::FrameRequest | MessageBody::FrameReply { .. } => {
                true
            },
        };

        if refresh {
            self.last_recv_time = Some(now);
            if self.disconnect_notify_sent && self.state == PeerState::Running {
                trace!("Received message on interrupted connection; sending NetworkResumed event");
                self.disconnect_notify_sent = false;
                self.event_queue.push_back(PeerEvent::NetworkResumed);
            }
        }

        crate::debug_check_invariants!(self, "PeerHandle::handle_message");
        Ok(())
    }

    /*
     *  SENDING MESSAGES
     */

    fn queue_message(&mut self, body: MessageBody, now: Instant) {
        trace!("Queuing message to {}: {:?}", self.remote, body);

        let magic = match body {
            MessageBody::SyncReply { .. } => self.session_magic,
            _ => self.magic_number,
        };
        let msg = Message {
            from: self.local,
            sequence: self.next_send_seq,
            magic,
            body,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);

        self.packets_sent += 1;
        self.last_send_time = Some(now);
        self.bytes_sent += std::mem::size_of_val(&msg);
        if let MessageBody::FrameReply { state, .. } = &msg.body {
            self.bytes_sent += state.len();
        }

        self.send_queue.push_back(msg);
    }

    /// Queues an envelope outside the regular protocol flow, such as bootstrap traffic.
    pub fn queue_body(&mut self, body: MessageBody) {
        self.queue_message(body, Instant::now());
    }

    fn send_sync_request(&mut self, now: Instant) {
        let random: u32 = self.rng.gen();
        self.sync_nonce = Some(random);
        self.last_sync_request = Some(now);
        self.queue_message(MessageBody::SyncRequest { random }, now);
    }

    fn send_pending_output(&mut self, now: Instant) {
        if self.pending_output.is_empty() {
            return;
        }
        let pending: Vec<Input> = self.pending_output.iter().copied().collect();
        trace!(remote = %self.remote, count = pending.len(), "resending unacknowledged input");
        for input in pending {
            self.queue_message(
                MessageBody::Input {
                    frame: input.frame,
                    data: input.data,
                    connect_status: self.local_connect_status.clone(),
                },
                now,
            );
        }
    }

    fn send_quality_report(&mut self, now: Instant) {
        self.last_quality_report = Some(now);

        // skip this round if the wall clock is unusable
        let Some(ping) = millis_since_epoch() else {
            trace!("Skipping quality report due to invalid system clock");
            return;
        };

        let clamped = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX));
        let frame_advantage = i16::try_from(clamped).unwrap_or(0);
        self.queue_message(
            MessageBody::QualityReport {
                ping,
                frame_advantage,
            },
            now,
        );
    }

    fn update_network_stats(&mut self, now: Instant) {
        self.last_stats_time = Some(now);
        let Some(since) = self.running_since else {
            return;
        };
        let seconds = now.saturating_duration_since(since).as_secs_f64();
        if seconds <= 0.0 {
            return;
        }
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        self.kbps_sent = (total_bytes_sent as f64 / seconds / 1024.0) as usize;
    }

    /*
     *  RECEIVING MESSAGES
     */

    fn on_sync_request(&mut self, random: u32, now: Instant) -> bool {
        self.queue_message(MessageBody::SyncReply { random }, now);
        true
    }

    /// Returns `true` only for the reply that completes the handshake.
    fn on_sync_reply(&mut self, magic: u16, random: u32, now: Instant) -> bool {
        if self.state != PeerState::Syncing {
            return false;
        }
        if self.sync_nonce != Some(random) {
            trace!(random, "ignoring sync reply with stale nonce");
            return false;
        }
        self.sync_nonce = None;
        self.sync_remaining = self.sync_remaining.saturating_sub(1);

        let total = self.sync_config.num_sync_packets;
        if self.sync_remaining > 0 {
            self.event_queue.push_back(PeerEvent::Synchronizing {
                total,
                count: total - self.sync_remaining,
            });
            self.send_sync_request(now);
            return false;
        }

        debug!(remote = %self.remote, magic, "peer synchronized");
        self.state = PeerState::Running;
        self.magic_number = magic;
        self.event_queue.push_back(PeerEvent::Synchronized);
        self.running_since = Some(now);
        self.last_input_resend = Some(now);
        self.last_quality_report = Some(now);
        self.last_stats_time = Some(now);
        true
    }

    fn on_input(
        &mut self,
        input: Input,
        connect_status: &[ConnectionStatus],
        now: Instant,
    ) -> bool {
        if self.state != PeerState::Running {
            return true;
        }

        // envelopes arrive in sequence order, so this is the remote's newest view
        if !connect_status.is_empty() {
            self.peer_connect_status.clear();
            self.peer_connect_status.extend_from_slice(connect_status);
        }

        let last = self.last_recv_input_frame;
        if last.is_null() || input.frame == last + 1 {
            self.last_recv_input_frame = input.frame;
            self.event_queue.push_back(PeerEvent::Input(input));
        } else if input.frame > last + 1 {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Received input for frame {} but last received was frame {} (likely packet loss)",
                input.frame,
                last
            );
            return true;
        }

        // duplicates are acknowledged again so the sender can stop resending
        self.queue_message(
            MessageBody::InputAck {
                ack_frame: self.last_recv_input_frame,
            },
            now,
        );
        true
    }

    fn on_input_ack(&mut self, ack_frame: Frame) -> bool {
        while self
            .pending_output
            .front()
            .is_some_and(|input| input.frame <= ack_frame)
        {
            self.pending_output.pop_front();
        }
        true
    }

    fn on_quality_report(&mut self, ping: u128, frame_advantage: i16, now: Instant) -> bool {
        self.remote_frame_advantage = i32::from(frame_advantage);
        self.queue_message(MessageBody::QualityReply { pong: ping }, now);
        true
    }

    fn on_quality_reply(&mut self, pong: u128) -> bool {
        let Some(millis) = millis_since_epoch() else {
            trace!("Skipping RTT update due to invalid system clock");
            return true;
        };
        self.round_trip_time = millis.saturating_sub(pong);
        true
    }
}

impl InvariantChecker for PeerHandle {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.session_magic == 0 {
            return Err(InvariantViolation::new("PeerHandle", "session_magic is non-zero"));
        }
        if self.state == PeerState::Syncing && self.magic_number != 0 {
            return Err(InvariantViolation::new(
                "PeerHandle",
                "magic_number stays 0 until the handshake completes",
            )
            .with_details(format!("magic_number={}", self.magic_number)));
        }
        if self.sync_remaining > self.sync_config.num_sync_packets {
            return Err(InvariantViolation::new(
                "PeerHandle",
                "sync_remaining never exceeds num_sync_packets",
            ));
        }
        let ordered = self
            .pending_output
            .iter()
            .zip(self.pending_output.iter().skip(1))
            .all(|(a, b)| a.frame < b.frame);
        if !ordered {
            return Err(InvariantViolation::new(
                "PeerHandle",
                "pending output is in frame order",
            ));
        }
        Ok(())
    }
}

impl MessageHandler for PeerHandle {
    fn on_message(&mut self, msg: Message) -> Result<(), RollbackError> {
        self.handle_message(&msg)
    }
}

/// `true` if `interval` has passed since `since`, or if `since` was never set.
fn elapsed(since: Option<Instant>, interval: Duration, now: Instant) -> bool {
    since.is_none_or(|since| since + interval < now)
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

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<(Message, ParticipantIndex)>,
    }

    impl Transport for RecordingTransport {
        fn send_to(&mut self, msg: &Message, to: ParticipantIndex) {
            self.sent.push((msg.clone(), to));
        }

        fn recv(&mut self) -> Option<Message> {
            None
        }
    }

    fn create_handle(local: usize, remote: usize) -> PeerHandle {
        PeerHandle::new(
            ParticipantIndex::new(local),
            ParticipantIndex::new(remote),
            SyncConfig::default(),
            ProtocolConfig::deterministic(1234),
            60,
        )
    }

    /// Delivers everything `from` queued to `to`, ignoring stale drops.
    fn pump(from: &mut PeerHandle, to: &mut PeerHandle, now: Instant) {
        let messages: Vec<Message> = from.send_queue.drain(..).collect();
        for msg in messages {
            let _ = to.handle_message_at(&msg, now);
        }
    }

    fn running_pair(now: Instant) -> (PeerHandle, PeerHandle) {
        let mut a = create_handle(0, 1);
        let mut b = create_handle(1, 0);
        a.poll_at(now).for_each(drop);
        b.poll_at(now).for_each(drop);
        for _ in 0..12 {
            pump(&mut a, &mut b, now);
            pump(&mut b, &mut a, now);
        }
        assert!(a.is_running());
        assert!(b.is_running());
        a.event_queue.clear();
        b.event_queue.clear();
        (a, b)
    }

    fn envelope(handle: &PeerHandle, sequence: u16, body: MessageBody) -> Message {
        Message {
            from: handle.remote,
            sequence,
            magic: handle.session_magic,
            body,
        }
    }

    #[test]
    fn new_handle_starts_syncing() {
        let handle = create_handle(0, 1);
        assert_eq!(handle.state(), PeerState::Syncing);
        assert_eq!(handle.sync_remaining(), 5);
        assert_eq!(handle.magic_number(), 0);
        assert_ne!(handle.session_magic(), 0);
        assert!(handle.network_stats().is_err());
    }

    #[test]
    fn first_poll_sends_sync_request() {
        let mut handle = create_handle(0, 1);
        let now = Instant::now();
        assert_eq!(handle.poll_at(now).count(), 0);
        assert_eq!(handle.send_queue.len(), 1);
        let msg = &handle.send_queue[0];
        assert_eq!(msg.from, ParticipantIndex::new(0));
        assert_eq!(msg.magic, 0);
        assert!(matches!(msg.body, MessageBody::SyncRequest { random } if Some(random) == handle.sync_nonce));
    }

    #[test]
    fn sync_retry_uses_first_interval_then_steady_interval() {
        let mut handle = create_handle(0, 1);
        let start = Instant::now();
        handle.poll_at(start).for_each(drop);
        handle.poll_at(start + Duration::from_millis(400)).for_each(drop);
        assert_eq!(handle.send_queue.len(), 1);

        let first_nonce = handle.sync_nonce;
        handle.poll_at(start + Duration::from_millis(501)).for_each(drop);
        assert_eq!(handle.send_queue.len(), 2);
        assert_ne!(handle.sync_nonce, first_nonce);

        // one roundtrip completes, the steady interval applies from now on
        let t = start + Duration::from_millis(600);
        let reply = envelope(
            &handle,
            0,
            MessageBody::SyncReply {
                random: handle.sync_nonce.unwrap(),
            },
        );
        handle.handle_message_at(&reply, t).unwrap();
        assert_eq!(handle.sync_remaining(), 4);
        handle.send_queue.clear();

        handle.poll_at(t + Duration::from_millis(1500)).for_each(drop);
        assert!(handle.send_queue.is_empty());
        handle.poll_at(t + Duration::from_millis(2001)).for_each(drop);
        assert_eq!(handle.send_queue.len(), 1);
    }

    #[test]
    fn five_matching_replies_complete_the_handshake() {
        let mut handle = create_handle(0, 1);
        let now = Instant::now();
        handle.poll_at(now).for_each(drop);

        for sequence in 0..5 {
            let msg = Message {
                from: ParticipantIndex::new(1),
                sequence,
                magic: 0x4242,
                body: MessageBody::SyncReply {
                    random: handle.sync_nonce.unwrap(),
                },
            };
            handle.handle_message_at(&msg, now).unwrap();
        }

        assert_eq!(handle.state(), PeerState::Running);
        assert_eq!(handle.magic_number(), 0x4242);
        let events: Vec<PeerEvent> = handle.poll_at(now).collect();
        assert_eq!(
            events[0],
            PeerEvent::Synchronizing { total: 5, count: 1 }
        );
        assert_eq!(events.last(), Some(&PeerEvent::Synchronized));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn sync_reply_with_stale_nonce_is_ignored() {
        let mut handle = create_handle(0, 1);
        let now = Instant::now();
        handle.poll_at(now).for_each(drop);
        let stale = handle.sync_nonce.unwrap().wrapping_add(1);

        let msg = envelope(&handle, 0, MessageBody::SyncReply { random: stale });
        handle.handle_message_at(&msg, now).unwrap();

        assert_eq!(handle.state(), PeerState::Syncing);
        assert_eq!(handle.sync_remaining(), 5);
        assert_eq!(handle.magic_number(), 0);
        assert_eq!(handle.poll_at(now).count(), 0);
    }

    #[test]
    fn sync_request_is_answered_with_our_token() {
        let mut handle = create_handle(0, 1);
        let now = Instant::now();
        let msg = envelope(&handle, 0, MessageBody::SyncRequest { random: 99 });
        handle.handle_message_at(&msg, now).unwrap();
        let reply = handle.send_queue.back().unwrap();
        assert_eq!(reply.body, MessageBody::SyncReply { random: 99 });
        assert_eq!(reply.magic, handle.session_magic());
    }

    #[test]
    fn handshake_between_two_handles() {
        let now = Instant::now();
        let (a, b) = running_pair(now);
        assert_eq!(a.magic_number(), b.session_magic());
        assert_eq!(b.magic_number(), a.session_magic());
        assert_ne!(a.session_magic(), b.session_magic());
    }

    #[test]
    fn sequence_filter_drops_duplicates_and_stale_packets() {
        let now = Instant::now();
        let (mut a, _b) = running_pair(now);
        let expected = a.next_recv_seq();

        a.handle_message_at(&envelope(&a, expected, MessageBody::KeepAlive), now)
            .unwrap();
        assert_eq!(a.next_recv_seq(), expected.wrapping_add(1));

        let duplicate = envelope(&a, expected, MessageBody::KeepAlive);
        assert_eq!(
            a.handle_message_at(&duplicate, now),
            Err(RollbackError::StaleOrDuplicatePacket {
                sequence: expected,
                expected: expected.wrapping_add(1),
            })
        );
        assert_eq!(a.next_recv_seq(), expected.wrapping_add(1));

        // forward gaps within the window are accepted
        let ahead = expected.wrapping_add(100);
        a.handle_message_at(&envelope(&a, ahead, MessageBody::KeepAlive), now)
            .unwrap();
        assert_eq!(a.next_recv_seq(), ahead.wrapping_add(1));

        let stale = ahead.wrapping_sub(40_000);
        assert!(a
            .handle_message_at(&envelope(&a, stale, MessageBody::KeepAlive), now)
            .is_err());
        assert_eq!(a.next_recv_seq(), ahead.wrapping_add(1));
    }

    #[test]
    fn wrong_magic_is_ignored_without_consuming_the_sequence() {
        let now = Instant::now();
        let (mut a, _b) = running_pair(now);
        let expected = a.next_recv_seq();
        let mut msg = envelope(&a, expected, MessageBody::KeepAlive);
        msg.magic = a.session_magic().wrapping_add(1);
        a.handle_message_at(&msg, now).unwrap();
        assert_eq!(a.next_recv_seq(), expected);
    }

    #[test]
    fn input_is_forwarded_once_and_acknowledged() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);

        a.send_input_at(Input::new(Frame::new(0), 5), now);
        a.send_input_at(Input::new(Frame::new(1), 6), now);
        assert_eq!(a.pending_output_len(), 2);

        pump(&mut a, &mut b, now);
        let events: Vec<PeerEvent> = b.poll_at(now).collect();
        assert_eq!(
            events,
            vec![
                PeerEvent::Input(Input::new(Frame::new(0), 5)),
                PeerEvent::Input(Input::new(Frame::new(1), 6)),
            ]
        );
        assert_eq!(b.last_recv_input_frame(), Frame::new(1));

        pump(&mut b, &mut a, now);
        assert_eq!(a.pending_output_len(), 0);

        // a resent duplicate is acknowledged again but not forwarded
        let seq = b.next_recv_seq();
        let duplicate = envelope(
            &b,
            seq,
            MessageBody::Input {
                frame: Frame::new(1),
                data: 6,
                connect_status: Vec::new(),
            },
        );
        b.handle_message_at(&duplicate, now).unwrap();
        assert_eq!(b.poll_at(now).count(), 0);
        assert_eq!(
            b.send_queue.back().unwrap().body,
            MessageBody::InputAck {
                ack_frame: Frame::new(1)
            }
        );

        // a gap is dropped until the missing frames are resent
        let gap = envelope(
            &b,
            seq.wrapping_add(1),
            MessageBody::Input {
                frame: Frame::new(5),
                data: 1,
                connect_status: Vec::new(),
            },
        );
        b.handle_message_at(&gap, now).unwrap();
        assert_eq!(b.poll_at(now).count(), 0);
        assert_eq!(b.last_recv_input_frame(), Frame::new(1));
    }

    #[test]
    fn unacknowledged_input_is_resent() {
        let now = Instant::now();
        let (mut a, _b) = running_pair(now);
        a.send_input_at(Input::new(Frame::new(0), 1), now);
        a.send_queue.clear();

        a.poll_at(now + Duration::from_millis(201)).for_each(drop);
        assert!(a.send_queue.iter().any(|msg| matches!(
            msg.body,
            MessageBody::Input { frame, data: 1, .. } if frame == Frame::new(0)
        )));
    }

    #[test]
    fn connection_status_travels_with_input() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        let third = ParticipantIndex::new(2);
        assert_eq!(b.peer_connect_status(third), None);

        let connected = [
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(0),
            },
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::NULL,
            },
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(4),
            },
        ];
        a.send_queue.clear();
        a.set_connect_status_at(&connected, now);
        assert!(a.send_queue.is_empty());

        a.send_input_at(Input::new(Frame::new(0), 3), now);
        pump(&mut a, &mut b, now);
        assert_eq!(b.peer_connect_status(third), Some(connected[2]));
        pump(&mut b, &mut a, now);
        assert_eq!(a.pending_output_len(), 0);

        // everything was acknowledged, yet the disconnect still reaches the remote
        let mut gone = connected;
        gone[2] = ConnectionStatus {
            disconnected: true,
            last_frame: Frame::new(3),
        };
        a.set_connect_status_at(&gone, now);
        assert_eq!(a.pending_output_len(), 1);
        pump(&mut a, &mut b, now);
        assert_eq!(b.peer_connect_status(third), Some(gone[2]));
        let forwarded = b
            .poll_at(now)
            .filter(|event| matches!(event, PeerEvent::Input(_)))
            .count();
        assert_eq!(forwarded, 1);

        // an unchanged status is not sent again
        a.send_queue.clear();
        a.set_connect_status_at(&gone, now);
        assert!(a.send_queue.is_empty());
    }

    #[test]
    fn send_input_before_handshake_is_dropped() {
        let mut handle = create_handle(0, 1);
        handle.send_input_at(Input::new(Frame::new(0), 1), Instant::now());
        assert_eq!(handle.pending_output_len(), 0);
        assert!(handle.send_queue.is_empty());
    }

    #[test]
    fn too_much_pending_output_disconnects() {
        let now = Instant::now();
        let mut a = PeerHandle::new(
            ParticipantIndex::new(0),
            ParticipantIndex::new(1),
            SyncConfig::default(),
            ProtocolConfig {
                pending_output_limit: 2,
                ..ProtocolConfig::deterministic(5)
            },
            60,
        );
        a.state = PeerState::Running;
        for frame in 0..3 {
            a.send_input_at(Input::new(Frame::new(frame), 0), now);
        }
        assert_eq!(a.state(), PeerState::Disconnected);
        assert_eq!(a.poll_at(now).collect::<Vec<_>>(), vec![PeerEvent::Disconnected]);
    }

    #[test]
    fn quality_report_is_answered_with_pong() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        let later = now + Duration::from_millis(1001);
        a.poll_at(later).for_each(drop);

        let ping = a
            .send_queue
            .iter()
            .find_map(|msg| match msg.body {
                MessageBody::QualityReport { ping, .. } => Some(ping),
                _ => None,
            })
            .unwrap();
        pump(&mut a, &mut b, later);
        assert!(b
            .send_queue
            .iter()
            .any(|msg| msg.body == MessageBody::QualityReply { pong: ping }));
        pump(&mut b, &mut a, later);
        assert!(a.network_stats().is_ok());
    }

    #[test]
    fn keepalive_after_idle_interval() {
        let now = Instant::now();
        let (mut a, _b) = running_pair(now);
        a.send_queue.clear();
        a.poll_at(now + Duration::from_millis(100)).for_each(drop);
        assert!(a.send_queue.is_empty());
        a.poll_at(now + Duration::from_millis(201)).for_each(drop);
        let keepalive = a.send_queue.back().unwrap();
        assert_eq!(keepalive.body, MessageBody::KeepAlive);
        assert_eq!(keepalive.magic, a.magic_number());
    }

    #[test]
    fn interruption_resume_and_timeout() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);

        let events: Vec<PeerEvent> = a.poll_at(now + Duration::from_millis(800)).collect();
        assert!(events.contains(&PeerEvent::NetworkInterrupted {
            disconnect_timeout: 4250
        }));

        let resume_at = now + Duration::from_millis(900);
        b.poll_at(resume_at).for_each(drop);
        pump(&mut b, &mut a, resume_at);
        let events: Vec<PeerEvent> = a.poll_at(resume_at).collect();
        assert!(events.contains(&PeerEvent::NetworkResumed));

        let events: Vec<PeerEvent> = a.poll_at(resume_at + Duration::from_millis(5001)).collect();
        assert!(events.contains(&PeerEvent::Disconnected));
        assert_eq!(a.state(), PeerState::Disconnected);

        // disconnected handles drop both directions
        let mut sink = RecordingTransport::default();
        a.send_input_at(Input::new(Frame::new(0), 0), resume_at);
        a.send_all_messages(&mut sink);
        assert!(a.send_queue.is_empty());
        assert!(sink.sent.is_empty());
        assert!(a
            .handle_message_at(&envelope(&a, 0, MessageBody::KeepAlive), resume_at)
            .is_ok());
    }

    #[test]
    fn send_all_messages_addresses_the_remote() {
        let mut handle = create_handle(0, 3);
        handle.poll_at(Instant::now()).for_each(drop);
        let mut sink = RecordingTransport::default();
        handle.send_all_messages(&mut sink);
        assert_eq!(sink.sent.len(), 1);
        assert_eq!(sink.sent[0].1, ParticipantIndex::new(3));
        assert!(handle.send_queue.is_empty());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut handle = create_handle(0, 1);
        handle.disconnect();
        handle.disconnect();
        assert_eq!(
            handle.poll_at(Instant::now()).collect::<Vec<_>>(),
            vec![PeerEvent::Disconnected]
        );
    }

    #[test]
    fn invariants_hold_through_the_handshake() {
        let mut handle = create_handle(0, 1);
        assert!(handle.check_invariants().is_ok());
        let (a, b) = running_pair(Instant::now());
        assert!(a.check_invariants().is_ok());
        assert!(b.check_invariants().is_ok());
        handle.session_magic = 0;
        assert!(handle.check_invariants().is_err());
    }

    #[test]
    fn deterministic_seed_produces_same_tokens() {
        let a = create_handle(0, 1);
        let b = create_handle(0, 1);
        assert_eq!(a.session_magic(), b.session_magic());
    }

    #[test]
    fn frame_advantage_uses_half_rtt() {
        let mut handle = create_handle(0, 1);
        handle.last_recv_input_frame = Frame::new(100);
        handle.round_trip_time = 200;
        handle.update_local_frame_advantage(Frame::new(98));
        // 100 + (100ms * 60 / 1000) - 98
        assert_eq!(handle.local_frame_advantage, 8);
    }
}
