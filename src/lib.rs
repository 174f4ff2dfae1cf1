//! # Lockstep Rollback
//!
//! Lockstep Rollback keeps a deterministic simulation in agreement across several peers
//! connected by an unreliable transport. Every peer advances its own copy of the simulation
//! at a fixed rate, predicts the inputs of the others when they have not arrived yet, and
//! rolls back and resimulates as soon as a prediction turns out to be wrong.
//!
//! The crate is organised bottom-up:
//!
//! - [`PredictionQueue`](input_queue::PredictionQueue) stores the confirmed inputs of one
//!   participant in a fixed ring buffer and hands out predictions for missing frames.
//! - [`SyncEngine`](sync_layer::SyncEngine) owns one queue per participant and a log of
//!   state snapshots, drives a [`SimulationHandler`] and performs rollbacks.
//! - [`PeerHandle`](network::protocol::PeerHandle) runs the per-peer handshake, keepalive,
//!   quality reporting and sequence filtering over a [`Transport`].
//! - [`MessageRouter`](network::router::MessageRouter) dispatches inbound envelopes by sender.
//! - [`LockstepSession`] ties everything together and is what most applications use.

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::RollbackError;
pub use frame_info::Input;
pub use network::mailbox::{MailboxHub, MailboxTransport};
pub use network::messages::{ConnectionStatus, Message, MessageBody, MessageType};
pub use network::network_stats::NetworkStats;
pub use network::protocol::{PeerEvent, PeerHandle, PeerState};
pub use network::router::{MessageHandler, MessageRouter};
pub use network::udp_socket::UdpTransport;
pub use scheduler::FixedTickScheduler;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ProtocolConfig, RollbackConfig, SyncConfig};
pub use sessions::lockstep_session::{LockstepSession, SessionEvent, MAX_BOOTSTRAP_STATE_SIZE};
pub use sync_layer::SyncEngine;

// Internal modules - made pub for re-export in __internal, but doc(hidden) for API cleanliness
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
/// Internal random number generator module based on PCG32.
///
/// Used for handshake nonces and session tokens.
pub mod rng;
/// Fixed-rate frame clock with drift correction.
pub mod scheduler;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod config;
    #[doc(hidden)]
    pub mod lockstep_session;
}
#[doc(hidden)]
pub mod network {
    /// Binary codec for network message serialization.
    ///
    /// Provides centralized encoding and decoding of envelopes and snapshots using bincode.
    pub mod codec;
    pub mod mailbox;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    pub mod router;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for property testing.
///
/// **This module is NOT part of the public API.** Everything here may change without notice.
/// It exists so that `tests/` can drive the queue, the engine and the protocol directly
/// instead of only through [`LockstepSession`].
#[doc(hidden)]
pub mod __internal {
    pub use crate::frame_info::InputVec;
    pub use crate::input_queue::{PredictionQueue, INPUT_QUEUE_LENGTH};
    pub use crate::network::protocol::MAX_SEQ_DISTANCE;
    pub use crate::sync_layer::{Snapshot, SnapshotLog, MAX_PREDICTION_FRAMES};
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single step of simulation.
///
/// Frame numbers start at 0 and increment by one every tick. The special value
/// [`NULL_FRAME`] (-1) represents "no frame" or "uninitialized".
///
/// # Examples
///
/// ```
/// use lockstep_rollback::{Frame, NULL_FRAME};
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!(Frame::NULL.as_i32(), NULL_FRAME);
///
/// let next_frame = frame + 1;
/// assert_eq!(next_frame - frame, 1);
/// assert!(next_frame > frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value. The value is not validated.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns `Some(self)` if the frame is valid, or `None` if it's null or negative.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Frame> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies a participant of a session. Every envelope names its sender by index,
/// and every participant owns the input queue with the same index.
///
/// ```
/// use lockstep_rollback::ParticipantIndex;
///
/// let index = ParticipantIndex::new(1);
/// assert!(index.is_valid_for(2));
/// assert!(!index.is_valid_for(1));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ParticipantIndex(usize);

impl ParticipantIndex {
    /// Creates a new index.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        ParticipantIndex(index)
    }

    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if the index addresses one of `count` participants.
    #[inline]
    #[must_use]
    pub const fn is_valid_for(self, count: usize) -> bool {
        self.0 < count
    }
}

impl std::fmt::Display for ParticipantIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for ParticipantIndex {
    #[inline]
    fn from(value: usize) -> Self {
        ParticipantIndex(value)
    }
}

/// A session is always in one of these states. You can query the current state of a session via [`current_state`].
///
/// [`current_state`]: LockstepSession#method.current_state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// When synchronizing, the session attempts to establish a connection to the remote peers.
    Synchronizing,
    /// When running, the session has synchronized and is ready to take and transmit input.
    Running,
}

/// [`InputStatus`] accompanies every input read from a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input for this frame was actually received.
    Confirmed,
    /// The input for this frame is predicted.
    Predicted,
    /// The participant disconnected before this frame, so the input is blank.
    Disconnected,
}

/// The simulation that the engine keeps in lockstep.
///
/// Implementations must be deterministic: the same snapshot followed by the same
/// inputs must always produce the same state. The engine calls [`update`] once per
/// frame, including during resimulation after a rollback, so `update` must not
/// have side effects that cannot be repeated.
///
/// [`update`]: SimulationHandler::update
pub trait SimulationHandler {
    /// Advances the simulation by one frame. `inputs` holds one entry per participant, in index order.
    fn update(&mut self, inputs: &[Input], frame: Frame);

    /// Serializes the complete simulation state.
    fn save_state(&self) -> Result<Vec<u8>, RollbackError>;

    /// Replaces the simulation state with a blob produced by [`save_state`](SimulationHandler::save_state).
    fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError>;
}

/// This [`Transport`] trait is used when you want to use Lockstep Rollback with your own socket.
/// Messages should be sent in an UDP-like fashion, unordered and unreliable.
/// The peer protocol filters duplicates and stale packets on top of it.
#[cfg(feature = "sync-send")]
pub trait Transport: Send + Sync {
    /// Sends a [`Message`] to the given participant. Fire-and-forget.
    fn send_to(&mut self, msg: &Message, to: ParticipantIndex);

    /// Returns the next received message, or `None` if nothing is pending. Must not block.
    fn recv(&mut self) -> Option<Message>;
}

/// This [`Transport`] trait is used when you want to use Lockstep Rollback with your own socket.
/// Messages should be sent in an UDP-like fashion, unordered and unreliable.
/// The peer protocol filters duplicates and stale packets on top of it.
#[cfg(not(feature = "sync-send"))]
pub trait Transport {
    /// Sends a [`Message`] to the given participant. Fire-and-forget.
    fn send_to(&mut self, msg: &Message, to: ParticipantIndex);

    /// Returns the next received message, or `None` if nothing is pending. Must not block.
    fn recv(&mut self) -> Option<Message>;
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
    fn frame_arithmetic() {
        let frame = Frame::new(10);
        assert_eq!(frame + 5, Frame::new(15));
        assert_eq!(frame - 3, Frame::new(7));
        assert_eq!(frame - Frame::new(4), 6);
        assert_eq!(Frame::new(130) % 128, 2);

        let mut counter = Frame::new(0);
        counter += 1;
        assert_eq!(counter, 1);
    }

    #[test]
    fn null_frame_is_not_valid() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.to_option(), None);
        assert_eq!(Frame::new(3).to_option(), Some(Frame::new(3)));
        assert!(!Frame::new(-5).is_valid());
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(42).to_string(), "42");
    }

    #[test]
    fn frame_compares_with_i32() {
        let frame = Frame::new(5);
        assert!(frame > 4);
        assert!(frame < 6);
        assert_eq!(i32::from(frame), 5);
        assert_eq!(Frame::from(5), frame);
    }

    #[test]
    fn participant_index_bounds() {
        let index = ParticipantIndex::new(2);
        assert_eq!(index.as_usize(), 2);
        assert!(index.is_valid_for(3));
        assert!(!index.is_valid_for(2));
        assert_eq!(ParticipantIndex::from(2), index);
        assert_eq!(index.to_string(), "2");
    }
}
