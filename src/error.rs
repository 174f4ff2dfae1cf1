use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, ParticipantIndex};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), RollbackError>`].
///
/// Errors fall into three groups:
///
/// - contract failures of the queues and the engine ([`Sequencing`], [`Capacity`], [`SnapshotMissing`]),
///   which leave the session in a state that should not be driven further,
/// - transport anomalies ([`UnroutedSender`], [`StaleOrDuplicatePacket`]), which are expected on lossy
///   transports and are dropped where they occur,
/// - user-visible throttling ([`PredictionBarrier`]), which clears by itself once remote input arrives.
///
/// [`Result<(), RollbackError>`]: std::result::Result
/// [`Sequencing`]: RollbackError::Sequencing
/// [`Capacity`]: RollbackError::Capacity
/// [`SnapshotMissing`]: RollbackError::SnapshotMissing
/// [`UnroutedSender`]: RollbackError::UnroutedSender
/// [`StaleOrDuplicatePacket`]: RollbackError::StaleOrDuplicatePacket
/// [`PredictionBarrier`]: RollbackError::PredictionBarrier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RollbackError {
    /// An input was submitted out of order. Inputs must arrive for consecutive frames.
    Sequencing {
        /// The frame the queue expected next.
        expected: Frame,
        /// The frame that was actually submitted.
        actual: Frame,
    },
    /// Accepting the input would overflow the input ring buffer.
    Capacity {
        /// The fixed capacity of the ring buffer.
        capacity: usize,
    },
    /// Local input was refused because the simulation is already too far ahead of the confirmed frame.
    PredictionBarrier {
        /// How many frames the simulation is ahead of the last confirmed frame.
        frames_behind: i32,
        /// The configured rollback depth.
        max_prediction: usize,
    },
    /// The snapshot needed to roll back to a frame is no longer in the log.
    SnapshotMissing {
        /// The frame that was requested.
        frame: Frame,
    },
    /// A message arrived from a participant that has no registered handler.
    UnroutedSender {
        /// The sender named in the message.
        from: ParticipantIndex,
    },
    /// A message was too far behind the expected sequence number and was dropped.
    StaleOrDuplicatePacket {
        /// The sequence number carried by the message.
        sequence: u16,
        /// The next sequence number the receiver expected.
        expected: u16,
    },
    /// A handler is already registered for this participant.
    AlreadyLinked {
        /// The participant index that is already in use.
        index: ParticipantIndex,
    },
    /// Input was requested while a detected misprediction has not been rolled back yet.
    UnresolvedMisprediction {
        /// The first frame whose prediction turned out to be wrong.
        frame: Frame,
    },
    /// An invalid frame number was provided.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The participant index is outside the session.
    InvalidParticipant {
        /// The index that was passed in.
        index: ParticipantIndex,
        /// The number of participants in the session.
        count: usize,
    },
    /// The session is not synchronized with all remote peers yet.
    NotSynchronized,
    /// Serialization or deserialization of data failed.
    Serialization {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A network socket operation failed.
    Socket {
        /// A description of the socket error.
        context: String,
    },
}

impl RollbackError {
    /// Returns `true` for anomalies that lossy transports produce during normal operation.
    /// These are dropped where they occur and never surface to the user.
    #[must_use]
    pub fn is_transport_anomaly(&self) -> bool {
        matches!(
            self,
            Self::UnroutedSender { .. } | Self::StaleOrDuplicatePacket { .. }
        )
    }

    /// Returns `true` if the error breaks the invariants of the queues or the engine.
    /// A session that returned one of these should be torn down rather than driven further.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Sequencing { .. } | Self::Capacity { .. } | Self::SnapshotMissing { .. }
        )
    }
}

impl Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::Sequencing { expected, actual } => {
                write!(
                    f,
                    "Input submitted out of order: expected frame {}, got frame {}",
                    expected, actual
                )
            }
            RollbackError::Capacity { capacity } => {
                write!(f, "Input queue is full ({} entries)", capacity)
            }
            RollbackError::PredictionBarrier {
                frames_behind,
                max_prediction,
            } => {
                write!(
                    f,
                    "Prediction threshold is reached ({} frames ahead, limit {}), cannot proceed without catching up.",
                    frames_behind, max_prediction
                )
            }
            RollbackError::SnapshotMissing { frame } => {
                write!(f, "No snapshot saved for frame {}", frame)
            }
            RollbackError::UnroutedSender { from } => {
                write!(f, "No handler registered for participant {}", from)
            }
            RollbackError::StaleOrDuplicatePacket { sequence, expected } => {
                write!(
                    f,
                    "Dropped stale or duplicate packet {} (expected {})",
                    sequence, expected
                )
            }
            RollbackError::AlreadyLinked { index } => {
                write!(f, "Participant {} already has a handler", index)
            }
            RollbackError::UnresolvedMisprediction { frame } => {
                write!(
                    f,
                    "Misprediction at frame {} must be rolled back before requesting input",
                    frame
                )
            }
            RollbackError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            }
            RollbackError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            RollbackError::InvalidParticipant { index, count } => {
                write!(
                    f,
                    "Invalid participant {}: session has {} participants",
                    index, count
                )
            }
            RollbackError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            RollbackError::Serialization { context } => {
                write!(f, "Serialization error: {}", context)
            }
            RollbackError::Socket { context } => {
                write!(f, "Socket error: {}", context)
            }
        }
    }
}

impl Error for RollbackError {}

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
    fn contract_failures_are_fatal() {
        let errors = [
            RollbackError::Sequencing {
                expected: Frame::new(3),
                actual: Frame::new(5),
            },
            RollbackError::Capacity { capacity: 128 },
            RollbackError::SnapshotMissing {
                frame: Frame::new(2),
            },
        ];
        for err in errors {
            assert!(err.is_fatal(), "{err} should be fatal");
            assert!(!err.is_transport_anomaly());
        }
    }

    #[test]
    fn transport_anomalies_are_not_fatal() {
        let errors = [
            RollbackError::UnroutedSender {
                from: ParticipantIndex::new(4),
            },
            RollbackError::StaleOrDuplicatePacket {
                sequence: 1,
                expected: 9,
            },
        ];
        for err in errors {
            assert!(err.is_transport_anomaly());
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn prediction_barrier_is_recoverable() {
        let err = RollbackError::PredictionBarrier {
            frames_behind: 8,
            max_prediction: 8,
        };
        assert!(!err.is_fatal());
        assert!(!err.is_transport_anomaly());
        assert!(err.to_string().contains("limit 8"));
    }

    #[test]
    fn display_names_the_null_frame() {
        let err = RollbackError::InvalidFrame {
            frame: Frame::NULL,
            reason: "negative".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid frame NULL_FRAME: negative");
    }
}
