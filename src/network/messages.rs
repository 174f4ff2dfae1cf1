use serde::{Deserialize, Serialize};

use crate::{Frame, ParticipantIndex};

/// What the sender knows about one participant's connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the sender has disconnected the participant.
    pub disconnected: bool,
    /// The newest input frame the sender holds from the participant. Once disconnected,
    /// the last frame simulated with its real input.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

/// The kind of an envelope, with the numeric code used on the wire and in logs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Not a valid message.
    Invalid = 0,
    /// Handshake request carrying a nonce.
    SyncRequest = 1,
    /// Handshake answer echoing the nonce.
    SyncReply = 2,
    /// One frame of input.
    Input = 3,
    /// Periodic round-trip measurement.
    QualityReport = 4,
    /// Answer to a [`MessageType::QualityReport`].
    QualityReply = 5,
    /// Traffic to keep the connection from timing out.
    KeepAlive = 6,
    /// Acknowledges receipt of input.
    InputAck = 7,
    /// Asks a running peer for a snapshot of its simulation.
    FrameRequest = 8,
    /// A snapshot of a running peer's simulation.
    FrameReply = 9,
}

impl MessageType {
    /// Returns the numeric code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Maps a numeric code back to a type. Unknown codes map to [`MessageType::Invalid`].
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::SyncRequest,
            2 => Self::SyncReply,
            3 => Self::Input,
            4 => Self::QualityReport,
            5 => Self::QualityReply,
            6 => Self::KeepAlive,
            7 => Self::InputAck,
            8 => Self::FrameRequest,
            9 => Self::FrameReply,
            _ => Self::Invalid,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Payload of an envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Please reply back with this random data.
    SyncRequest {
        /// Nonce chosen by the sender.
        random: u32,
    },
    /// Here's your random data back.
    SyncReply {
        /// The nonce of the request being answered.
        random: u32,
    },
    /// One frame of the sender's input.
    Input {
        /// The frame the input belongs to.
        frame: Frame,
        /// The input bits.
        data: u32,
        /// The sender's view of every participant, indexed by participant.
        connect_status: Vec<ConnectionStatus>,
    },
    /// Round-trip measurement.
    QualityReport {
        /// Send time of the report in milliseconds since the Unix epoch.
        ping: u128,
        /// How many frames the sender is ahead of the receiver. An i16 keeps the
        /// value from clamping when a peer stalls for several seconds.
        frame_advantage: i16,
    },
    /// Answer to a quality report.
    QualityReply {
        /// The `ping` value of the report being answered.
        pong: u128,
    },
    /// No payload.
    KeepAlive,
    /// The sender holds every input up to and including `ack_frame`.
    InputAck {
        /// The newest acknowledged frame.
        ack_frame: Frame,
    },
    /// Asks the receiver for a snapshot of its simulation.
    FrameRequest,
    /// Snapshot answering a [`MessageBody::FrameRequest`].
    FrameReply {
        /// The frame the snapshot was taken at.
        frame: Frame,
        /// The serialized simulation state.
        state: Vec<u8>,
    },
}

impl MessageBody {
    /// Returns the type code of this payload.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::SyncRequest { .. } => MessageType::SyncRequest,
            Self::SyncReply { .. } => MessageType::SyncReply,
            Self::Input { .. } => MessageType::Input,
            Self::QualityReport { .. } => MessageType::QualityReport,
            Self::QualityReply { .. } => MessageType::QualityReply,
            Self::KeepAlive => MessageType::KeepAlive,
            Self::InputAck { .. } => MessageType::InputAck,
            Self::FrameRequest => MessageType::FrameRequest,
            Self::FrameReply { .. } => MessageType::FrameReply,
        }
    }

    /// Handshake and bootstrap traffic is exempt from the session token check.
    #[must_use]
    pub const fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::SyncRequest { .. }
                | Self::SyncReply { .. }
                | Self::FrameRequest
                | Self::FrameReply { .. }
        )
    }
}

impl std::fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyncRequest { random } => f
                .debug_struct("SyncRequest")
                .field("random", random)
                .finish(),
            Self::SyncReply { random } => {
                f.debug_struct("SyncReply").field("random", random).finish()
            },
            Self::Input {
                frame,
                data,
                connect_status,
            } => f
                .debug_struct("Input")
                .field("frame", frame)
                .field("data", &format_args!("{:#010x}", data))
                .field("connect_status", connect_status)
                .finish(),
            Self::QualityReport {
                ping,
                frame_advantage,
            } => f
                .debug_struct("QualityReport")
                .field("ping", ping)
                .field("frame_advantage", frame_advantage)
                .finish(),
            Self::QualityReply { pong } => {
                f.debug_struct("QualityReply").field("pong", pong).finish()
            },
            Self::KeepAlive => f.write_str("KeepAlive"),
            Self::InputAck { ack_frame } => f
                .debug_struct("InputAck")
                .field("ack_frame", ack_frame)
                .finish(),
            Self::FrameRequest => f.write_str("FrameRequest"),
            Self::FrameReply { frame, state } => f
                .debug_struct("FrameReply")
                .field("frame", frame)
                .field("state", &BytesDebug(state))
                .finish(),
        }
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The envelope every [`Transport`] carries. When implementing [`Transport`] over your own
/// socket, deserialize received datagrams into this type and hand them out via `recv`.
///
/// [`Transport`]: crate::Transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The participant that sent the envelope.
    pub from: ParticipantIndex,
    /// Per-connection sequence number, wrapping at `u16::MAX`.
    pub sequence: u16,
    /// Session token. Zero before the handshake completes.
    pub magic: u16,
    /// The payload.
    pub body: MessageBody,
}

impl Message {
    /// Returns the type code of the payload.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.body.message_type()
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
    fn test_type_codes_are_stable() {
        let bodies = [
            (MessageBody::SyncRequest { random: 1 }, 1),
            (MessageBody::SyncReply { random: 1 }, 2),
            (
                MessageBody::Input {
                    frame: Frame::new(0),
                    data: 0,
                    connect_status: vec![ConnectionStatus::default()],
                },
                3,
            ),
            (
                MessageBody::QualityReport {
                    ping: 0,
                    frame_advantage: 0,
                },
                4,
            ),
            (MessageBody::QualityReply { pong: 0 }, 5),
            (MessageBody::KeepAlive, 6),
            (
                MessageBody::InputAck {
                    ack_frame: Frame::NULL,
                },
                7,
            ),
            (MessageBody::FrameRequest, 8),
            (
                MessageBody::FrameReply {
                    frame: Frame::new(0),
                    state: vec![],
                },
                9,
            ),
        ];
        for (body, code) in bodies {
            let ty = body.message_type();
            assert_eq!(ty.code(), code);
            assert_eq!(MessageType::from_code(code), ty);
        }
        assert_eq!(MessageType::Invalid.code(), 0);
        assert_eq!(MessageType::from_code(200), MessageType::Invalid);
    }

    #[test]
    fn test_handshake_classification() {
        assert!(MessageBody::SyncRequest { random: 0 }.is_handshake());
        assert!(MessageBody::SyncReply { random: 0 }.is_handshake());
        assert!(MessageBody::FrameRequest.is_handshake());
        assert!(!MessageBody::KeepAlive.is_handshake());
        assert!(!MessageBody::InputAck {
            ack_frame: Frame::new(3)
        }
        .is_handshake());
    }

    #[test]
    fn test_debug_renders_snapshot_as_hex() {
        let body = MessageBody::FrameReply {
            frame: Frame::new(5),
            state: vec![0xde, 0xad],
        };
        let debug = format!("{:?}", body);
        assert!(debug.contains("0xdead"));
        assert_eq!(
            format!("{}", MessageType::InputAck),
            "InputAck(7)".to_owned()
        );
    }
}
