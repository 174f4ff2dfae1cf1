use std::{
    collections::{BTreeMap, VecDeque},
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::network::codec;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{network::messages::Message, ParticipantIndex, RollbackError, Transport};
use tracing::trace;

/// Largest payload a UDP datagram can carry. Snapshot replies can be this large.
const RECV_BUFFER_SIZE: usize = 65_507;
/// Size of the pre-allocated send buffer. Inputs and control messages fit easily,
/// larger snapshot replies fall back to an allocating encode.
const SEND_BUFFER_SIZE: usize = 1024;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP [`Transport`]. Envelopes are bincode-encoded, one per datagram,
/// and addressed through a participant-to-address table.
///
/// Datagrams from an address other than the one registered for their `from` participant
/// are dropped.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peers: BTreeMap<ParticipantIndex, SocketAddr>,
    inbound: VecDeque<Message>,
    /// Receive buffer - reused across recv_from calls
    recv_buffer: Box<[u8]>,
    /// Send buffer - reused across send_to calls to avoid allocation
    send_buffer: [u8; SEND_BUFFER_SIZE],
}

impl UdpTransport {
    /// Binds to `0.0.0.0:port` in non-blocking mode.
    ///
    /// # Errors
    /// Returns [`RollbackError::Socket`] if binding or switching to non-blocking mode fails.
    pub fn bind_to_port(port: u16) -> Result<Self, RollbackError> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to `addr` in non-blocking mode.
    ///
    /// # Errors
    /// Returns [`RollbackError::Socket`] if binding or switching to non-blocking mode fails.
    pub fn bind(addr: SocketAddr) -> Result<Self, RollbackError> {
        let socket = UdpSocket::bind(addr).map_err(|err| RollbackError::Socket {
            context: format!("bind {addr}: {err}"),
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|err| RollbackError::Socket {
                context: format!("set_nonblocking: {err}"),
            })?;
        Ok(Self {
            socket,
            peers: BTreeMap::new(),
            inbound: VecDeque::new(),
            recv_buffer: vec![0; RECV_BUFFER_SIZE].into_boxed_slice(),
            send_buffer: [0; SEND_BUFFER_SIZE],
        })
    }

    /// Registers the address of participant `index`, replacing any previous one.
    pub fn add_peer(&mut self, index: ParticipantIndex, addr: SocketAddr) {
        self.peers.insert(index, addr);
    }

    /// Builder-style [`add_peer`](Self::add_peer).
    #[must_use]
    pub fn with_peer(mut self, index: ParticipantIndex, addr: SocketAddr) -> Self {
        self.add_peer(index, addr);
        self
    }

    /// The address registered for `index`.
    #[must_use]
    pub fn peer_addr(&self, index: ParticipantIndex) -> Option<SocketAddr> {
        self.peers.get(&index).copied()
    }

    /// The local address of the socket.
    ///
    /// # Errors
    /// Returns [`RollbackError::Socket`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, RollbackError> {
        self.socket.local_addr().map_err(|err| RollbackError::Socket {
            context: format!("local_addr: {err}"),
        })
    }

    /// Reads every pending datagram into the inbound queue.
    fn receive_all_messages(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    let Some(buf_slice) = self.recv_buffer.get(..number_of_bytes) else {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::NetworkProtocol,
                            "recv_buffer slice [..{}] out of bounds (buffer size: {})",
                            number_of_bytes,
                            RECV_BUFFER_SIZE
                        );
                        continue;
                    };
                    let msg: Message = match codec::decode_value(buf_slice) {
                        Ok(msg) => msg,
                        Err(err) => {
                            trace!(%src_addr, %err, "dropping undecodable datagram");
                            continue;
                        },
                    };
                    match self.peers.get(&msg.from) {
                        Some(addr) if *addr == src_addr => self.inbound.push_back(msg),
                        Some(addr) => {
                            trace!(from = %msg.from, %src_addr, expected = %addr, "dropping datagram from unexpected address");
                        },
                        // unknown senders are left for the router to reject
                        None => self.inbound.push_back(msg),
                    }
                },
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                // datagram socket sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return;
                },
            }
        }
    }

    fn send_encoded_packet(&self, buf: &[u8], addr: SocketAddr) {
        // large packets risk fragmentation; usually an oversized snapshot reply
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        // UDP is best-effort, a failed send is just a lost packet
        if let Err(e) = self.socket.send_to(buf, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Failed to send UDP packet to {}: {}",
                addr,
                e
            );
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, msg: &Message, to: ParticipantIndex) {
        let Some(addr) = self.peers.get(&to).copied() else {
            trace!(%to, "no address registered for participant; dropping message");
            return;
        };

        let len = match codec::encode_into(msg, &mut self.send_buffer) {
            Ok(len) => len,
            Err(codec::CodecError::BufferTooSmall { .. }) => {
                match codec::encode(msg) {
                    Ok(buf) => self.send_encoded_packet(&buf, addr),
                    Err(e) => {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::NetworkProtocol,
                            "Failed to serialize message: {}",
                            e
                        );
                    },
                }
                return;
            },
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to serialize message: {}",
                    e
                );
                return;
            },
        };

        if let Some(buf_slice) = self.send_buffer.get(..len) {
            self.send_encoded_packet(buf_slice, addr);
        }
    }

    fn recv(&mut self) -> Option<Message> {
        if self.inbound.is_empty() {
            self.receive_all_messages();
        }
        self.inbound.pop_front()
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
    #[cfg(not(miri))]
    use crate::network::messages::{ConnectionStatus, MessageBody};
    #[cfg(not(miri))]
    use crate::Frame;

    // UDP delivery timing varies across platforms
    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for_messages(
        transport: &mut UdpTransport,
        expected_count: usize,
        max_retries: u32,
    ) -> Vec<Message> {
        let mut all_received = Vec::new();
        for _ in 0..max_retries {
            all_received.extend(std::iter::from_fn(|| transport.recv()));
            if all_received.len() >= expected_count {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all_received
    }

    // 0.0.0.0 is not a valid destination on every platform
    #[cfg(not(miri))]
    #[track_caller]
    fn to_loopback_addr(transport: &UdpTransport) -> SocketAddr {
        let local = transport.local_addr().unwrap();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
    }

    #[cfg(not(miri))]
    fn linked_pair() -> (UdpTransport, UdpTransport) {
        let mut a = UdpTransport::bind_to_port(0).unwrap();
        let mut b = UdpTransport::bind_to_port(0).unwrap();
        let addr_a = to_loopback_addr(&a);
        let addr_b = to_loopback_addr(&b);
        a.add_peer(ParticipantIndex::new(1), addr_b);
        b.add_peer(ParticipantIndex::new(0), addr_a);
        (a, b)
    }

    #[cfg(not(miri))]
    fn keepalive(from: usize, magic: u16) -> Message {
        Message {
            from: ParticipantIndex::new(from),
            sequence: 0,
            magic,
            body: MessageBody::KeepAlive,
        }
    }

    #[test]
    #[cfg(not(miri))] // Miri cannot execute foreign functions like socket()
    fn recv_is_non_blocking() {
        let mut transport = UdpTransport::bind_to_port(0).unwrap();
        assert_eq!(transport.recv(), None);
        assert_eq!(transport.recv(), None);
    }

    #[test]
    #[cfg(not(miri))]
    fn send_and_receive_by_participant() {
        let (mut a, mut b) = linked_pair();
        let msg = Message {
            from: ParticipantIndex::new(0),
            sequence: 7,
            magic: 0x1234,
            body: MessageBody::Input {
                frame: Frame::new(3),
                data: 0b1_0001,
                connect_status: vec![ConnectionStatus::default(); 2],
            },
        };
        a.send_to(&msg, ParticipantIndex::new(1));

        let received = wait_for_messages(&mut b, 1, 20);
        assert_eq!(received, vec![msg]);
    }

    #[test]
    #[cfg(not(miri))]
    fn large_snapshot_reply_uses_fallback_encoding() {
        let (mut a, mut b) = linked_pair();
        let msg = Message {
            from: ParticipantIndex::new(0),
            sequence: 0,
            magic: 0,
            body: MessageBody::FrameReply {
                frame: Frame::new(120),
                state: vec![0xAB; 4000],
            },
        };
        a.send_to(&msg, ParticipantIndex::new(1));

        let received = wait_for_messages(&mut b, 1, 20);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], msg);
    }

    #[test]
    #[cfg(not(miri))]
    fn datagram_from_wrong_address_is_dropped() {
        let (_a, mut b) = linked_pair();
        let mut impostor = UdpTransport::bind_to_port(0).unwrap();
        impostor.add_peer(ParticipantIndex::new(1), to_loopback_addr(&b));

        // claims to be participant 0 but is not at its registered address
        impostor.send_to(&keepalive(0, 0xBEEF), ParticipantIndex::new(1));
        assert!(wait_for_messages(&mut b, 1, 5).is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn unknown_destination_is_ignored() {
        let mut transport = UdpTransport::bind_to_port(0).unwrap();
        transport.send_to(&keepalive(0, 1), ParticipantIndex::new(9));
        assert!(transport.peer_addr(ParticipantIndex::new(9)).is_none());
    }

    #[test]
    #[cfg(not(miri))]
    fn with_peer_registers_address() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000);
        let transport = UdpTransport::bind_to_port(0)
            .unwrap()
            .with_peer(ParticipantIndex::new(2), addr);
        assert_eq!(transport.peer_addr(ParticipantIndex::new(2)), Some(addr));
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn buffer_sizes_relationship() {
        assert!(SEND_BUFFER_SIZE >= IDEAL_MAX_UDP_PACKET_SIZE);
        assert!(RECV_BUFFER_SIZE >= SEND_BUFFER_SIZE);
    }

    #[test]
    fn largest_bootstrap_reply_fits_one_datagram() {
        let msg = Message {
            from: ParticipantIndex::new(usize::MAX),
            sequence: u16::MAX,
            magic: u16::MAX,
            body: crate::network::messages::MessageBody::FrameReply {
                frame: crate::Frame::new(i32::MAX),
                state: vec![0xff; crate::MAX_BOOTSTRAP_STATE_SIZE],
            },
        };
        let encoded = codec::encode(&msg).unwrap();
        assert!(encoded.len() <= RECV_BUFFER_SIZE, "{} bytes", encoded.len());
    }
}
