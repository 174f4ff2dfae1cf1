//! End-to-end tests: several sessions in one process, each driving its own ship simulation.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::chaos::{ChaosConfig, ChaosTransport, PartitionTransport};
use common::stubs::{scripted_buttons, ShipSim, World};
use common::{init_tracing, mailbox_session, synchronize_sessions};
use lockstep_rollback::network::codec;
use lockstep_rollback::telemetry::{CollectingObserver, ViolationKind, ViolationSeverity};
use lockstep_rollback::{
    Frame, Input, LockstepSession, MailboxHub, ParticipantIndex, ProtocolConfig, RollbackConfig,
    RollbackError, SessionBuilder, SessionEvent, SessionState, SimulationHandler, SyncConfig,
    Transport, UdpTransport, MAX_BOOTSTRAP_STATE_SIZE,
};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use web_time::Instant;

const TARGET_FRAME: i32 = 90;

/// Submits scripted input and advances one frame. Returns `false` if the prediction
/// window is exhausted and the session has to wait for remote input.
fn try_frame<T: Transport>(
    session: &mut LockstepSession<T>,
    sim: &mut ShipSim,
    index: usize,
) -> bool {
    let frame = session.current_frame().as_i32() as u32;
    match session.add_local_input(scripted_buttons(index, frame)) {
        Ok(()) => {
            session.advance_frame(sim).unwrap();
            true
        },
        Err(RollbackError::PredictionBarrier { .. }) => {
            session.poll_remote_clients();
            false
        },
        Err(err) => panic!("participant {index} failed at frame {frame}: {err}"),
    }
}

/// Runs every session to `target`, polling those that are done so acks keep flowing.
fn run_to_frame<T: Transport>(
    sessions: &mut [LockstepSession<T>],
    sims: &mut [ShipSim],
    target: i32,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        let mut progressed = false;
        let mut done = true;
        for (index, (session, sim)) in sessions.iter_mut().zip(sims.iter_mut()).enumerate() {
            if session.current_frame() < Frame::new(target) {
                done = false;
                progressed |= try_frame(session, sim, index);
            } else {
                session.poll_remote_clients();
            }
        }
        if done {
            return;
        }
        assert!(Instant::now() < deadline, "sessions stalled before frame {target}");
        if !progressed {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Decodes the snapshot every session holds for the oldest frame they all confirmed
/// and checks that they agree.
fn assert_converged<T: Transport>(sessions: &[LockstepSession<T>]) -> World {
    let frame = sessions
        .iter()
        .map(LockstepSession::confirmed_frame)
        .min()
        .unwrap();
    assert!(frame.is_valid(), "nothing confirmed yet");

    let worlds: Vec<World> = sessions
        .iter()
        .map(|session| {
            let snapshot = session
                .engine()
                .snapshots()
                .get(frame)
                .unwrap_or_else(|| panic!("snapshot for frame {frame} missing"));
            codec::decode_value(&snapshot.state).unwrap()
        })
        .collect();
    for world in &worlds[1..] {
        assert_eq!(world, &worlds[0], "worlds diverged at frame {frame}");
    }
    assert_eq!(worlds[0].frame, frame.as_i32());
    worlds[0].clone()
}

#[test]
#[serial]
fn two_peers_converge_over_mailbox() {
    init_tracing();
    let hub = MailboxHub::new(2);
    let mut sessions = vec![
        mailbox_session(&hub, 0, RollbackConfig::default()),
        mailbox_session(&hub, 1, RollbackConfig::default()),
    ];
    let mut sims = vec![ShipSim::new(2), ShipSim::new(2)];

    synchronize_sessions(&mut sessions);
    run_to_frame(&mut sessions, &mut sims, TARGET_FRAME, Duration::from_secs(10));

    let world = assert_converged(&sessions);
    assert!(world.ships.iter().any(|ship| ship.shots > 0));
    // participant 0 always simulates before participant 1's input for the frame arrives
    assert!(sims[0].loads > 0, "expected at least one rollback");
    assert!(sims[0].updates > TARGET_FRAME as usize);
}

#[test]
#[serial]
fn input_delay_reduces_rollbacks() {
    init_tracing();
    let hub = MailboxHub::new(2);
    let mut sessions = vec![
        mailbox_session(&hub, 0, RollbackConfig::competitive()),
        mailbox_session(&hub, 1, RollbackConfig::competitive()),
    ];
    let mut sims = vec![ShipSim::new(2), ShipSim::new(2)];

    synchronize_sessions(&mut sessions);
    run_to_frame(&mut sessions, &mut sims, TARGET_FRAME, Duration::from_secs(10));

    assert_converged(&sessions);
    // two frames of delay hide the one frame of transport latency
    assert_eq!(sims[0].loads, 0);
    assert_eq!(sims[1].loads, 0);
}

#[test]
#[serial]
fn three_peers_converge_under_packet_loss() {
    init_tracing();
    let hub = MailboxHub::new(3);
    let mut sessions: Vec<_> = (0..3)
        .map(|index| {
            let transport = ChaosTransport::new(
                hub.transport(ParticipantIndex::new(index)).unwrap(),
                ChaosConfig::lossy(17 + index as u64),
            );
            SessionBuilder::new()
                .with_num_participants(3)
                .unwrap()
                .with_local_participant(ParticipantIndex::new(index))
                .with_sync_config(SyncConfig::lan())
                .with_protocol_config(ProtocolConfig::deterministic(index as u64))
                .start_session(transport)
                .unwrap()
        })
        .collect();
    let mut sims: Vec<ShipSim> = (0..3).map(|_| ShipSim::new(3)).collect();

    let deadline = Instant::now() + Duration::from_secs(20);
    while sessions
        .iter()
        .any(|session| session.current_state() != SessionState::Running)
    {
        for session in &mut sessions {
            session.poll_remote_clients();
        }
        assert!(Instant::now() < deadline, "handshake did not complete");
        std::thread::sleep(Duration::from_millis(1));
    }

    run_to_frame(&mut sessions, &mut sims, TARGET_FRAME, Duration::from_secs(30));
    assert_converged(&sessions);

    for session in &mut sessions {
        assert_eq!(session.remote_participants().len(), 2);
        assert!(!session
            .events()
            .any(|event| matches!(event, SessionEvent::Disconnected { .. })));
    }
}

#[test]
#[serial]
fn silent_peer_is_disconnected() {
    init_tracing();
    let hub = MailboxHub::new(2);
    let protocol = ProtocolConfig {
        disconnect_notify_start: Duration::from_millis(50),
        disconnect_timeout: Duration::from_millis(200),
        ..ProtocolConfig::deterministic(3)
    };
    let mut sessions: Vec<_> = (0..2)
        .map(|index| {
            SessionBuilder::new()
                .with_local_participant(ParticipantIndex::new(index))
                .with_protocol_config(protocol)
                .start_session(hub.transport(ParticipantIndex::new(index)).unwrap())
                .unwrap()
        })
        .collect();
    let mut sims = vec![ShipSim::new(2), ShipSim::new(2)];
    synchronize_sessions(&mut sessions);
    run_to_frame(&mut sessions, &mut sims, 10, Duration::from_secs(10));

    let mut survivor = sessions.remove(0);
    let mut sim = sims.remove(0);
    survivor.events().for_each(drop);

    // participant 1 goes silent
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    while !events
        .iter()
        .any(|event| matches!(event, SessionEvent::Disconnected { .. }))
    {
        assert!(Instant::now() < deadline, "peer was never disconnected");
        survivor.poll_remote_clients();
        events.extend(survivor.events());
        std::thread::sleep(Duration::from_millis(5));
    }

    let peer = ParticipantIndex::new(1);
    assert!(events.contains(&SessionEvent::NetworkInterrupted {
        participant: peer,
        disconnect_timeout: 150
    }));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Disconnected { participant: peer })
    );
    assert!(survivor.remote_participants().is_empty());
    assert!(survivor.network_stats(peer).is_err());

    // alone, the survivor is never held back by the prediction window
    for _ in 0..30 {
        assert!(try_frame(&mut survivor, &mut sim, 0));
    }
    assert_eq!(survivor.current_frame(), Frame::new(40));
    assert_eq!(survivor.confirmed_frame(), Frame::new(39));
}

#[test]
#[serial]
fn survivors_agree_on_the_disconnect_frame() {
    init_tracing();
    let hub = MailboxHub::new(3);
    let protocol = ProtocolConfig {
        disconnect_notify_start: Duration::from_millis(150),
        disconnect_timeout: Duration::from_millis(300),
        ..ProtocolConfig::deterministic(21)
    };
    let mut switches = Vec::new();
    let mut sessions: Vec<_> = (0..3)
        .map(|index| {
            let (transport, cut) =
                PartitionTransport::new(hub.transport(ParticipantIndex::new(index)).unwrap());
            switches.push(cut);
            SessionBuilder::new()
                .with_num_participants(3)
                .unwrap()
                .with_local_participant(ParticipantIndex::new(index))
                .with_sync_config(SyncConfig::lan())
                .with_protocol_config(protocol)
                .start_session(transport)
                .unwrap()
        })
        .collect();
    let mut sims: Vec<ShipSim> = (0..3).map(|_| ShipSim::new(3)).collect();
    synchronize_sessions(&mut sessions);
    run_to_frame(&mut sessions, &mut sims, 20, Duration::from_secs(10));

    // participant 2 keeps playing with participant 0 while nothing reaches participant 1
    switches[2].store(1, Ordering::Relaxed);
    let cut_at = Instant::now();
    while sessions[0].current_frame() < Frame::new(24)
        || cut_at.elapsed() < Duration::from_millis(100)
    {
        assert!(cut_at.elapsed() < Duration::from_secs(5), "partition phase stalled");
        for index in [0, 2] {
            if sessions[index].current_frame() < Frame::new(24) {
                try_frame(&mut sessions[index], &mut sims[index], index);
            } else {
                sessions[index].poll_remote_clients();
            }
        }
        sessions[1].poll_remote_clients();
        std::thread::sleep(Duration::from_millis(1));
    }

    // then it crashes; participant 1 stays put so nothing past its view gets confirmed
    let departed = sessions.pop().unwrap();
    sims.pop();
    drop(departed);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(sessions[0].engine().is_disconnected(2) && sessions[1].engine().is_disconnected(2)) {
        assert!(Instant::now() < deadline, "departed peer was never disconnected");
        if sessions[0].current_frame() < Frame::new(30) {
            try_frame(&mut sessions[0], &mut sims[0], 0);
        } else {
            sessions[0].poll_remote_clients();
        }
        sessions[1].poll_remote_clients();
        std::thread::sleep(Duration::from_millis(1));
    }
    for session in &mut sessions {
        session.poll_remote_clients();
    }

    let statuses: Vec<_> = sessions
        .iter()
        .map(|session| session.engine().connection_statuses()[2])
        .collect();
    assert!(statuses[0].disconnected);
    assert_eq!(statuses[0], statuses[1]);
    assert_eq!(statuses[0].last_frame, Frame::new(19));
    // the survivor that kept receiving holds newer input it must not use
    assert!(
        sessions[0].engine().queue(2).unwrap().newest_confirmed_frame() > Frame::new(19)
    );

    run_to_frame(&mut sessions, &mut sims, 60, Duration::from_secs(10));
    assert_converged(&sessions);
    for session in &mut sessions {
        assert!(session
            .events()
            .any(|event| event == SessionEvent::Disconnected {
                participant: ParticipantIndex::new(2)
            }));
    }
}

#[test]
#[serial]
fn newcomer_bootstraps_from_running_peer() {
    init_tracing();
    let hub = MailboxHub::new(2);
    let mut sessions: Vec<_> = (0..2)
        .map(|index| {
            SessionBuilder::new()
                .with_local_participant(ParticipantIndex::new(index))
                .with_sync_config(SyncConfig::lan())
                .with_protocol_config(ProtocolConfig::deterministic(40 + index as u64))
                .start_session(hub.transport(ParticipantIndex::new(index)).unwrap())
                .unwrap()
        })
        .collect();
    let mut sims = vec![ShipSim::new(2), ShipSim::new(2)];
    sessions[1]
        .request_bootstrap(ParticipantIndex::new(0))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "bootstrap did not complete");
        if sessions[0].current_state() == SessionState::Running {
            try_frame(&mut sessions[0], &mut sims[0], 0);
        } else {
            sessions[0].poll_remote_clients();
        }
        match sessions[1].advance_frame(&mut sims[1]) {
            Err(RollbackError::NotSynchronized) => {},
            // the snapshot was applied; no local input exists for the seeded frame yet
            Err(RollbackError::InvalidRequest { .. }) => break,
            other => panic!("unexpected result while bootstrapping: {other:?}"),
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let newcomer = &mut sessions[1];
    assert_eq!(newcomer.current_state(), SessionState::Running);
    let seeded = newcomer.current_frame();
    assert!(seeded > Frame::new(0), "snapshot should come from a running peer");
    assert!(newcomer
        .events()
        .any(|event| event == SessionEvent::Bootstrapped { frame: seeded }));
    assert_eq!(sims[1].world.frame, seeded.as_i32());
    assert_eq!(sims[1].loads, 1);

    run_to_frame(&mut sessions, &mut sims, TARGET_FRAME, Duration::from_secs(10));
    assert_converged(&sessions);
}

/// Counts frames and pads every snapshot past what one bootstrap reply can carry.
#[derive(Default)]
struct Ballast {
    frames: u32,
}

impl SimulationHandler for Ballast {
    fn update(&mut self, _inputs: &[Input], _frame: Frame) {
        self.frames += 1;
    }

    fn save_state(&self) -> Result<Vec<u8>, RollbackError> {
        let mut state = vec![0; MAX_BOOTSTRAP_STATE_SIZE + 1];
        state[..4].copy_from_slice(&self.frames.to_le_bytes());
        Ok(state)
    }

    fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError> {
        self.frames = u32::from_le_bytes(snapshot[..4].try_into().unwrap());
        Ok(())
    }
}

#[test]
#[serial]
fn oversized_bootstrap_snapshot_is_reported_instead_of_sent() {
    init_tracing();
    let hub = MailboxHub::new(2);
    let observer = Arc::new(CollectingObserver::new());
    let mut host = SessionBuilder::new()
        .with_local_participant(ParticipantIndex::new(0))
        .with_sync_config(SyncConfig::lan())
        .with_protocol_config(ProtocolConfig::deterministic(50))
        .with_violation_observer(observer.clone())
        .start_session(hub.transport(ParticipantIndex::new(0)).unwrap())
        .unwrap();
    let mut newcomer = SessionBuilder::new()
        .with_local_participant(ParticipantIndex::new(1))
        .with_sync_config(SyncConfig::lan())
        .with_protocol_config(ProtocolConfig::deterministic(51))
        .start_session(hub.transport(ParticipantIndex::new(1)).unwrap())
        .unwrap();
    newcomer
        .request_bootstrap(ParticipantIndex::new(0))
        .unwrap();
    let mut host_sim = Ballast::default();
    let mut newcomer_sim = Ballast::default();

    let mut step = |host: &mut LockstepSession<_>, newcomer: &mut LockstepSession<_>| {
        if host.current_state() == SessionState::Running && host.add_local_input(1).is_ok() {
            host.advance_frame(&mut host_sim).unwrap();
        } else {
            host.poll_remote_clients();
        }
        assert_eq!(
            newcomer.advance_frame(&mut newcomer_sim),
            Err(RollbackError::NotSynchronized)
        );
        std::thread::sleep(Duration::from_millis(1));
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while !observer.has_violation(ViolationKind::NetworkProtocol) {
        assert!(Instant::now() < deadline, "oversized snapshot was never reported");
        step(&mut host, &mut newcomer);
    }
    // later requests are refused the same way; the newcomer keeps waiting
    let settle = Instant::now() + Duration::from_millis(100);
    while Instant::now() < settle {
        step(&mut host, &mut newcomer);
    }

    let violation = observer
        .violations()
        .into_iter()
        .find(|violation| violation.kind == ViolationKind::NetworkProtocol)
        .unwrap();
    assert_eq!(violation.severity, ViolationSeverity::Error);
    assert!(violation.frame.unwrap() > Frame::new(0));
    assert_eq!(
        violation.context.get("state_bytes"),
        Some(&(MAX_BOOTSTRAP_STATE_SIZE + 1).to_string())
    );
    assert_eq!(
        violation.context.get("limit"),
        Some(&MAX_BOOTSTRAP_STATE_SIZE.to_string())
    );
    assert!(observer
        .violations()
        .iter()
        .all(|violation| violation.kind == ViolationKind::NetworkProtocol));
    assert_eq!(newcomer.current_state(), SessionState::Synchronizing);
    assert!(!newcomer
        .events()
        .any(|event| matches!(event, SessionEvent::Bootstrapped { .. })));
}

#[test]
#[serial]
fn bootstrap_request_after_start_is_refused() {
    let hub = MailboxHub::new(2);
    let mut sessions = vec![
        mailbox_session(&hub, 0, RollbackConfig::default()),
        mailbox_session(&hub, 1, RollbackConfig::default()),
    ];
    synchronize_sessions(&mut sessions);
    assert!(matches!(
        sessions[1].request_bootstrap(ParticipantIndex::new(0)),
        Err(RollbackError::InvalidRequest { .. })
    ));
}

#[test]
#[serial]
fn two_peers_converge_over_udp() {
    init_tracing();
    let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut sockets = vec![
        UdpTransport::bind(localhost).unwrap(),
        UdpTransport::bind(localhost).unwrap(),
    ];
    let addrs: Vec<SocketAddr> = sockets
        .iter()
        .map(|socket| socket.local_addr().unwrap())
        .collect();
    sockets[0].add_peer(ParticipantIndex::new(1), addrs[1]);
    sockets[1].add_peer(ParticipantIndex::new(0), addrs[0]);

    let mut sessions: Vec<_> = sockets
        .into_iter()
        .enumerate()
        .map(|(index, socket)| {
            SessionBuilder::new()
                .with_local_participant(ParticipantIndex::new(index))
                .with_sync_config(SyncConfig::lan())
                .with_protocol_config(ProtocolConfig::deterministic(index as u64))
                .start_session(socket)
                .unwrap()
        })
        .collect();
    let mut sims = vec![ShipSim::new(2), ShipSim::new(2)];

    let deadline = Instant::now() + Duration::from_secs(10);
    while sessions
        .iter()
        .any(|session| session.current_state() != SessionState::Running)
    {
        for session in &mut sessions {
            session.poll_remote_clients();
        }
        assert!(Instant::now() < deadline, "handshake over UDP did not complete");
        std::thread::sleep(Duration::from_millis(1));
    }

    run_to_frame(&mut sessions, &mut sims, 60, Duration::from_secs(20));
    assert_converged(&sessions);

    let stats = sessions[0].network_stats(ParticipantIndex::new(1)).unwrap();
    assert!(stats.packets_sent > 0);
}
