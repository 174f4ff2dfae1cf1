//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: a small deterministic ship simulation driven by bit flag inputs
//! - `chaos`: a transport wrapper that drops, duplicates and reorders envelopes
//!
//! ```ignore
//! mod common;
//! use common::stubs::{ShipSim, THRUST};
//! use common::{init_tracing, synchronize_sessions};
//! ```

#![allow(
    dead_code,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

pub mod chaos;
pub mod stubs;

use lockstep_rollback::{
    LockstepSession, MailboxHub, ParticipantIndex, ProtocolConfig, RollbackConfig, SessionBuilder,
    SessionState, Transport,
};

/// Upper bound on poll rounds before a handshake is considered stuck.
pub const MAX_SYNC_ITERATIONS: usize = 200;

/// Installs a `tracing` subscriber that writes to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Starts one session for participant `local` of `hub` with a reproducible protocol seed.
pub fn mailbox_session(
    hub: &MailboxHub,
    local: usize,
    rollback: RollbackConfig,
) -> LockstepSession<lockstep_rollback::MailboxTransport> {
    SessionBuilder::new()
        .with_num_participants(hub.participants())
        .unwrap()
        .with_local_participant(ParticipantIndex::new(local))
        .with_rollback_config(rollback)
        .with_protocol_config(ProtocolConfig::deterministic(0xC0FFEE + local as u64))
        .start_session(hub.transport(ParticipantIndex::new(local)).unwrap())
        .unwrap()
}

/// Polls every session until all of them are running.
pub fn synchronize_sessions<T: Transport>(sessions: &mut [LockstepSession<T>]) {
    for _ in 0..MAX_SYNC_ITERATIONS {
        for session in sessions.iter_mut() {
            session.poll_remote_clients();
        }
        if sessions
            .iter()
            .all(|session| session.current_state() == SessionState::Running)
        {
            return;
        }
    }
    panic!("sessions did not synchronize within {MAX_SYNC_ITERATIONS} rounds");
}
