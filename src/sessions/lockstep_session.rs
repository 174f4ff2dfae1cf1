//! The session that ties the engine, the peer handles and the transport together.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::network::messages::{Message, MessageBody};
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{PeerEvent, PeerHandle};
use crate::network::router::MessageRouter;
use crate::sessions::config::SyncConfig;
use crate::sync_layer::SyncEngine;
use crate::telemetry::{
    report_to_observer, ContractViolation, InvariantChecker, InvariantViolation, ViolationKind,
    ViolationObserver, ViolationSeverity,
};
use crate::{
    report_violation_to, Frame, Input, ParticipantIndex, RollbackError, SessionState,
    SimulationHandler, Transport,
};

/// Maximum number of events to queue before the oldest are dropped.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Largest snapshot a bootstrap reply can carry. The reply travels as one envelope, which
/// has to fit into a single UDP datagram (65,507 bytes) next to its header.
pub const MAX_BOOTSTRAP_STATE_SIZE: usize = 65_507 - 64;

/// Notifications for the application, drained with [`LockstepSession::events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake with `participant` made progress.
    Synchronizing {
        /// The remote participant.
        participant: ParticipantIndex,
        /// Total number of required roundtrips.
        total: u32,
        /// Completed roundtrips.
        count: u32,
    },
    /// The handshake with `participant` completed.
    Synchronized {
        /// The remote participant.
        participant: ParticipantIndex,
    },
    /// Nothing was heard from `participant` for a while.
    NetworkInterrupted {
        /// The remote participant.
        participant: ParticipantIndex,
        /// Milliseconds until the participant is disconnected.
        disconnect_timeout: u128,
    },
    /// Traffic from `participant` resumed.
    NetworkResumed {
        /// The remote participant.
        participant: ParticipantIndex,
    },
    /// `participant` left the session. Its input is blank from here on.
    Disconnected {
        /// The remote participant.
        participant: ParticipantIndex,
    },
    /// The engine was seeded with a snapshot from a running peer.
    Bootstrapped {
        /// The frame the session continues from.
        frame: Frame,
    },
}

#[derive(Debug)]
enum Bootstrap {
    Idle,
    Awaiting {
        peer: ParticipantIndex,
        last_request: Option<Instant>,
        buffered: Vec<(ParticipantIndex, Input)>,
    },
    Received {
        frame: Frame,
        state: Vec<u8>,
        buffered: Vec<(ParticipantIndex, Input)>,
    },
}

/// A [`LockstepSession`] exchanges inputs with every remote participant over a [`Transport`]
/// and keeps the local simulation in lockstep with them through a [`SyncEngine`].
///
/// A typical frame looks like this:
///
/// ```
/// use lockstep_rollback::{
///     Frame, Input, MailboxHub, ParticipantIndex, RollbackError, SessionBuilder,
///     SimulationHandler,
/// };
///
/// #[derive(Default)]
/// struct Counter(u64);
///
/// impl SimulationHandler for Counter {
///     fn update(&mut self, inputs: &[Input], _frame: Frame) {
///         self.0 += inputs.iter().map(|input| u64::from(input.data)).sum::<u64>();
///     }
///     fn save_state(&self) -> Result<Vec<u8>, RollbackError> {
///         Ok(self.0.to_le_bytes().to_vec())
///     }
///     fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError> {
///         let bytes = snapshot.try_into().map_err(|_| RollbackError::Serialization {
///             context: "counter snapshot".to_owned(),
///         })?;
///         self.0 = u64::from_le_bytes(bytes);
///         Ok(())
///     }
/// }
///
/// let hub = MailboxHub::new(1);
/// let mut session = SessionBuilder::new()
///     .with_num_participants(1)?
///     .with_local_participant(ParticipantIndex::new(0))
///     .start_session(hub.transport(ParticipantIndex::new(0))?)?;
///
/// let mut sim = Counter::default();
/// for _ in 0..3 {
///     session.add_local_input(2)?;
///     session.advance_frame(&mut sim)?;
/// }
/// assert_eq!(sim.0, 6);
/// assert_eq!(session.current_frame(), Frame::new(3));
/// # Ok::<(), RollbackError>(())
/// ```
pub struct LockstepSession<T: Transport> {
    local: ParticipantIndex,
    engine: SyncEngine,
    router: MessageRouter<PeerHandle>,
    transport: T,
    sync_config: SyncConfig,
    state: SessionState,
    event_queue: VecDeque<SessionEvent>,
    /// The frame the local input was last submitted for.
    local_input_frame: Frame,
    /// The newest local input frame handed to the peer handles.
    last_sent_frame: Frame,
    bootstrap: Bootstrap,
    /// First fatal error; the session refuses to advance once set.
    failure: Option<RollbackError>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for LockstepSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockstepSession")
            .field("local", &self.local)
            .field("engine", &self.engine)
            .field("router", &self.router)
            .field("transport", &self.transport)
            .field("sync_config", &self.sync_config)
            .field("state", &self.state)
            .field("event_queue", &self.event_queue)
            .field("local_input_frame", &self.local_input_frame)
            .field("last_sent_frame", &self.last_sent_frame)
            .field("bootstrap", &self.bootstrap)
            .field("failure", &self.failure)
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish()
    }
}

impl<T: Transport> LockstepSession<T> {
    pub(crate) fn new(
        local: ParticipantIndex,
        engine: SyncEngine,
        router: MessageRouter<PeerHandle>,
        transport: T,
        sync_config: SyncConfig,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        // without remote participants there is nothing to synchronize with
        let state = if router.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };
        Self {
            local,
            engine,
            router,
            transport,
            sync_config,
            state,
            event_queue: VecDeque::new(),
            local_input_frame: Frame::NULL,
            last_sent_frame: Frame::NULL,
            bootstrap: Bootstrap::Idle,
            failure: None,
            violation_observer,
        }
    }

    /// Registers the local input for the current frame and queues it for every peer.
    /// Must be called once per frame before [`advance_frame`](Self::advance_frame).
    ///
    /// # Errors
    /// - [`RollbackError::NotSynchronized`] while the session is synchronizing.
    /// - [`RollbackError::PredictionBarrier`] if the session is too far ahead of the confirmed
    ///   frame. Nothing was queued; skip this tick and try again.
    /// - [`RollbackError::InvalidRequest`] if input was already submitted for this frame.
    /// - Any fatal error recorded earlier.
    pub fn add_local_input(&mut self, data: u32) -> Result<(), RollbackError> {
        self.check_failure()?;
        if self.state != SessionState::Running {
            return Err(RollbackError::NotSynchronized);
        }
        let frame = self.engine.current_frame();
        if self.local_input_frame == frame {
            return Err(RollbackError::InvalidRequest {
                info: format!("local input for frame {} was already added", frame),
            });
        }

        let stored = self
            .engine
            .add_local_input(self.local.as_usize(), data)
            .inspect_err(|err| self.record_if_fatal(err))?;
        self.local_input_frame = frame;
        self.broadcast_local_input(stored);
        Ok(())
    }

    /// Receives and routes pending envelopes, applies the resulting events and inputs,
    /// then simulates one frame, rolling back first if a prediction turned out wrong.
    ///
    /// # Errors
    /// - [`RollbackError::NotSynchronized`] while the session is synchronizing.
    /// - [`RollbackError::InvalidRequest`] if no local input was added for the current frame.
    /// - Whatever the engine or the simulation handler return. Fatal errors are kept and
    ///   returned again by every later call.
    pub fn advance_frame<H>(&mut self, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        self.poll_remote_clients();
        self.check_failure()?;
        self.apply_received_snapshot(sim)?;

        if self.state != SessionState::Running {
            trace!("Session not synchronized; returning error");
            return Err(RollbackError::NotSynchronized);
        }
        if self.local_input_frame != self.engine.current_frame() {
            return Err(RollbackError::InvalidRequest {
                info: format!(
                    "no local input added for frame {}",
                    self.engine.current_frame()
                ),
            });
        }

        self.engine
            .advance(sim)
            .inspect_err(|err| self.record_if_fatal(err))?;
        crate::debug_check_invariants!(self, "after advance_frame");
        Ok(())
    }

    /// Should be called periodically to give the session a chance to do internal work: receive
    /// envelopes, hand them to the peer handles, process their events and send what they queued.
    pub fn poll_remote_clients(&mut self) {
        let now = Instant::now();

        while let Some(msg) = self.transport.recv() {
            self.receive(msg);
        }

        let current_frame = self.engine.current_frame();
        let mut events = Vec::new();
        for (index, handle) in self.router.iter_mut() {
            if handle.is_running() {
                handle.update_local_frame_advantage(current_frame);
            }
            events.extend(handle.poll_at(now).map(|event| (index, event)));
        }
        for (index, event) in events {
            self.handle_event(index, event);
        }

        self.update_participant_disconnects();
        self.update_confirmation_limit();
        self.share_connect_status(now);
        self.send_bootstrap_request(now);

        for (_, handle) in self.router.iter_mut() {
            handle.send_all_messages(&mut self.transport);
        }
    }

    /// Asks `peer` for a snapshot to start from instead of frame 0. Only possible while
    /// synchronizing; the session stays synchronizing until the snapshot is applied by
    /// [`advance_frame`](Self::advance_frame), which raises [`SessionEvent::Bootstrapped`].
    ///
    /// The snapshot is sent in a single envelope. A peer whose saved state is larger than
    /// [`MAX_BOOTSTRAP_STATE_SIZE`] refuses to answer and reports a
    /// [`ViolationKind::NetworkProtocol`] error, so the request stays pending until `peer`
    /// disconnects.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if the session is already running or `peer`
    /// is not a connected remote participant.
    pub fn request_bootstrap(&mut self, peer: ParticipantIndex) -> Result<(), RollbackError> {
        if self.state != SessionState::Synchronizing {
            return Err(RollbackError::InvalidRequest {
                info: "bootstrap is only possible while synchronizing".to_owned(),
            });
        }
        if !self.router.is_linked(peer) {
            return Err(RollbackError::InvalidRequest {
                info: format!("participant {} is not a connected remote", peer),
            });
        }
        debug!(%peer, "requesting bootstrap snapshot");
        self.bootstrap = Bootstrap::Awaiting {
            peer,
            last_request: None,
            buffered: Vec::new(),
        };
        Ok(())
    }

    /// Disconnects a remote participant. Its input is blank from its last confirmed frame on.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] for the local participant or one that is not
    /// connected.
    pub fn disconnect_participant(&mut self, index: ParticipantIndex) -> Result<(), RollbackError> {
        if index == self.local {
            return Err(RollbackError::InvalidRequest {
                info: "the local participant cannot be disconnected".to_owned(),
            });
        }
        if !self.router.is_linked(index) {
            return Err(RollbackError::InvalidRequest {
                info: format!("participant {} is not connected", index),
            });
        }
        self.remove_participant(index);
        Ok(())
    }

    /// Connection statistics for a remote participant.
    ///
    /// # Errors
    /// - [`RollbackError::InvalidRequest`] if `index` is not a connected remote participant.
    /// - [`RollbackError::NotSynchronized`] if the handshake with it has not completed.
    pub fn network_stats(&self, index: ParticipantIndex) -> Result<NetworkStats, RollbackError> {
        self.router
            .get(index)
            .ok_or_else(|| RollbackError::InvalidRequest {
                info: format!("participant {} is not a connected remote", index),
            })?
            .network_stats()
    }

    /// Returns all events that happened since last queried. The oldest are dropped beyond
    /// `MAX_EVENT_QUEUE_SIZE`.
    pub fn events(&mut self) -> Drain<'_, SessionEvent> {
        self.event_queue.drain(..)
    }

    /// The frame the next [`advance_frame`](Self::advance_frame) simulates.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.engine.current_frame()
    }

    /// The newest frame whose inputs are final for every connected participant.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.engine.last_confirmed_frame()
    }

    /// `true` while the engine is resimulating after a misprediction.
    #[must_use]
    pub fn is_rolling_back(&self) -> bool {
        self.engine.is_rolling_back()
    }

    /// Returns the current [`SessionState`].
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The participant this session controls.
    #[must_use]
    pub fn local_participant(&self) -> ParticipantIndex {
        self.local
    }

    /// Total number of participants, connected or not.
    #[must_use]
    pub fn num_participants(&self) -> usize {
        self.engine.num_participants()
    }

    /// Remote participants that are still connected, in index order.
    #[must_use]
    pub fn remote_participants(&self) -> Vec<ParticipantIndex> {
        self.router.indices().collect()
    }

    /// The maximum prediction window.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.engine.max_prediction()
    }

    /// The observer violations are reported to, if one was configured with
    /// [`SessionBuilder::with_violation_observer`](crate::SessionBuilder::with_violation_observer).
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    /// Read access to the engine.
    #[must_use]
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// The fatal error that stopped the session, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&RollbackError> {
        self.failure.as_ref()
    }

    fn check_failure(&self) -> Result<(), RollbackError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record_if_fatal(&mut self, err: &RollbackError) {
        if err.is_fatal() && self.failure.is_none() {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::Synchronization,
                "session stopped: {}",
                err
            );
            self.failure = Some(err.clone());
        }
    }

    fn receive(&mut self, msg: Message) {
        let from = msg.from;
        let bootstrap_reply = match &msg.body {
            MessageBody::FrameReply { frame, state } => Some((*frame, state.clone())),
            _ => None,
        };
        let is_frame_request = matches!(msg.body, MessageBody::FrameRequest);

        if let Err(err) = self.router.route(msg) {
            if err.is_transport_anomaly() {
                trace!(%from, %err, "dropping message");
            } else {
                warn!(%from, %err, "failed to handle message");
            }
            return;
        }

        if is_frame_request {
            self.answer_bootstrap_request(from);
        }
        if let Some((frame, state)) = bootstrap_reply {
            self.accept_bootstrap_reply(from, frame, state);
        }
    }

    fn answer_bootstrap_request(&mut self, from: ParticipantIndex) {
        if self.state != SessionState::Running {
            trace!(%from, "ignoring bootstrap request while synchronizing");
            return;
        }
        let Some(snapshot) = self.engine.current_snapshot() else {
            trace!(%from, "no snapshot for the current frame yet");
            return;
        };
        if snapshot.state.len() > MAX_BOOTSTRAP_STATE_SIZE {
            let violation = ContractViolation::new(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                format!(
                    "snapshot for participant {} does not fit into one datagram",
                    from
                ),
                concat!(file!(), ":", line!()),
            )
            .with_frame(snapshot.frame)
            .with_context("state_bytes", snapshot.state.len().to_string())
            .with_context("limit", MAX_BOOTSTRAP_STATE_SIZE.to_string());
            report_to_observer(self.violation_observer.as_ref(), &violation);
            return;
        }
        let body = MessageBody::FrameReply {
            frame: snapshot.frame,
            state: snapshot.state.clone(),
        };
        if let Some(handle) = self.router.get_mut(from) {
            debug!(%from, frame = %snapshot.frame, "answering bootstrap request");
            handle.queue_body(body);
        }
    }

    fn accept_bootstrap_reply(&mut self, from: ParticipantIndex, frame: Frame, state: Vec<u8>) {
        let bootstrap = std::mem::replace(&mut self.bootstrap, Bootstrap::Idle);
        self.bootstrap = match bootstrap {
            Bootstrap::Awaiting { peer, buffered, .. } if peer == from => {
                debug!(%from, %frame, "received bootstrap snapshot");
                Bootstrap::Received {
                    frame,
                    state,
                    buffered,
                }
            },
            other => {
                trace!(%from, "ignoring unsolicited bootstrap reply");
                other
            },
        };
    }

    fn send_bootstrap_request(&mut self, now: Instant) {
        let Bootstrap::Awaiting {
            peer, last_request, ..
        } = &mut self.bootstrap
        else {
            return;
        };
        let due = last_request.is_none_or(|sent| sent + self.sync_config.sync_retry_interval < now);
        if !due {
            return;
        }
        if let Some(handle) = self.router.get_mut(*peer) {
            if handle.is_running() {
                handle.queue_body(MessageBody::FrameRequest);
                *last_request = Some(now);
            }
        }
    }

    fn apply_received_snapshot<H>(&mut self, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        if !matches!(self.bootstrap, Bootstrap::Received { .. }) {
            return Ok(());
        }
        let Bootstrap::Received {
            frame,
            state,
            buffered,
        } = std::mem::replace(&mut self.bootstrap, Bootstrap::Idle)
        else {
            return Ok(());
        };

        self.engine.seed(frame, state, sim)?;
        self.local_input_frame = Frame::NULL;
        self.last_sent_frame = frame - 1;

        // inputs older than the snapshot are absorbed by the restarted queues
        for (index, input) in buffered {
            self.add_remote_input(index, input);
        }

        debug!(%frame, "bootstrapped");
        self.push_event(SessionEvent::Bootstrapped { frame });
        self.check_initial_sync();
        Ok(())
    }

    fn broadcast_local_input(&mut self, stored: Frame) {
        if stored.is_null() {
            return;
        }
        let Some(queue) = self.engine.queue(self.local.as_usize()) else {
            return;
        };
        let first = self.last_sent_frame.as_i32() + 1;
        let inputs: Vec<Input> = (first..=stored.as_i32())
            .filter_map(|frame| queue.confirmed_input(Frame::new(frame)))
            .collect();
        self.share_connect_status(Instant::now());
        for input in inputs {
            for (_, handle) in self.router.iter_mut() {
                handle.send_input(input);
            }
        }
        self.last_sent_frame = stored;
    }

    fn add_remote_input(&mut self, index: ParticipantIndex, input: Input) {
        if let Bootstrap::Awaiting { buffered, .. } | Bootstrap::Received { buffered, .. } =
            &mut self.bootstrap
        {
            buffered.push((index, input));
            return;
        }
        if let Err(err) = self.engine.add_remote_input(index.as_usize(), input) {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "failed to add input of participant {} for frame {}: {}",
                index,
                input.frame,
                err
            );
            self.record_if_fatal(&err);
        }
    }

    fn handle_event(&mut self, participant: ParticipantIndex, event: PeerEvent) {
        match event {
            PeerEvent::Synchronizing { total, count } => {
                self.push_event(SessionEvent::Synchronizing {
                    participant,
                    total,
                    count,
                });
            },
            PeerEvent::Synchronized => {
                self.push_event(SessionEvent::Synchronized { participant });
                self.check_initial_sync();
            },
            PeerEvent::Input(input) => self.add_remote_input(participant, input),
            PeerEvent::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(SessionEvent::NetworkInterrupted {
                    participant,
                    disconnect_timeout,
                });
            },
            PeerEvent::NetworkResumed => {
                self.push_event(SessionEvent::NetworkResumed { participant });
            },
            PeerEvent::Disconnected => self.remove_participant(participant),
        }
    }

    fn remove_participant(&mut self, index: ParticipantIndex) {
        if !self.router.is_linked(index) {
            return;
        }
        let last_frame = self
            .engine
            .queue(index.as_usize())
            .map_or(Frame::NULL, |queue| queue.newest_confirmed_frame());
        self.disconnect_at(index, last_frame);
    }

    /// Disconnects `index` in the engine as of `last_frame` and drops its handle.
    fn disconnect_at(&mut self, index: ParticipantIndex, last_frame: Frame) {
        match self
            .engine
            .disconnect_participant_at(index.as_usize(), last_frame)
        {
            Ok(last_frame) => debug!(%index, %last_frame, "participant removed"),
            Err(err) => report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::InternalError,
                "failed to disconnect participant {}: {}",
                index,
                err
            ),
        }
        let Some(mut handle) = self.router.unlink(index) else {
            return;
        };
        handle.disconnect();
        if let Bootstrap::Awaiting { peer, .. } = &self.bootstrap {
            if *peer == index {
                warn!(%index, "bootstrap peer disconnected; starting from the local state");
                self.bootstrap = Bootstrap::Idle;
            }
        }
        self.push_event(SessionEvent::Disconnected { participant: index });
        self.check_initial_sync();
    }

    /// Disconnects participants that a running peer reports as gone, at the oldest frame
    /// any running peer (or this session) holds input for. Survivors that lost a
    /// participant at different frames thereby agree on the earliest one.
    fn update_participant_disconnects(&mut self) {
        let local_status = self.engine.connection_statuses();
        for (index, status) in local_status.iter().enumerate() {
            let participant = ParticipantIndex::new(index);
            if participant == self.local {
                continue;
            }

            let mut reported_gone = false;
            let mut agreed = if status.disconnected {
                None
            } else {
                Some(status.last_frame)
            };
            for (_, handle) in self.router.iter() {
                if !handle.is_running() {
                    continue;
                }
                let Some(view) = handle.peer_connect_status(participant) else {
                    continue;
                };
                reported_gone |= view.disconnected;
                agreed = Some(
                    agreed.map_or(view.last_frame, |frame| frame.min(view.last_frame)),
                );
            }

            let Some(agreed) = agreed else {
                continue;
            };
            // confirmed frames are final, so nothing before them can change
            let moves_back =
                agreed.max(self.engine.last_confirmed_frame()) < status.last_frame;
            if reported_gone && (!status.disconnected || moves_back) {
                debug!(%participant, %agreed, "peer reports participant as disconnected");
                self.disconnect_at(participant, agreed);
            }
        }
    }

    /// A running peer that still sees a participant we disconnected may disconnect it
    /// at an earlier frame later on. Frames after its view stay unconfirmed until then.
    fn update_confirmation_limit(&mut self) {
        let mut limit: Option<Frame> = None;
        for (index, status) in self.engine.connection_statuses().iter().enumerate() {
            if !status.disconnected {
                continue;
            }
            let participant = ParticipantIndex::new(index);
            for (_, handle) in self.router.iter() {
                if !handle.is_running() {
                    continue;
                }
                if let Some(view) = handle.peer_connect_status(participant) {
                    if !view.disconnected && view.last_frame < status.last_frame {
                        limit = Some(
                            limit.map_or(view.last_frame, |frame| frame.min(view.last_frame)),
                        );
                    }
                }
            }
        }
        self.engine.limit_confirmed_frame(limit);
    }

    fn share_connect_status(&mut self, now: Instant) {
        let connect_status = self.engine.connection_statuses();
        for (_, handle) in self.router.iter_mut() {
            handle.set_connect_status_at(&connect_status, now);
        }
    }

    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing
            || !matches!(self.bootstrap, Bootstrap::Idle)
        {
            return;
        }
        if self.router.iter().all(|(_, handle)| handle.is_running()) {
            debug!("all peers synchronized; session running");
            self.state = SessionState::Running;
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }
}

impl<T: Transport> InvariantChecker for LockstepSession<T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.router.is_linked(self.local) {
            return Err(InvariantViolation::new(
                "LockstepSession",
                "the local participant has no peer handle",
            ));
        }
        if self.state == SessionState::Synchronizing && self.local_input_frame.is_valid() {
            return Err(InvariantViolation::new(
                "LockstepSession",
                "no local input is accepted while synchronizing",
            ));
        }
        if self.last_sent_frame < self.local_input_frame && !self.last_sent_frame.is_null() {
            return Err(InvariantViolation::new(
                "LockstepSession",
                "local input is sent as soon as it is stored",
            )
            .with_details(format!(
                "last_sent_frame={}, local_input_frame={}",
                self.last_sent_frame, self.local_input_frame
            )));
        }
        self.engine.check_invariants()
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
    use crate::network::mailbox::{MailboxHub, MailboxTransport};
    use crate::sessions::builder::SessionBuilder;
    use crate::sessions::config::{ProtocolConfig, RollbackConfig};

    #[derive(Default)]
    struct Tally {
        sum: u64,
        frames: u32,
    }

    impl SimulationHandler for Tally {
        fn update(&mut self, inputs: &[Input], _frame: Frame) {
            self.frames += 1;
            for (index, input) in inputs.iter().enumerate() {
                self.sum = self
                    .sum
                    .wrapping_mul(7)
                    .wrapping_add(u64::from(input.data) * (index as u64 + 1));
            }
        }

        fn save_state(&self) -> Result<Vec<u8>, RollbackError> {
            let mut bytes = self.sum.to_le_bytes().to_vec();
            bytes.extend_from_slice(&self.frames.to_le_bytes());
            Ok(bytes)
        }

        fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError> {
            let (sum, frames) = snapshot.split_at(8);
            self.sum = u64::from_le_bytes(sum.try_into().unwrap());
            self.frames = u32::from_le_bytes(frames.try_into().unwrap());
            Ok(())
        }
    }

    fn session(hub: &MailboxHub, local: usize, rollback: RollbackConfig) -> LockstepSession<MailboxTransport> {
        SessionBuilder::new()
            .with_num_participants(hub.participants())
            .unwrap()
            .with_local_participant(ParticipantIndex::new(local))
            .with_rollback_config(rollback)
            .with_protocol_config(ProtocolConfig::deterministic(local as u64))
            .start_session(hub.transport(ParticipantIndex::new(local)).unwrap())
            .unwrap()
    }

    fn synchronize(sessions: &mut [LockstepSession<MailboxTransport>]) {
        for _ in 0..20 {
            for session in sessions.iter_mut() {
                session.poll_remote_clients();
            }
        }
        for session in sessions.iter() {
            assert_eq!(session.current_state(), SessionState::Running);
        }
    }

    #[test]
    fn input_and_advance_require_running_session() {
        let hub = MailboxHub::new(2);
        let mut a = session(&hub, 0, RollbackConfig::default());
        let mut sim = Tally::default();
        assert_eq!(a.add_local_input(1), Err(RollbackError::NotSynchronized));
        assert_eq!(a.advance_frame(&mut sim), Err(RollbackError::NotSynchronized));
        assert_eq!(sim.frames, 0);
    }

    #[test]
    fn two_sessions_synchronize_and_emit_events() {
        let hub = MailboxHub::new(2);
        let mut sessions = vec![
            session(&hub, 0, RollbackConfig::default()),
            session(&hub, 1, RollbackConfig::default()),
        ];
        synchronize(&mut sessions);

        let events: Vec<SessionEvent> = sessions[0].events().collect();
        assert!(events.contains(&SessionEvent::Synchronized {
            participant: ParticipantIndex::new(1)
        }));
        assert!(events.contains(&SessionEvent::Synchronizing {
            participant: ParticipantIndex::new(1),
            total: 5,
            count: 1
        }));
    }

    #[test]
    fn local_input_once_per_frame() {
        let hub = MailboxHub::new(1);
        let mut solo = session(&hub, 0, RollbackConfig::default());
        let mut sim = Tally::default();

        assert!(matches!(
            solo.advance_frame(&mut sim),
            Err(RollbackError::InvalidRequest { .. })
        ));
        solo.add_local_input(3).unwrap();
        assert!(matches!(
            solo.add_local_input(4),
            Err(RollbackError::InvalidRequest { .. })
        ));
        solo.advance_frame(&mut sim).unwrap();
        assert_eq!(sim.frames, 1);
        assert_eq!(solo.current_frame(), Frame::new(1));
    }

    #[test]
    fn peers_converge_on_the_same_state() {
        let hub = MailboxHub::new(2);
        let mut sessions = vec![
            session(&hub, 0, RollbackConfig::default()),
            session(&hub, 1, RollbackConfig::default()),
        ];
        synchronize(&mut sessions);
        let mut sims = [Tally::default(), Tally::default()];

        for frame in 0..30u32 {
            for (index, (session, sim)) in sessions.iter_mut().zip(sims.iter_mut()).enumerate() {
                session.add_local_input(frame % 5 + index as u32).unwrap();
                session.advance_frame(sim).unwrap();
            }
        }
        // let the last inputs arrive, then settle with idle frames
        for session in sessions.iter_mut() {
            session.poll_remote_clients();
        }

        let confirmed_a = sessions[0].confirmed_frame();
        let confirmed_b = sessions[1].confirmed_frame();
        assert!(confirmed_a >= Frame::new(25), "confirmed {}", confirmed_a);
        assert!(confirmed_b >= Frame::new(25), "confirmed {}", confirmed_b);
        assert_eq!(sessions[0].current_frame(), Frame::new(30));
        assert_eq!(sessions[1].current_frame(), Frame::new(30));

        // the snapshot of a frame both have confirmed must match
        let frame = Frame::new(28).min(confirmed_a).min(confirmed_b);
        let snap_a = sessions[0].engine().snapshots().get(frame).map(|s| s.state.clone());
        let snap_b = sessions[1].engine().snapshots().get(frame).map(|s| s.state.clone());
        assert!(snap_a.is_some());
        assert_eq!(snap_a, snap_b);
    }

    #[test]
    fn disconnect_participant_removes_the_handle() {
        let hub = MailboxHub::new(2);
        let mut sessions = vec![
            session(&hub, 0, RollbackConfig::default()),
            session(&hub, 1, RollbackConfig::default()),
        ];
        synchronize(&mut sessions);
        let a = &mut sessions[0];

        assert!(a.disconnect_participant(ParticipantIndex::new(0)).is_err());
        a.disconnect_participant(ParticipantIndex::new(1)).unwrap();
        assert!(a.remote_participants().is_empty());
        assert!(a.engine().is_disconnected(1));
        assert!(a.events().any(|event| event
            == SessionEvent::Disconnected {
                participant: ParticipantIndex::new(1)
            }));
        assert!(a.disconnect_participant(ParticipantIndex::new(1)).is_err());
        assert!(a.network_stats(ParticipantIndex::new(1)).is_err());

        // alone now, the session keeps going with blank remote input
        let mut sim = Tally::default();
        for _ in 0..20 {
            a.add_local_input(1).unwrap();
            a.advance_frame(&mut sim).unwrap();
        }
        assert_eq!(sim.frames, 20);
    }

    #[test]
    fn bootstrap_requires_synchronizing_and_a_linked_peer() {
        let hub = MailboxHub::new(2);
        let mut a = session(&hub, 0, RollbackConfig::default());
        assert!(a.request_bootstrap(ParticipantIndex::new(0)).is_err());
        assert!(a.request_bootstrap(ParticipantIndex::new(1)).is_ok());

        let solo_hub = MailboxHub::new(1);
        let mut solo = session(&solo_hub, 0, RollbackConfig::default());
        assert!(solo.request_bootstrap(ParticipantIndex::new(0)).is_err());
    }

    #[test]
    fn invariants_hold_for_a_running_session() {
        let hub = MailboxHub::new(1);
        let mut solo = session(&hub, 0, RollbackConfig::competitive());
        let mut sim = Tally::default();
        for data in 0..10 {
            solo.add_local_input(data).unwrap();
            solo.advance_frame(&mut sim).unwrap();
            assert!(solo.check_invariants().is_ok());
        }
    }
}
