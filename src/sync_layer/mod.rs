//! # Sync Layer - Rollback Core
//!
//! The sync layer keeps one [`PredictionQueue`] per participant and a [`SnapshotLog`]
//! of serialized simulation states, and drives a [`SimulationHandler`] through them.
//!
//! ## How a frame is advanced
//!
//! 1. Find the earliest frame any queue reports as mispredicted.
//! 2. If there is one, roll back: reset every queue's prediction, load the snapshot
//!    taken before that frame and resimulate up to the present.
//! 3. Gather one input per participant for the current frame (confirmed or predicted).
//! 4. Run [`SimulationHandler::update`].
//! 5. Save a snapshot for the next frame and increment the frame counter.
//! 6. Raise the confirmed frame to the newest frame every participant has confirmed
//!    and discard the input history before it.
//!
//! ## Bounds
//!
//! - Local input is refused once the simulation is `max_prediction` frames ahead of the
//!   confirmed frame, which keeps every possible rollback target inside the snapshot log.
//! - The snapshot log holds `max_prediction + 2` states.
//! - Rollback resimulation cannot produce new mispredictions because no input arrives
//!   while it runs. The engine still re-checks afterwards and gives up after
//!   `max_prediction` passes.
//!
//! ## Determinism Requirement
//!
//! The simulation MUST be deterministic. Given the same snapshot and inputs, every
//! peer must produce identical states. Avoid floating point drift, `HashMap` iteration
//! order, wall-clock time and unseeded randomness inside [`SimulationHandler::update`].

mod saved_states;

pub use saved_states::{Snapshot, SnapshotLog};

use crate::frame_info::{Input, InputVec};
use crate::input_queue::{PredictionQueue, INPUT_QUEUE_LENGTH};
use crate::network::messages::ConnectionStatus;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{report_violation, Frame, InputStatus, RollbackError, SimulationHandler};
use tracing::debug;

/// Default number of frames the simulation may run ahead of the confirmed frame.
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// Owns the input queues and the snapshot log of one simulation and performs rollbacks.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    num_participants: usize,
    max_prediction: usize,
    frame_count: Frame,
    last_confirmed_frame: Frame,
    rolling_back: bool,
    queues: Vec<PredictionQueue>,
    connect_status: Vec<ConnectionStatus>,
    /// First frame simulated with the predicted input of a participant that turned out to
    /// be disconnected already. The next advance resimulates from here.
    disconnect_frame: Frame,
    confirm_limit: Option<Frame>,
    snapshots: SnapshotLog,
}

impl SyncEngine {
    /// Creates an engine with queues of the default capacity.
    pub fn new(num_participants: usize, max_prediction: usize) -> Result<Self, RollbackError> {
        Self::with_queue_length(num_participants, max_prediction, INPUT_QUEUE_LENGTH)
    }

    /// Creates an engine whose queues hold `queue_length` inputs each.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if there are no participants, if
    /// `max_prediction` is zero, or if a queue could not hold `max_prediction` frames.
    pub fn with_queue_length(
        num_participants: usize,
        max_prediction: usize,
        queue_length: usize,
    ) -> Result<Self, RollbackError> {
        if num_participants == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "a session needs at least one participant".to_owned(),
            });
        }
        if max_prediction == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "max_prediction must be at least 1".to_owned(),
            });
        }
        if queue_length <= max_prediction {
            return Err(RollbackError::InvalidRequest {
                info: format!(
                    "queue_length {} must exceed max_prediction {}",
                    queue_length, max_prediction
                ),
            });
        }

        let mut queues = Vec::with_capacity(num_participants);
        for index in 0..num_participants {
            let queue = PredictionQueue::with_queue_length(index, queue_length).ok_or_else(|| {
                RollbackError::InvalidRequest {
                    info: format!("invalid queue length {}", queue_length),
                }
            })?;
            queues.push(queue);
        }

        Ok(Self {
            num_participants,
            max_prediction,
            frame_count: Frame::new(0),
            last_confirmed_frame: Frame::NULL,
            rolling_back: false,
            queues,
            connect_status: vec![ConnectionStatus::default(); num_participants],
            disconnect_frame: Frame::NULL,
            confirm_limit: None,
            snapshots: SnapshotLog::new(max_prediction),
        })
    }

    /// The frame that the next call to [`advance`](Self::advance) simulates.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.frame_count
    }

    /// The newest frame for which the input of every connected participant is known.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// The configured rollback depth.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// The number of participants.
    #[must_use]
    pub fn num_participants(&self) -> usize {
        self.num_participants
    }

    /// `true` while a rollback is resimulating frames.
    #[must_use]
    pub fn is_rolling_back(&self) -> bool {
        self.rolling_back
    }

    /// The snapshot log.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotLog {
        &self.snapshots
    }

    /// The snapshot of the current frame, if it has been saved.
    #[must_use]
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.get(self.frame_count)
    }

    /// The queue of one participant.
    #[must_use]
    pub fn queue(&self, index: usize) -> Option<&PredictionQueue> {
        self.queues.get(index)
    }

    /// Sets the input delay of one participant's queue.
    pub fn set_frame_delay(&mut self, index: usize, delay: usize) -> Result<(), RollbackError> {
        self.check_index(index)?;
        self.queues[index].set_frame_delay(delay)
    }

    /// Adds the local participant's input for the current frame.
    ///
    /// # Errors
    /// Returns [`RollbackError::PredictionBarrier`] without enqueuing anything once the
    /// simulation is `max_prediction` frames ahead of the confirmed frame. The caller is
    /// expected to submit again next tick.
    pub fn add_local_input(&mut self, index: usize, data: u32) -> Result<Frame, RollbackError> {
        self.check_index(index)?;
        self.trim_confirmed();
        self.check_prediction_barrier()?;
        self.queues[index].add_input(Input::new(self.frame_count, data))
    }

    /// Adds an input received from a remote participant.
    pub fn add_remote_input(&mut self, index: usize, input: Input) -> Result<Frame, RollbackError> {
        self.check_index(index)?;
        if self.connect_status[index].disconnected {
            debug!(index, frame = %input.frame, "dropping input of disconnected participant");
            return Ok(Frame::NULL);
        }
        let stored = self.queues[index].add_input(input)?;
        self.trim_confirmed();
        Ok(stored)
    }

    /// Raises the confirmed frame and discards the input history that is no longer needed.
    pub fn set_last_confirmed_frame(&mut self, frame: Frame) {
        if frame < self.last_confirmed_frame {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "confirmed frame lowered from {} to {}",
                self.last_confirmed_frame,
                frame
            );
        }
        self.last_confirmed_frame = frame;
        if frame > 0 {
            for queue in &mut self.queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// The earliest mispredicted frame across all queues, or [`Frame::NULL`].
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.queues
            .iter()
            .map(PredictionQueue::first_incorrect_frame)
            .filter(|frame| !frame.is_null())
            .min()
            .unwrap_or(Frame::NULL)
    }

    /// Collects one input per participant for the current frame.
    pub fn synchronized_inputs(&mut self) -> Result<InputVec, RollbackError> {
        let frame = self.frame_count;
        let mut inputs = InputVec::with_capacity(self.num_participants);
        for (queue, status) in self.queues.iter_mut().zip(&self.connect_status) {
            let (input, input_status) = if status.disconnected && status.last_frame < frame {
                (Input::blank(frame), InputStatus::Disconnected)
            } else {
                queue.input(frame)?
            };
            if input_status == InputStatus::Disconnected {
                debug!(frame = %frame, "blank input for disconnected participant");
            }
            inputs.push(input);
        }
        Ok(inputs)
    }

    /// Simulates one frame, rolling back first if a misprediction is pending.
    pub fn advance<H>(&mut self, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        self.trim_confirmed();
        self.check_prediction_barrier()?;

        if !self.snapshots.contains(self.frame_count) {
            self.save_state(sim)?;
        }

        let mut passes = 0;
        loop {
            let target = self.rollback_target();
            if target.is_null() {
                break;
            }
            if passes >= self.max_prediction {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::FrameSync,
                    "rollback did not settle after {} passes (frame {})",
                    passes,
                    target
                );
                return Err(RollbackError::InvalidRequest {
                    info: format!("rollback to frame {} did not settle", target),
                });
            }
            self.rollback(target, sim)?;
            self.disconnect_frame = Frame::NULL;
            passes += 1;
        }

        self.step(sim)?;
        self.trim_confirmed();
        crate::debug_check_invariants!(self, "after advance");
        Ok(())
    }

    /// Rewinds to `target`, then resimulates up to the current frame.
    ///
    /// # Errors
    /// - [`RollbackError::InvalidFrame`] if `target` is not in the past.
    /// - [`RollbackError::SnapshotMissing`] if the log no longer holds `target`.
    pub fn rollback<H>(&mut self, target: Frame, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        if !target.is_valid() || target >= self.frame_count {
            return Err(RollbackError::InvalidFrame {
                frame: target,
                reason: format!("rollback target must be before frame {}", self.frame_count),
            });
        }

        let resume_frame = self.frame_count;
        debug!(from = %resume_frame, to = %target, "rolling back");
        self.rolling_back = true;
        let result = self.resimulate(target, resume_frame, sim);
        self.rolling_back = false;
        result
    }

    /// Replaces the engine state with a snapshot received from a running peer.
    /// All queues restart at `frame`.
    pub fn seed<H>(&mut self, frame: Frame, state: Vec<u8>, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        if !frame.is_valid() {
            return Err(RollbackError::InvalidFrame {
                frame,
                reason: "seed frame must be non-negative".to_owned(),
            });
        }
        sim.load_state(&state)?;
        self.frame_count = frame;
        self.last_confirmed_frame = frame - 1;
        self.rolling_back = false;
        for queue in &mut self.queues {
            queue.restart_at(frame);
        }
        // participants that left before the snapshot stay gone
        for status in &mut self.connect_status {
            if status.disconnected {
                status.last_frame = frame - 1;
            }
        }
        self.disconnect_frame = Frame::NULL;
        self.confirm_limit = None;
        self.snapshots.clear();
        self.snapshots.save(frame, state)
    }

    /// Stops waiting for a participant. Frames after its newest confirmed input are
    /// simulated with blank input, and it no longer holds back the confirmed frame.
    pub fn disconnect_participant(&mut self, index: usize) -> Result<Frame, RollbackError> {
        self.check_index(index)?;
        let last_frame = self.queues[index].newest_confirmed_frame();
        self.disconnect_participant_at(index, last_frame)
    }

    /// Disconnects a participant as of `last_frame`: every later frame uses blank input.
    /// Frames after `last_frame` that were already simulated with its predicted input are
    /// resimulated by the next [`advance`](Self::advance).
    ///
    /// Calling this again for a disconnected participant can only move `last_frame` back.
    /// `last_frame` never exceeds the participant's newest confirmed input and never drops
    /// below the confirmed frame, since confirmed frames are final. Returns the frame used.
    pub fn disconnect_participant_at(
        &mut self,
        index: usize,
        last_frame: Frame,
    ) -> Result<Frame, RollbackError> {
        self.check_index(index)?;
        let requested = last_frame.min(self.queues[index].newest_confirmed_frame());
        let current = self.connect_status[index];
        if current.disconnected && current.last_frame <= requested {
            return Ok(current.last_frame);
        }

        let last_frame = requested.max(self.last_confirmed_frame);
        if current.disconnected && current.last_frame <= last_frame {
            return Ok(current.last_frame);
        }
        if last_frame > requested {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Synchronization,
                "participant {} disconnected at frame {} but frames up to {} are confirmed",
                index,
                requested,
                last_frame
            );
        }

        self.connect_status[index] = ConnectionStatus {
            disconnected: true,
            last_frame,
        };
        let first_blank = last_frame + 1;
        if first_blank < self.frame_count
            && (self.disconnect_frame.is_null() || first_blank < self.disconnect_frame)
        {
            self.disconnect_frame = first_blank;
        }
        debug!(index, last_frame = %last_frame, "participant disconnected");
        Ok(last_frame)
    }

    /// What this engine knows about every participant, indexed by participant.
    #[must_use]
    pub fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.queues
            .iter()
            .zip(&self.connect_status)
            .map(|(queue, status)| {
                if status.disconnected {
                    *status
                } else {
                    ConnectionStatus {
                        disconnected: false,
                        last_frame: queue.newest_confirmed_frame(),
                    }
                }
            })
            .collect()
    }

    /// Keeps the confirmed frame at or below `limit` until it is lifted with `None`.
    /// Frames above the limit stay open to rollbacks.
    pub fn limit_confirmed_frame(&mut self, limit: Option<Frame>) {
        self.confirm_limit = limit;
    }

    /// `true` if the participant was disconnected.
    #[must_use]
    pub fn is_disconnected(&self, index: usize) -> bool {
        self.connect_status
            .get(index)
            .is_some_and(|status| status.disconnected)
    }

    /// The earliest frame that has to be resimulated, or [`Frame::NULL`].
    fn rollback_target(&self) -> Frame {
        let incorrect = self.first_incorrect_frame();
        match (incorrect.is_null(), self.disconnect_frame.is_null()) {
            (true, _) => self.disconnect_frame,
            (false, true) => incorrect,
            (false, false) => incorrect.min(self.disconnect_frame),
        }
    }

    fn check_index(&self, index: usize) -> Result<(), RollbackError> {
        if index >= self.num_participants {
            return Err(RollbackError::InvalidParticipant {
                index: index.into(),
                count: self.num_participants,
            });
        }
        Ok(())
    }

    fn check_prediction_barrier(&self) -> Result<(), RollbackError> {
        let frames_behind = self.frame_count - self.last_confirmed_frame;
        if frames_behind >= self.max_prediction as i32 {
            return Err(RollbackError::PredictionBarrier {
                frames_behind,
                max_prediction: self.max_prediction,
            });
        }
        Ok(())
    }

    fn resimulate<H>(&mut self, target: Frame, resume_frame: Frame, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        for queue in &mut self.queues {
            queue.reset_prediction(target - 1)?;
        }

        let Some(snapshot) = self.snapshots.get(target) else {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "no snapshot for rollback target {} (log holds {} frames)",
                target,
                self.snapshots.len()
            );
            return Err(RollbackError::SnapshotMissing { frame: target });
        };
        sim.load_state(&snapshot.state)?;
        self.frame_count = target;

        while self.frame_count < resume_frame {
            self.step(sim)?;
        }
        Ok(())
    }

    fn step<H>(&mut self, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        let inputs = self.synchronized_inputs()?;
        sim.update(&inputs, self.frame_count);
        self.frame_count += 1;
        self.save_state(sim)
    }

    fn save_state<H>(&mut self, sim: &mut H) -> Result<(), RollbackError>
    where
        H: SimulationHandler + ?Sized,
    {
        let state = sim.save_state()?;
        self.snapshots.save(self.frame_count, state)
    }

    /// Raises the confirmed frame to the newest frame every connected participant has confirmed.
    /// Stays below a pending misprediction so the rollback target keeps its input history.
    fn trim_confirmed(&mut self) {
        let mut confirmed: Option<Frame> = None;
        for (queue, status) in self.queues.iter().zip(&self.connect_status) {
            if status.disconnected {
                continue;
            }
            let newest = queue.newest_confirmed_frame();
            if newest.is_null() {
                return;
            }
            confirmed = Some(confirmed.map_or(newest, |c| c.min(newest)));
        }
        let Some(confirmed) = confirmed else {
            return;
        };
        let mut confirmed = confirmed.min(self.frame_count);
        let target = self.rollback_target();
        if !target.is_null() {
            confirmed = confirmed.min(target - 1);
        }
        if let Some(limit) = self.confirm_limit {
            confirmed = confirmed.min(limit);
        }
        if confirmed > self.last_confirmed_frame {
            self.set_last_confirmed_frame(confirmed);
        }
    }
}

impl InvariantChecker for SyncEngine {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.last_confirmed_frame > self.frame_count {
            return Err(InvariantViolation::new(
                "SyncEngine",
                "last_confirmed_frame is ahead of the current frame",
            )
            .with_details(format!(
                "last_confirmed_frame={}, frame_count={}",
                self.last_confirmed_frame, self.frame_count
            )));
        }
        if self.queues.len() != self.num_participants
            || self.connect_status.len() != self.num_participants
        {
            return Err(InvariantViolation::new(
                "SyncEngine",
                "one queue per participant",
            ));
        }
        if !self.disconnect_frame.is_null() && self.disconnect_frame >= self.frame_count {
            return Err(InvariantViolation::new(
                "SyncEngine",
                "pending disconnect rollback is in the past",
            )
            .with_details(format!(
                "disconnect_frame={}, frame_count={}",
                self.disconnect_frame, self.frame_count
            )));
        }
        if self.snapshots.len() != self.max_prediction + 2 {
            return Err(InvariantViolation::new(
                "SyncEngine",
                "snapshot log sized for max_prediction",
            ));
        }
        for queue in &self.queues {
            queue.check_invariants()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod sync_layer_tests {
    use super::*;

    /// Folds every input into a running value so that any change in history shows up.
    #[derive(Debug, Default)]
    struct Accumulator {
        value: u64,
        updates: usize,
        loads: usize,
    }

    impl SimulationHandler for Accumulator {
        fn update(&mut self, inputs: &[Input], frame: Frame) {
            for (index, input) in inputs.iter().enumerate() {
                self.value = self
                    .value
                    .wrapping_mul(31)
                    .wrapping_add(u64::from(input.data) * (index as u64 + 1))
                    .wrapping_add(frame.as_i32() as u64);
            }
            self.updates += 1;
        }

        fn save_state(&self) -> Result<Vec<u8>, RollbackError> {
            Ok(self.value.to_le_bytes().to_vec())
        }

        fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError> {
            let bytes: [u8; 8] = snapshot
                .try_into()
                .map_err(|_| RollbackError::Serialization {
                    context: "expected 8 bytes".to_owned(),
                })?;
            self.value = u64::from_le_bytes(bytes);
            self.loads += 1;
            Ok(())
        }
    }

    fn replay(history: &[[u32; 2]]) -> u64 {
        let mut sim = Accumulator::default();
        for (frame, inputs) in history.iter().enumerate() {
            let inputs = [
                Input::new(Frame::new(frame as i32), inputs[0]),
                Input::new(Frame::new(frame as i32), inputs[1]),
            ];
            sim.update(&inputs, Frame::new(frame as i32));
        }
        sim.value
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert!(SyncEngine::new(0, 8).is_err());
        assert!(SyncEngine::new(2, 0).is_err());
        assert!(SyncEngine::with_queue_length(2, 8, 8).is_err());
        assert!(SyncEngine::with_queue_length(2, 8, 9).is_ok());
    }

    #[test]
    fn test_advance_saves_snapshots() {
        let mut engine = SyncEngine::new(1, 8).unwrap();
        let mut sim = Accumulator::default();
        for frame in 0..5 {
            engine.add_local_input(0, frame).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        assert_eq!(engine.current_frame(), Frame::new(5));
        assert!(engine.snapshots().contains(Frame::new(0)));
        assert!(engine.snapshots().contains(Frame::new(5)));
        assert_eq!(engine.current_snapshot().unwrap().frame, Frame::new(5));
        assert_eq!(engine.last_confirmed_frame(), Frame::new(4));
        assert_eq!(sim.updates, 5);
    }

    #[test]
    fn test_prediction_barrier() {
        let mut engine = SyncEngine::new(2, 4).unwrap();
        let mut sim = Accumulator::default();
        // participant 1 never sends anything, so nothing gets confirmed
        for frame in 0..3 {
            engine.add_local_input(0, frame).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        // frame 3 - (-1) = 4 frames ahead
        assert_eq!(
            engine.add_local_input(0, 3),
            Err(RollbackError::PredictionBarrier {
                frames_behind: 4,
                max_prediction: 4
            })
        );
        assert!(matches!(
            engine.advance(&mut sim),
            Err(RollbackError::PredictionBarrier { .. })
        ));

        // remote input for frames 0..=2 releases the barrier
        for frame in 0..3 {
            engine
                .add_remote_input(1, Input::new(Frame::new(frame), 0))
                .unwrap();
        }
        assert_eq!(engine.last_confirmed_frame(), Frame::new(2));
        engine.add_local_input(0, 3).unwrap();
        engine.advance(&mut sim).unwrap();
        assert_eq!(engine.current_frame(), Frame::new(4));
    }

    #[test]
    fn test_misprediction_rolls_back_to_the_confirmed_history() {
        let mut engine = SyncEngine::new(2, 8).unwrap();
        let mut sim = Accumulator::default();
        let remote = [0u32, 0, 4, 4, 7, 7];
        let mut history = Vec::new();

        for frame in 0..6i32 {
            let local = (frame as u32) % 3;
            engine.add_local_input(0, local).unwrap();
            engine.advance(&mut sim).unwrap();
            history.push([local, remote[frame as usize]]);
        }
        assert_eq!(sim.loads, 0);

        for (frame, data) in remote.iter().enumerate() {
            engine
                .add_remote_input(1, Input::new(Frame::new(frame as i32), *data))
                .unwrap();
        }
        assert_eq!(engine.first_incorrect_frame(), Frame::new(2));

        engine.add_local_input(0, 1).unwrap();
        engine.advance(&mut sim).unwrap();
        history.push([1, 7]);

        assert_eq!(sim.loads, 1);
        assert!(!engine.is_rolling_back());
        assert!(engine.first_incorrect_frame().is_null());
        assert_eq!(engine.current_frame(), Frame::new(7));
        assert_eq!(sim.value, replay(&history));
    }

    #[test]
    fn test_rollback_requires_past_frame() {
        let mut engine = SyncEngine::new(1, 8).unwrap();
        let mut sim = Accumulator::default();
        assert!(matches!(
            engine.rollback(Frame::new(0), &mut sim),
            Err(RollbackError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_rollback_to_overwritten_snapshot_is_missing() {
        let mut engine = SyncEngine::new(1, 2).unwrap();
        let mut sim = Accumulator::default();
        for frame in 0..10 {
            engine.add_local_input(0, frame).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        assert_eq!(
            engine.rollback(Frame::new(1), &mut sim),
            Err(RollbackError::SnapshotMissing {
                frame: Frame::new(1)
            })
        );
        assert!(!engine.is_rolling_back());
    }

    #[test]
    fn test_explicit_rollback_reproduces_state() {
        let mut engine = SyncEngine::new(1, 8).unwrap();
        let mut sim = Accumulator::default();
        for frame in 0..6 {
            engine.add_local_input(0, frame * 2).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        let before = sim.value;
        // frames before last_confirmed - 1 are already discarded
        engine.rollback(Frame::new(4), &mut sim).unwrap();
        assert_eq!(sim.value, before);
        assert_eq!(engine.current_frame(), Frame::new(6));
    }

    #[test]
    fn test_set_last_confirmed_frame_discards_history() {
        let mut engine = SyncEngine::new(2, 8).unwrap();
        for frame in 0..6 {
            engine
                .add_remote_input(1, Input::new(Frame::new(frame), 1))
                .unwrap();
        }
        assert_eq!(engine.queue(1).unwrap().len(), 6);
        engine.set_last_confirmed_frame(Frame::new(4));
        assert_eq!(engine.queue(1).unwrap().len(), 3);
        assert_eq!(engine.last_confirmed_frame(), Frame::new(4));
    }

    #[test]
    fn test_disconnected_participant_gets_blank_input() {
        let mut engine = SyncEngine::new(2, 4).unwrap();
        let mut sim = Accumulator::default();
        engine
            .add_remote_input(1, Input::new(Frame::new(0), 9))
            .unwrap();
        assert_eq!(engine.disconnect_participant(1).unwrap(), Frame::new(0));
        assert!(engine.is_disconnected(1));

        for frame in 0..10 {
            engine.add_local_input(0, frame).unwrap();
            let inputs = engine.clone().synchronized_inputs().unwrap();
            if frame == 0 {
                assert_eq!(inputs[1].data, 9);
            } else {
                assert_eq!(inputs[1], Input::blank(Frame::new(frame as i32)));
            }
            engine.advance(&mut sim).unwrap();
        }
        // no barrier: the disconnected participant no longer holds back confirmation
        assert_eq!(engine.current_frame(), Frame::new(10));
        assert_eq!(
            engine.add_remote_input(1, Input::new(Frame::new(1), 3)),
            Ok(Frame::NULL)
        );
    }

    #[test]
    fn test_disconnect_resimulates_predicted_frames() {
        let mut engine = SyncEngine::new(2, 8).unwrap();
        let mut sim = Accumulator::default();
        engine
            .add_remote_input(1, Input::new(Frame::new(0), 9))
            .unwrap();
        for frame in 0..5 {
            engine.add_local_input(0, frame).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        assert_eq!(sim.loads, 0);

        // frames 1..=4 ran with participant 1's input predicted as 9
        assert_eq!(engine.disconnect_participant(1), Ok(Frame::new(0)));
        assert_eq!(engine.last_confirmed_frame(), Frame::new(0));
        engine.add_local_input(0, 5).unwrap();
        engine.advance(&mut sim).unwrap();

        assert_eq!(sim.loads, 1);
        let history: Vec<[u32; 2]> = (0..6)
            .map(|frame| [frame, if frame == 0 { 9 } else { 0 }])
            .collect();
        assert_eq!(sim.value, replay(&history));
        assert_eq!(engine.last_confirmed_frame(), Frame::new(5));
    }

    #[test]
    fn test_disconnect_frame_only_moves_back() {
        let mut engine = SyncEngine::new(3, 8).unwrap();
        let mut sim = Accumulator::default();
        for frame in 0..4 {
            engine
                .add_remote_input(1, Input::new(Frame::new(frame), 1))
                .unwrap();
        }
        for frame in 0..2 {
            engine
                .add_remote_input(2, Input::new(Frame::new(frame), 2))
                .unwrap();
        }
        for _ in 0..4 {
            engine.add_local_input(0, 0).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        assert_eq!(engine.last_confirmed_frame(), Frame::new(1));

        assert_eq!(engine.disconnect_participant_at(1, Frame::new(3)), Ok(Frame::new(3)));
        assert_eq!(engine.disconnect_participant_at(1, Frame::new(5)), Ok(Frame::new(3)));
        assert_eq!(engine.disconnect_participant_at(1, Frame::new(2)), Ok(Frame::new(2)));
        // frames up to the confirmed frame are final
        assert_eq!(engine.disconnect_participant_at(1, Frame::new(0)), Ok(Frame::new(1)));

        let statuses = engine.connection_statuses();
        assert_eq!(
            statuses[1],
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::new(1)
            }
        );
        assert_eq!(
            statuses[2],
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(1)
            }
        );

        engine.add_local_input(0, 0).unwrap();
        engine.advance(&mut sim).unwrap();
        assert_eq!(sim.loads, 1);
        assert!(engine.check_invariants().is_ok());
    }

    #[test]
    fn test_confirmation_limit_holds_back_the_confirmed_frame() {
        let mut engine = SyncEngine::new(1, 8).unwrap();
        let mut sim = Accumulator::default();
        engine.limit_confirmed_frame(Some(Frame::new(2)));
        for frame in 0..5 {
            engine.add_local_input(0, frame).unwrap();
            engine.advance(&mut sim).unwrap();
        }
        assert_eq!(engine.last_confirmed_frame(), Frame::new(2));

        engine.limit_confirmed_frame(None);
        engine.add_local_input(0, 5).unwrap();
        assert_eq!(engine.last_confirmed_frame(), Frame::new(4));
    }

    #[test]
    fn test_seed_restarts_at_frame() {
        let mut engine = SyncEngine::new(2, 8).unwrap();
        let mut sim = Accumulator::default();
        engine
            .seed(Frame::new(300), 77u64.to_le_bytes().to_vec(), &mut sim)
            .unwrap();
        assert_eq!(sim.value, 77);
        assert_eq!(engine.current_frame(), Frame::new(300));
        assert_eq!(engine.last_confirmed_frame(), Frame::new(299));
        assert!(engine.snapshots().contains(Frame::new(300)));

        engine.add_local_input(0, 1).unwrap();
        engine
            .add_remote_input(1, Input::new(Frame::new(300), 2))
            .unwrap();
        engine.advance(&mut sim).unwrap();
        assert_eq!(engine.current_frame(), Frame::new(301));
        assert_eq!(engine.last_confirmed_frame(), Frame::new(300));
    }

    #[test]
    fn test_invalid_participant() {
        let mut engine = SyncEngine::new(2, 8).unwrap();
        assert_eq!(
            engine.add_local_input(2, 0),
            Err(RollbackError::InvalidParticipant {
                index: 2.into(),
                count: 2
            })
        );
        assert!(engine.disconnect_participant(5).is_err());
        assert!(!engine.is_disconnected(5));
    }
}
