//! Property-based tests for the prediction queue, the engine and the snapshot log.
//!
//! These tests use proptest to check that invariants hold under random inputs,
//! using the exposed `__internal` module to drive the components directly.
//!
//! # Properties
//!
//! ## PredictionQueue
//! - Length never exceeds the capacity while confirmed frames are discarded
//! - Stored frames are the added frames shifted by the frame delay
//! - Predictions repeat the newest confirmed input
//! - A confirmed input that differs from the prediction marks the first incorrect frame
//!
//! ## SyncEngine
//! - Late remote input converges on the state of an engine that had all inputs on time
//! - The confirmed frame never passes the current frame
//!
//! ## SnapshotLog
//! - The newest `max_prediction + 2` frames stay retrievable

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use lockstep_rollback::__internal::{PredictionQueue, SnapshotLog};
use lockstep_rollback::telemetry::InvariantChecker;
use lockstep_rollback::{Frame, Input, InputStatus, RollbackError, SimulationHandler, SyncEngine};
use proptest::prelude::*;

// ============================================================================
// Test Simulation
// ============================================================================

/// Folds every input into an order-sensitive accumulator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct FoldSim {
    acc: u64,
    frame: i32,
}

impl SimulationHandler for FoldSim {
    fn update(&mut self, inputs: &[Input], frame: Frame) {
        assert_eq!(self.frame, frame.as_i32());
        for input in inputs {
            self.acc = self
                .acc
                .wrapping_mul(0x100_0000_01b3)
                .wrapping_add(u64::from(input.data) + 1);
        }
        self.frame += 1;
    }

    fn save_state(&self) -> Result<Vec<u8>, RollbackError> {
        let mut bytes = self.acc.to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.frame.to_le_bytes());
        Ok(bytes)
    }

    fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError> {
        let (acc, frame) = snapshot.split_at(8);
        self.acc = u64::from_le_bytes(acc.try_into().unwrap());
        self.frame = i32::from_le_bytes(frame.try_into().unwrap());
        Ok(())
    }
}

// ============================================================================
// Property Test Strategies
// ============================================================================

fn queue_length_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(32), Just(64), Just(128)]
}

fn frame_count_strategy() -> impl Strategy<Value = usize> {
    1usize..200
}

fn max_prediction_strategy() -> impl Strategy<Value = usize> {
    2usize..12
}

// ============================================================================
// PredictionQueue Properties
// ============================================================================

proptest! {
    /// Queue length never exceeds capacity
    #[test]
    fn prop_queue_length_bounded(
        queue_length in queue_length_strategy(),
        num_frames in frame_count_strategy(),
    ) {
        let mut queue = PredictionQueue::with_queue_length(0, queue_length).unwrap();
        let discard_threshold = queue_length.saturating_sub(4);

        for i in 0..num_frames as i32 {
            if i as usize >= discard_threshold && i > 4 {
                queue.discard_confirmed_frames(Frame::new(i - 4));
            }
            let stored = queue.add_input(Input::new(Frame::new(i), i as u32));
            prop_assert_eq!(stored, Ok(Frame::new(i)));

            let result = queue.check_invariants();
            prop_assert!(
                result.is_ok(),
                "Queue invariants failed at frame {}: {:?}",
                i,
                result.err()
            );
            prop_assert!(queue.len() <= queue_length);
        }
    }

    /// Every input lands `delay` frames later
    #[test]
    fn prop_frame_delay_shifts_frames(
        delay in 0usize..8,
        num_frames in 1usize..60,
    ) {
        let mut queue = PredictionQueue::new(0).unwrap();
        queue.set_frame_delay(delay).unwrap();

        for i in 0..num_frames as i32 {
            let stored = queue.add_input(Input::new(Frame::new(i), 7)).unwrap();
            prop_assert_eq!(stored, Frame::new(i + delay as i32));
        }
        // the padded frames before the first input are blank
        for frame in 0..delay as i32 {
            prop_assert_eq!(
                queue.confirmed_input(Frame::new(frame)).map(|input| input.data),
                Some(0)
            );
        }
        prop_assert_eq!(queue.newest_confirmed_frame(), Frame::new(num_frames as i32 - 1 + delay as i32));
    }

    /// Predictions repeat the newest confirmed input
    #[test]
    fn prop_prediction_repeats_last_input(
        last_confirmed in any::<u32>(),
        prediction_frames in 1i32..10,
    ) {
        let mut queue = PredictionQueue::new(0).unwrap();
        queue.add_input(Input::new(Frame::new(0), last_confirmed)).unwrap();

        let (confirmed, status) = queue.input(Frame::new(0)).unwrap();
        prop_assert_eq!(status, InputStatus::Confirmed);
        prop_assert_eq!(confirmed.data, last_confirmed);

        for i in 1..=prediction_frames {
            let (predicted, status) = queue.input(Frame::new(i)).unwrap();
            prop_assert_eq!(status, InputStatus::Predicted);
            prop_assert_eq!(predicted.frame, Frame::new(i));
            prop_assert_eq!(predicted.data, last_confirmed);
        }
        prop_assert!(queue.is_predicting());
    }

    /// A differing confirmation marks the frame; resetting clears it
    #[test]
    fn prop_misprediction_detected(
        first in any::<u32>(),
        second in any::<u32>(),
    ) {
        let mut queue = PredictionQueue::new(0).unwrap();
        queue.add_input(Input::new(Frame::new(0), first)).unwrap();
        queue.input(Frame::new(1)).unwrap();
        queue.add_input(Input::new(Frame::new(1), second)).unwrap();

        if first == second {
            prop_assert!(queue.first_incorrect_frame().is_null());
        } else {
            prop_assert_eq!(queue.first_incorrect_frame(), Frame::new(1));
            let unresolved = matches!(
                queue.input(Frame::new(2)),
                Err(RollbackError::UnresolvedMisprediction { .. })
            );
            prop_assert!(unresolved);
            queue.reset_prediction(Frame::new(0)).unwrap();
        }
        prop_assert!(queue.first_incorrect_frame().is_null());
        let (input, status) = queue.input(Frame::new(1)).unwrap();
        prop_assert_eq!(status, InputStatus::Confirmed);
        prop_assert_eq!(input.data, second);
    }

    /// Frames that do not follow the previous one are refused
    #[test]
    fn prop_out_of_sequence_refused(skip in 2i32..50) {
        let mut queue = PredictionQueue::new(0).unwrap();
        queue.add_input(Input::new(Frame::new(0), 1)).unwrap();
        let result = queue.add_input(Input::new(Frame::new(skip), 1));
        prop_assert!(
            matches!(result, Err(RollbackError::Sequencing { .. })),
            "unexpected {:?}",
            result
        );
        prop_assert_eq!(queue.newest_confirmed_frame(), Frame::new(0));
    }
}

// ============================================================================
// SyncEngine Properties
// ============================================================================

fn reference_state(local: &[u32], remote: &[u32]) -> FoldSim {
    let mut sim = FoldSim::default();
    for (frame, (a, b)) in local.iter().zip(remote).enumerate() {
        let frame = Frame::new(frame as i32);
        sim.update(&[Input::new(frame, *a), Input::new(frame, *b)], frame);
    }
    sim
}

proptest! {
    /// Remote input that arrives `lag` frames late is corrected by rollbacks
    #[test]
    fn prop_late_input_converges(
        (max_prediction, lag) in max_prediction_strategy()
            .prop_flat_map(|max| (Just(max), 0..max - 1)),
        inputs in prop::collection::vec((0u32..4, 0u32..4), 2..80),
    ) {
        let local: Vec<u32> = inputs.iter().map(|(a, _)| *a).collect();
        let remote: Vec<u32> = inputs.iter().map(|(_, b)| *b).collect();
        let last = inputs.len() - 1;

        let mut engine = SyncEngine::new(2, max_prediction).unwrap();
        let mut sim = FoldSim::default();
        let mut next_remote = 0;

        for frame in 0..=last {
            engine.add_local_input(0, local[frame]).unwrap();
            let deliver_until = if frame == last { Some(last) } else { frame.checked_sub(lag) };
            if let Some(until) = deliver_until {
                while next_remote <= until {
                    engine
                        .add_remote_input(1, Input::new(Frame::new(next_remote as i32), remote[next_remote]))
                        .unwrap();
                    next_remote += 1;
                }
            }
            engine.advance(&mut sim).unwrap();

            prop_assert!(engine.last_confirmed_frame() <= engine.current_frame());
            let result = engine.check_invariants();
            prop_assert!(result.is_ok(), "invariants failed: {:?}", result.err());
        }

        prop_assert_eq!(engine.current_frame(), Frame::new(inputs.len() as i32));
        prop_assert_eq!(sim, reference_state(&local, &remote));
    }

    /// Construction with any valid parameters passes the invariant checks
    #[test]
    fn prop_engine_construction_invariants(
        num_participants in 1usize..5,
        max_prediction in max_prediction_strategy(),
        queue_length in queue_length_strategy(),
    ) {
        let engine = SyncEngine::with_queue_length(num_participants, max_prediction, queue_length).unwrap();
        prop_assert!(engine.check_invariants().is_ok());
        prop_assert_eq!(engine.current_frame(), Frame::new(0));
        prop_assert_eq!(engine.num_participants(), num_participants);
    }
}

// ============================================================================
// SnapshotLog Properties
// ============================================================================

proptest! {
    /// The newest `max_prediction + 2` frames are retrievable, older ones are gone
    #[test]
    fn prop_snapshot_window(
        max_prediction in 1usize..20,
        frames in 1i32..200,
    ) {
        let mut log = SnapshotLog::new(max_prediction);
        for frame in 0..frames {
            log.save(Frame::new(frame), frame.to_le_bytes().to_vec()).unwrap();
        }

        let window = (max_prediction + 2) as i32;
        for frame in 0..frames {
            let snapshot = log.get(Frame::new(frame));
            if frame >= frames - window {
                prop_assert_eq!(snapshot.map(|s| s.state.clone()), Some(frame.to_le_bytes().to_vec()));
            } else {
                prop_assert!(snapshot.is_none(), "frame {} should have been overwritten", frame);
            }
        }
    }

    /// Negative frames are refused
    #[test]
    fn prop_snapshot_negative_frame(frame in i32::MIN..0) {
        let mut log = SnapshotLog::new(4);
        prop_assert!(log.save(Frame::new(frame), Vec::new()).is_err());
        prop_assert!(log.get(Frame::new(frame)).is_none());
    }
}
