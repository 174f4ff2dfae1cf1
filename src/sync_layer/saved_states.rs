//! Ring of serialized simulation states used during rollback.

use crate::{Frame, RollbackError};

/// A serialized simulation state together with the frame it was captured at.
///
/// The state at frame `f` is the state *before* frame `f` is simulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// The frame the state belongs to. [`Frame::NULL`] marks an unused slot.
    pub frame: Frame,
    /// The opaque blob produced by [`SimulationHandler::save_state`](crate::SimulationHandler::save_state).
    pub state: Vec<u8>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            state: Vec::new(),
        }
    }
}

/// Fixed ring of snapshots indexed by `frame % len`.
///
/// Holds `max_prediction + 2` slots: the current frame, every frame a rollback may
/// target, and one spare so the oldest target is never overwritten by the save that
/// follows it.
#[derive(Debug, Clone)]
pub struct SnapshotLog {
    snapshots: Vec<Snapshot>,
}

impl SnapshotLog {
    /// Creates a log able to serve rollbacks of up to `max_prediction` frames.
    #[must_use]
    pub fn new(max_prediction: usize) -> Self {
        Self {
            snapshots: vec![Snapshot::default(); max_prediction + 2],
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Always `false`; the log has at least two slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Stores `state` for `frame`, overwriting whatever occupied the slot.
    pub fn save(&mut self, frame: Frame, state: Vec<u8>) -> Result<(), RollbackError> {
        let pos = self.position(frame)?;
        self.snapshots[pos] = Snapshot { frame, state };
        Ok(())
    }

    /// Returns the snapshot for `frame` if it is still in the log.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<&Snapshot> {
        let pos = self.position(frame).ok()?;
        self.snapshots.get(pos).filter(|s| s.frame == frame)
    }

    /// Returns `true` if a snapshot for `frame` is still in the log.
    #[must_use]
    pub fn contains(&self, frame: Frame) -> bool {
        self.get(frame).is_some()
    }

    /// Forgets every snapshot.
    pub fn clear(&mut self) {
        for snapshot in &mut self.snapshots {
            *snapshot = Snapshot::default();
        }
    }

    fn position(&self, frame: Frame) -> Result<usize, RollbackError> {
        if !frame.is_valid() {
            return Err(RollbackError::InvalidFrame {
                frame,
                reason: "frame must be non-negative".to_owned(),
            });
        }
        Ok(frame.as_i32() as usize % self.snapshots.len())
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
    fn new_sizes_for_max_prediction() {
        let log = SnapshotLog::new(8);
        assert_eq!(log.len(), 10);
        assert!(!log.contains(Frame::new(0)));
    }

    #[test]
    fn save_and_get() {
        let mut log = SnapshotLog::new(2);
        log.save(Frame::new(3), vec![1, 2, 3]).unwrap();
        let snapshot = log.get(Frame::new(3)).unwrap();
        assert_eq!(snapshot.frame, Frame::new(3));
        assert_eq!(snapshot.state, vec![1, 2, 3]);
    }

    #[test]
    fn overwritten_slot_is_missing() {
        let mut log = SnapshotLog::new(2);
        for frame in 0..8 {
            log.save(Frame::new(frame), vec![frame as u8]).unwrap();
        }
        // four slots: frames 4..=7 survive
        assert!(!log.contains(Frame::new(3)));
        for frame in 4..8 {
            assert_eq!(log.get(Frame::new(frame)).unwrap().state, vec![frame as u8]);
        }
    }

    #[test]
    fn negative_frame_is_rejected() {
        let mut log = SnapshotLog::new(2);
        match log.save(Frame::NULL, vec![]) {
            Err(RollbackError::InvalidFrame { frame, reason }) => {
                assert!(frame.is_null());
                assert!(reason.contains("non-negative"));
            },
            other => panic!("Expected InvalidFrame error, got {other:?}"),
        }
        assert!(log.get(Frame::NULL).is_none());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut log = SnapshotLog::new(1);
        log.save(Frame::new(0), vec![9]).unwrap();
        log.clear();
        assert!(!log.contains(Frame::new(0)));
    }
}
