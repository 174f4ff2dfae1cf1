use crate::frame_info::Input;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Frame, InputStatus, RollbackError};
use std::cmp;
use tracing::trace;

/// The default capacity of a [`PredictionQueue`]. At 60fps, 128 frames = ~2.1 seconds of input history.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// `PredictionQueue` holds the confirmed inputs of a single participant in a circular array.
/// Valid inputs are between `tail` (oldest) and `head` (one past the newest).
///
/// Besides storage the queue is responsible for:
/// - applying a configurable frame delay, padding the gap with the previous input,
/// - answering requests for frames that have not been confirmed yet with a prediction
///   (a repetition of the newest confirmed input),
/// - noticing when a confirmed input contradicts an earlier prediction, which is
///   what triggers a rollback in the [`SyncEngine`](crate::SyncEngine).
///
/// Inputs must be added for consecutive frames. Anything else is a contract failure
/// reported as [`RollbackError::Sequencing`].
#[derive(Debug, Clone)]
pub struct PredictionQueue {
    /// The head of the queue. The next input is written here.
    head: usize,
    /// The tail of the queue. The oldest input still held is saved here.
    tail: usize,
    /// The number of inputs currently held.
    length: usize,
    /// True until the first input is stored.
    first_frame: bool,
    /// The frame the first stored input is expected to carry.
    start_frame: Frame,

    /// The frame of the last input passed to [`add_input`](Self::add_input), before delay.
    last_user_added_frame: Frame,
    /// The newest frame stored since the last prediction reset.
    last_added_frame: Frame,
    /// The first frame whose confirmed input contradicted the prediction.
    first_incorrect_frame: Frame,
    /// The last frame that has been requested. We never discard anything from here on.
    last_frame_requested: Frame,

    /// The delay in frames applied to every added input.
    frame_delay: usize,
    /// Which participant this queue belongs to. Only used for diagnostics.
    index: usize,
    /// Capacity of the ring buffer.
    queue_length: usize,

    inputs: Vec<Input>,
    /// The outstanding prediction. Its frame is the next frame expected to be confirmed.
    prediction: Option<Input>,
}

impl PredictionQueue {
    /// Creates a new queue with the default capacity.
    #[must_use]
    pub fn new(index: usize) -> Option<Self> {
        Self::with_queue_length(index, INPUT_QUEUE_LENGTH)
    }

    /// Creates a new queue with a custom capacity.
    ///
    /// # Returns
    /// Returns `None` if `queue_length < 2`.
    #[must_use]
    pub fn with_queue_length(index: usize, queue_length: usize) -> Option<Self> {
        if queue_length < 2 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Queue length must be at least 2, got {}",
                queue_length
            );
            return None;
        }
        Some(Self {
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            start_frame: Frame::new(0),
            last_user_added_frame: Frame::NULL,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_frame_requested: Frame::NULL,
            frame_delay: 0,
            index,
            queue_length,
            inputs: vec![Input::blank(Frame::NULL); queue_length],
            prediction: None,
        })
    }

    /// Empties the queue so that the first input stored afterwards carries `frame`.
    /// Used when a session is seeded from a running peer.
    pub fn restart_at(&mut self, frame: Frame) {
        let frame_delay = self.frame_delay;
        let index = self.index;
        let queue_length = self.queue_length;
        if let Some(fresh) = Self::with_queue_length(index, queue_length) {
            *self = fresh;
        }
        self.frame_delay = frame_delay;
        self.start_frame = frame;
    }

    /// Returns the capacity of the ring buffer.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.queue_length
    }

    /// Returns the number of inputs currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if no input is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the configured frame delay.
    #[must_use]
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Returns the first frame whose prediction was wrong, or [`Frame::NULL`].
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// Returns the last frame passed to [`input`](Self::input), or [`Frame::NULL`].
    #[must_use]
    pub fn last_frame_requested(&self) -> Frame {
        self.last_frame_requested
    }

    /// Returns the newest frame stored since the last prediction reset, or [`Frame::NULL`].
    #[must_use]
    pub fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// Returns `true` while a prediction is outstanding.
    #[must_use]
    pub fn is_predicting(&self) -> bool {
        self.prediction.is_some()
    }

    /// Returns the newest confirmed frame held by the queue, or [`Frame::NULL`] if nothing was ever added.
    #[must_use]
    pub fn newest_confirmed_frame(&self) -> Frame {
        if self.first_frame {
            Frame::NULL
        } else {
            self.inputs[self.previous_position()].frame
        }
    }

    /// Sets the frame delay for this queue.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if `delay >= queue_length`.
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), RollbackError> {
        let max_delay = self.queue_length.saturating_sub(1);
        if delay > max_delay {
            return Err(RollbackError::InvalidRequest {
                info: format!(
                    "Frame delay {} exceeds maximum allowed value of {} (queue_length - 1)",
                    delay, max_delay
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Drops the outstanding prediction so that the frames from `frame + 1` on can be requested again.
    ///
    /// `frame` is the last frame known to be correct. It has to lie before the first
    /// incorrect frame, if there is one.
    pub fn reset_prediction(&mut self, frame: Frame) -> Result<(), RollbackError> {
        if !self.first_incorrect_frame.is_null() && frame >= self.first_incorrect_frame {
            return Err(RollbackError::InvalidRequest {
                info: format!(
                    "cannot reset prediction to frame {} at or after the first incorrect frame {}",
                    frame, self.first_incorrect_frame
                ),
            });
        }
        self.prediction = None;
        self.first_incorrect_frame = Frame::NULL;
        self.last_added_frame = Frame::NULL;
        Ok(())
    }

    /// Returns the confirmed input for `frame` if the queue still holds it.
    /// In contrast to [`input`](Self::input), this never predicts.
    #[must_use]
    pub fn confirmed_input(&self, frame: Frame) -> Option<Input> {
        if self.length == 0 || !frame.is_valid() {
            return None;
        }
        let oldest = self.inputs[self.tail].frame;
        if frame < oldest {
            return None;
        }
        let offset = (frame - oldest) as usize;
        if offset >= self.length {
            return None;
        }
        let input = self.inputs[(self.tail + offset) % self.queue_length];
        (input.frame == frame).then_some(input)
    }

    /// Discards confirmed inputs **before** `frame`. Never discards the last requested frame
    /// or anything after it, and always keeps the newest input so predictions have a base.
    pub fn discard_confirmed_frames(&mut self, frame: Frame) {
        if !frame.is_valid() || self.length == 0 {
            return;
        }
        let frame = if self.last_frame_requested.is_null() {
            frame
        } else {
            cmp::min(frame, self.last_frame_requested)
        };

        let newest_position = self.previous_position();
        if frame >= self.inputs[newest_position].frame {
            self.tail = newest_position;
            self.length = 1;
            return;
        }

        let oldest = self.inputs[self.tail].frame;
        if frame <= oldest {
            return;
        }
        let offset = (frame - oldest) as usize;
        self.tail = (self.tail + offset) % self.queue_length;
        self.length -= offset;
    }

    /// Returns the input of this participant for `requested_frame`, predicting it if it has not been confirmed yet.
    ///
    /// # Errors
    /// - [`RollbackError::UnresolvedMisprediction`] if a misprediction is pending. Asking for more
    ///   input would only lead further down the wrong path.
    /// - [`RollbackError::InvalidFrame`] if the frame was already discarded.
    pub fn input(&mut self, requested_frame: Frame) -> Result<(Input, InputStatus), RollbackError> {
        if !self.first_incorrect_frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Participant {} asked for input while frame {} is mispredicted",
                self.index,
                self.first_incorrect_frame
            );
            return Err(RollbackError::UnresolvedMisprediction {
                frame: self.first_incorrect_frame,
            });
        }

        if self.length > 0 && requested_frame < self.inputs[self.tail].frame {
            return Err(RollbackError::InvalidFrame {
                frame: requested_frame,
                reason: format!(
                    "older than the oldest retained input {}",
                    self.inputs[self.tail].frame
                ),
            });
        }

        self.last_frame_requested = requested_frame;

        let prediction = match self.prediction {
            Some(prediction) => prediction,
            None => {
                if let Some(input) = self.confirmed_input(requested_frame) {
                    return Ok((input, InputStatus::Confirmed));
                }
                let prediction = if self.first_frame {
                    Input::blank(self.start_frame)
                } else {
                    let newest = self.inputs[self.previous_position()];
                    Input::new(newest.frame + 1, newest.data)
                };
                trace!(
                    index = self.index,
                    frame = %requested_frame,
                    from = %prediction.frame,
                    "entering prediction"
                );
                self.prediction = Some(prediction);
                prediction
            },
        };

        Ok((
            Input::new(requested_frame, prediction.data),
            InputStatus::Predicted,
        ))
    }

    /// Adds a confirmed input. Applies the frame delay and returns the frame the input was stored at.
    ///
    /// Returns [`Frame::NULL`] if the input was absorbed because the frame delay was lowered
    /// and its delayed frame is already filled.
    ///
    /// # Errors
    /// - [`RollbackError::Sequencing`] if `input.frame` does not follow the previously added frame.
    /// - [`RollbackError::Capacity`] if storing it would overflow the ring buffer. Nothing is evicted.
    pub fn add_input(&mut self, input: Input) -> Result<Frame, RollbackError> {
        if !self.last_user_added_frame.is_null() && input.frame != self.last_user_added_frame + 1 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Participant {} added frame {} after frame {}",
                self.index,
                input.frame,
                self.last_user_added_frame
            );
            return Err(RollbackError::Sequencing {
                expected: self.last_user_added_frame + 1,
                actual: input.frame,
            });
        }

        let delayed_frame = input.frame + self.frame_delay as i32;
        let mut expected_frame = self.next_expected_frame();

        let slots = if delayed_frame >= expected_frame {
            (delayed_frame - expected_frame + 1) as usize
        } else {
            0
        };
        if self.length + slots > self.queue_length {
            return Err(RollbackError::Capacity {
                capacity: self.queue_length,
            });
        }

        self.last_user_added_frame = input.frame;

        if expected_frame > delayed_frame {
            trace!(
                index = self.index,
                frame = %input.frame,
                "input absorbed by reduced frame delay"
            );
            return Ok(Frame::NULL);
        }

        // pad the gap opened by the frame delay with the previous input
        while expected_frame < delayed_frame {
            let previous = self.inputs[self.previous_position()];
            self.add_delayed_input(previous.data, expected_frame)?;
            expected_frame += 1;
        }

        self.add_delayed_input(input.data, delayed_frame)?;
        crate::debug_check_invariants!(self, "after add_input");
        Ok(delayed_frame)
    }

    fn next_expected_frame(&self) -> Frame {
        if self.first_frame {
            self.start_frame
        } else {
            self.inputs[self.previous_position()].frame + 1
        }
    }

    fn previous_position(&self) -> usize {
        match self.head {
            0 => self.queue_length - 1,
            _ => self.head - 1,
        }
    }

    /// Stores `data` at `frame` and checks it against the outstanding prediction.
    fn add_delayed_input(&mut self, data: u32, frame: Frame) -> Result<(), RollbackError> {
        let expected = self.next_expected_frame();
        if frame != expected {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "Participant {} stored frame {} where {} was expected",
                self.index,
                frame,
                expected
            );
            return Err(RollbackError::Sequencing {
                expected,
                actual: frame,
            });
        }
        if self.length >= self.queue_length {
            return Err(RollbackError::Capacity {
                capacity: self.queue_length,
            });
        }

        self.inputs[self.head] = Input::new(frame, data);
        self.head = (self.head + 1) % self.queue_length;
        self.length += 1;
        self.first_frame = false;
        self.last_added_frame = frame;

        if let Some(mut prediction) = self.prediction {
            if prediction.frame != frame {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::InputQueue,
                    "Frame {} does not match prediction frame {}",
                    frame,
                    prediction.frame
                );
                return Err(RollbackError::Sequencing {
                    expected: prediction.frame,
                    actual: frame,
                });
            }

            if self.first_incorrect_frame.is_null() && prediction.data != data {
                trace!(index = self.index, frame = %frame, "misprediction detected");
                self.first_incorrect_frame = frame;
            }

            if prediction.frame == self.last_frame_requested && self.first_incorrect_frame.is_null()
            {
                self.prediction = None;
            } else {
                prediction.frame += 1;
                self.prediction = Some(prediction);
            }
        }

        Ok(())
    }
}

impl InvariantChecker for PredictionQueue {
    /// # Invariants
    ///
    /// 1. `length` never exceeds the capacity
    /// 2. `head` and `tail` are valid indices and agree with `length`
    /// 3. the held frames are consecutive
    /// 4. `last_added_frame`, when set, is the newest held frame
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.length > self.queue_length {
            return Err(
                InvariantViolation::new("PredictionQueue", "length exceeds queue_length")
                    .with_details(format!("length={}, max={}", self.length, self.queue_length)),
            );
        }

        if self.head >= self.queue_length || self.tail >= self.queue_length {
            return Err(
                InvariantViolation::new("PredictionQueue", "head or tail out of bounds")
                    .with_details(format!("head={}, tail={}", self.head, self.tail)),
            );
        }

        if (self.tail + self.length) % self.queue_length != self.head {
            return Err(InvariantViolation::new(
                "PredictionQueue",
                "length does not match head/tail positions",
            )
            .with_details(format!(
                "length={}, head={}, tail={}",
                self.length, self.head, self.tail
            )));
        }

        for offset in 1..self.length {
            let previous = self.inputs[(self.tail + offset - 1) % self.queue_length].frame;
            let current = self.inputs[(self.tail + offset) % self.queue_length].frame;
            if current != previous + 1 {
                return Err(InvariantViolation::new(
                    "PredictionQueue",
                    "held frames are not consecutive",
                )
                .with_details(format!("{} followed by {}", previous, current)));
            }
        }

        if !self.last_added_frame.is_null() && self.last_added_frame != self.newest_confirmed_frame()
        {
            return Err(InvariantViolation::new(
                "PredictionQueue",
                "last_added_frame is not the newest held frame",
            )
            .with_details(format!(
                "last_added_frame={}, newest={}",
                self.last_added_frame,
                self.newest_confirmed_frame()
            )));
        }

        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod input_queue_tests {
    use super::*;

    fn test_queue(index: usize) -> PredictionQueue {
        PredictionQueue::new(index).expect("Failed to create test queue")
    }

    fn add(queue: &mut PredictionQueue, frame: i32, data: u32) -> Frame {
        queue
            .add_input(Input::new(Frame::new(frame), data))
            .expect("input should be accepted")
    }

    #[test]
    fn test_queue_length_too_small() {
        assert!(PredictionQueue::with_queue_length(0, 1).is_none());
        assert!(PredictionQueue::with_queue_length(0, 2).is_some());
    }

    #[test]
    fn test_add_input_wrong_frame() {
        let mut queue = test_queue(0);
        assert_eq!(add(&mut queue, 0, 0), Frame::new(0));
        let result = queue.add_input(Input::new(Frame::new(3), 0));
        assert_eq!(
            result,
            Err(RollbackError::Sequencing {
                expected: Frame::new(1),
                actual: Frame::new(3)
            })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_add_input_twice() {
        let mut queue = test_queue(0);
        let input = Input::new(Frame::new(0), 0);
        assert_eq!(queue.add_input(input), Ok(Frame::new(0)));
        assert!(matches!(
            queue.add_input(input),
            Err(RollbackError::Sequencing { .. })
        ));
    }

    #[test]
    fn test_input_sequentially() {
        let mut queue = test_queue(0);
        for i in 0..10i32 {
            add(&mut queue, i, i as u32);
            assert_eq!(queue.last_added_frame(), Frame::new(i));
            assert_eq!(queue.len(), (i + 1) as usize);
            let (input, status) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(input.data, i as u32);
            assert_eq!(status, InputStatus::Confirmed);
        }
    }

    #[test]
    fn test_first_input_may_start_late() {
        let mut queue = test_queue(1);
        assert_eq!(add(&mut queue, 2, 7), Frame::new(2));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.confirmed_input(Frame::new(0)).unwrap().data, 0);
        assert_eq!(queue.confirmed_input(Frame::new(2)).unwrap().data, 7);
    }

    #[test]
    fn test_delayed_inputs() {
        let mut queue = test_queue(0);
        let delay: i32 = 2;
        queue.set_frame_delay(delay as usize).unwrap();
        for i in 0..10i32 {
            let stored_at = add(&mut queue, i, i as u32);
            assert_eq!(stored_at, Frame::new(i + delay));
            assert_eq!(queue.len(), (i + delay + 1) as usize);
            let (input, _status) = queue.input(Frame::new(i)).unwrap();
            let correct = std::cmp::max(0, i - delay) as u32;
            assert_eq!(input.data, correct);
        }
    }

    #[test]
    fn test_lowered_delay_absorbs_input() {
        let mut queue = test_queue(0);
        queue.set_frame_delay(2).unwrap();
        add(&mut queue, 0, 1);
        queue.set_frame_delay(0).unwrap();
        // frames 1 and 2 are already filled, so these inputs are absorbed
        assert_eq!(add(&mut queue, 1, 5), Frame::NULL);
        assert_eq!(add(&mut queue, 2, 5), Frame::NULL);
        assert_eq!(add(&mut queue, 3, 5), Frame::new(3));
    }

    #[test]
    fn test_capacity_error_does_not_evict() {
        let mut queue = PredictionQueue::with_queue_length(0, 4).unwrap();
        for i in 0..4 {
            add(&mut queue, i, 1);
        }
        let result = queue.add_input(Input::new(Frame::new(4), 1));
        assert_eq!(result, Err(RollbackError::Capacity { capacity: 4 }));
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.confirmed_input(Frame::new(0)).unwrap().data, 1);
        // the rejected frame can be resubmitted once space is freed
        queue.discard_confirmed_frames(Frame::new(2));
        assert_eq!(add(&mut queue, 4, 1), Frame::new(4));
    }

    #[test]
    fn test_confirmed_input_lookup() {
        let mut queue = test_queue(0);
        for i in 0..5i32 {
            add(&mut queue, i, (i * 10) as u32);
        }
        assert_eq!(queue.confirmed_input(Frame::new(2)).unwrap().data, 20);
        assert!(queue.confirmed_input(Frame::new(10)).is_none());
        assert!(queue.confirmed_input(Frame::NULL).is_none());
    }

    #[test]
    fn test_discard_confirmed_frames_partial() {
        let mut queue = test_queue(0);
        for i in 0..10i32 {
            add(&mut queue, i, i as u32);
        }
        queue.discard_confirmed_frames(Frame::new(5));
        assert_eq!(queue.len(), 5);
        assert!(queue.confirmed_input(Frame::new(4)).is_none());
        assert_eq!(queue.confirmed_input(Frame::new(5)).unwrap().data, 5);
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn test_discard_all_but_one_preserves_most_recent() {
        let mut queue = test_queue(0);
        for i in 0..5i32 {
            add(&mut queue, i, i as u32);
        }
        queue.discard_confirmed_frames(Frame::new(100));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.confirmed_input(Frame::new(4)).unwrap().data, 4);
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn test_discard_all_but_one_with_head_at_zero() {
        let mut queue = PredictionQueue::with_queue_length(0, 8).unwrap();
        for i in 0..8i32 {
            add(&mut queue, i, i as u32);
        }
        assert_eq!(queue.head, 0);
        queue.discard_confirmed_frames(Frame::new(100));
        assert_eq!(queue.tail, 7);
        assert_eq!(queue.len(), 1);
        assert!(queue.check_invariants().is_ok());
        assert_eq!(add(&mut queue, 8, 8), Frame::new(8));
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn test_discard_confirmed_frames_respects_last_requested() {
        let mut queue = test_queue(0);
        for i in 0..10i32 {
            add(&mut queue, i, i as u32);
        }
        queue.input(Frame::new(3)).unwrap();
        queue.discard_confirmed_frames(Frame::new(8));
        assert!(queue.confirmed_input(Frame::new(3)).is_some());
        assert!(queue.confirmed_input(Frame::new(2)).is_none());
    }

    #[test]
    fn test_discard_nothing_when_frame_before_tail() {
        let mut queue = test_queue(0);
        for i in 0..6i32 {
            add(&mut queue, i, 0);
        }
        queue.discard_confirmed_frames(Frame::new(3));
        queue.discard_confirmed_frames(Frame::new(1));
        assert_eq!(queue.len(), 3);
        queue.discard_confirmed_frames(Frame::NULL);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_blank_prediction_before_any_input() {
        let mut queue = test_queue(0);
        let (input, status) = queue.input(Frame::new(0)).unwrap();
        assert_eq!(input, Input::blank(Frame::new(0)));
        assert_eq!(status, InputStatus::Predicted);
        assert!(queue.is_predicting());
    }

    #[test]
    fn test_prediction_repeats_newest_input() {
        let mut queue = test_queue(0);
        add(&mut queue, 0, 3);
        add(&mut queue, 1, 9);
        let (input, status) = queue.input(Frame::new(4)).unwrap();
        assert_eq!(input, Input::new(Frame::new(4), 9));
        assert_eq!(status, InputStatus::Predicted);
    }

    #[test]
    fn test_correct_prediction_leaves_prediction_mode() {
        let mut queue = test_queue(0);
        add(&mut queue, 0, 5);
        queue.input(Frame::new(1)).unwrap();
        queue.input(Frame::new(2)).unwrap();
        add(&mut queue, 1, 5);
        assert!(queue.is_predicting());
        add(&mut queue, 2, 5);
        assert!(!queue.is_predicting());
        assert!(queue.first_incorrect_frame().is_null());
    }

    #[test]
    fn test_first_incorrect_frame_detection() {
        let mut queue = test_queue(0);
        add(&mut queue, 0, 5);
        for frame in 1..=4 {
            queue.input(Frame::new(frame)).unwrap();
        }
        add(&mut queue, 1, 5);
        add(&mut queue, 2, 6);
        add(&mut queue, 3, 7);
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        assert!(matches!(
            queue.input(Frame::new(5)),
            Err(RollbackError::UnresolvedMisprediction { .. })
        ));
    }

    #[test]
    fn test_reset_prediction() {
        let mut queue = test_queue(0);
        add(&mut queue, 0, 5);
        queue.input(Frame::new(1)).unwrap();
        queue.input(Frame::new(2)).unwrap();
        add(&mut queue, 1, 8);
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));

        assert!(queue.reset_prediction(Frame::new(1)).is_err());
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));

        queue.reset_prediction(Frame::new(0)).unwrap();
        assert!(queue.first_incorrect_frame().is_null());
        assert!(queue.last_added_frame().is_null());
        assert!(!queue.is_predicting());

        let (input, status) = queue.input(Frame::new(1)).unwrap();
        assert_eq!(input.data, 8);
        assert_eq!(status, InputStatus::Confirmed);
        // frame 2 was never confirmed, so it is predicted from frame 1
        let (input, status) = queue.input(Frame::new(2)).unwrap();
        assert_eq!(input.data, 8);
        assert_eq!(status, InputStatus::Predicted);
    }

    #[test]
    fn test_requesting_discarded_frame_fails() {
        let mut queue = test_queue(0);
        for i in 0..10i32 {
            add(&mut queue, i, 1);
        }
        queue.discard_confirmed_frames(Frame::new(6));
        assert!(matches!(
            queue.input(Frame::new(2)),
            Err(RollbackError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_queue_wraparound() {
        let mut queue = PredictionQueue::with_queue_length(0, 16).unwrap();
        for i in 0..100i32 {
            add(&mut queue, i, i as u32);
            let (input, _) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(input.data, i as u32);
            queue.discard_confirmed_frames(Frame::new(i - 4));
            assert!(queue.len() <= 16);
            assert!(queue.check_invariants().is_ok());
        }
    }

    #[test]
    fn test_restart_at_seeds_start_frame() {
        let mut queue = test_queue(0);
        queue.set_frame_delay(1).unwrap();
        add(&mut queue, 0, 1);
        queue.restart_at(Frame::new(300));
        assert!(queue.is_empty());
        assert_eq!(queue.frame_delay(), 1);
        assert_eq!(add(&mut queue, 300, 4), Frame::new(301));
        assert_eq!(queue.confirmed_input(Frame::new(300)).unwrap().data, 0);
        assert_eq!(queue.newest_confirmed_frame(), Frame::new(301));
    }

    #[test]
    fn test_set_frame_delay_bounds() {
        let mut queue = test_queue(0);
        assert!(queue.set_frame_delay(INPUT_QUEUE_LENGTH).is_err());
        assert_eq!(queue.frame_delay(), 0);
        assert!(queue.set_frame_delay(INPUT_QUEUE_LENGTH - 1).is_ok());
        assert!(queue.set_frame_delay(0).is_ok());
    }

    #[test]
    fn test_invariant_checker_new_queue() {
        let queue = test_queue(0);
        assert!(queue.check_invariants().is_ok());
        assert!(queue.newest_confirmed_frame().is_null());
    }
}
