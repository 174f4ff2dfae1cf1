use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Frame;

/// Inputs of every participant for one frame, in participant order.
/// Stays on the stack for up to four participants.
pub type InputVec = SmallVec<[Input; 4]>;

/// Represents the input of one participant for a single frame. The associated frame is denoted with `frame`.
///
/// `data` is an opaque bitmask. The library never interprets it beyond comparing
/// predictions against confirmed values.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Input {
    /// The frame to which this input belongs. [`Frame::NULL`] represents an invalid frame
    pub frame: Frame,
    /// The input bits given by the user
    pub data: u32,
}

impl Input {
    /// Creates a new `Input` with the given frame and data.
    #[must_use]
    pub const fn new(frame: Frame, data: u32) -> Self {
        Self { frame, data }
    }

    /// Creates an input with all bits cleared.
    #[must_use]
    pub const fn blank(frame: Frame) -> Self {
        Self { frame, data: 0 }
    }

    /// Compares two inputs. With `bits_only` the frames are ignored.
    #[must_use]
    pub fn equal(&self, other: &Self, bits_only: bool) -> bool {
        (bits_only || self.frame == other.frame) && self.data == other.data
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod input_tests {
    use super::*;

    #[test]
    fn blank_input_has_no_bits() {
        let input = Input::blank(Frame::new(7));
        assert_eq!(input.frame, Frame::new(7));
        assert_eq!(input.data, 0);
        assert_eq!(Input::default().frame, Frame::new(0));
    }

    #[test]
    fn equal_bits_only_ignores_frame() {
        let a = Input::new(Frame::new(1), 0b101);
        let b = Input::new(Frame::new(9), 0b101);
        assert!(a.equal(&b, true));
        assert!(!a.equal(&b, false));
    }

    #[test]
    fn equal_detects_different_bits() {
        let a = Input::new(Frame::new(3), 1);
        let b = Input::new(Frame::new(3), 2);
        assert!(!a.equal(&b, true));
        assert!(!a.equal(&b, false));
        assert!(a.equal(&a, false));
    }
}
