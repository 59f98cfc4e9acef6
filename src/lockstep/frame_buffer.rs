//! Ring buffer of per-frame input sets.
//!
//! Holds the input set for every frame inside a sliding retention window, so
//! rollback can re-simulate from the last authoritative frame and late
//! queries can be answered until the window slides past them. Indexing is
//! `frame % capacity` with a stored frame tag, so storage is constant and a
//! slot is only trusted when its tag matches.

use crate::lockstep::OneFrameInputs;
use crate::{BastionError, Frame};

/// Default number of frames retained.
pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
struct Slot<I> {
    frame: Frame,
    inputs: OneFrameInputs<I>,
}

/// Sliding window of input sets keyed by frame.
#[derive(Debug, Clone)]
pub struct FrameBuffer<I> {
    slots: Vec<Option<Slot<I>>>,
    /// Newest frame ever written; the window is `[latest - capacity + 1, latest]`.
    latest: Frame,
}

impl<I: Copy> Default for FrameBuffer<I> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<I: Copy> FrameBuffer<I> {
    /// Creates a buffer retaining `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.resize_with(capacity.max(1), || None);
        FrameBuffer {
            slots,
            latest: Frame::NULL,
        }
    }

    /// Number of frames the buffer can retain.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Newest frame written, [`Frame::NULL`] if none.
    #[must_use]
    pub fn latest(&self) -> Frame {
        self.latest
    }

    /// Oldest frame still inside the window.
    #[must_use]
    pub fn earliest(&self) -> Frame {
        if self.latest.is_null() {
            return Frame::NULL;
        }
        let floor = self.latest - (self.capacity() as i32 - 1);
        if floor.as_i32() < 0 {
            Frame::new(0)
        } else {
            floor
        }
    }

    fn index(&self, frame: Frame) -> usize {
        frame.as_i32() as usize % self.slots.len()
    }

    fn check_window(&self, frame: Frame) -> Result<(), BastionError> {
        if !frame.is_valid() || (!self.latest.is_null() && frame < self.earliest()) {
            return Err(BastionError::FrameOutOfWindow {
                frame,
                earliest: self.earliest(),
                latest: self.latest,
            });
        }
        Ok(())
    }

    /// Replaces the whole input set for `frame`.
    pub fn set(&mut self, frame: Frame, inputs: OneFrameInputs<I>) -> Result<(), BastionError> {
        self.check_window(frame)?;
        let index = self.index(frame);
        self.slots[index] = Some(Slot { frame, inputs });
        if self.latest.is_null() || frame > self.latest {
            self.latest = frame;
        }
        Ok(())
    }

    /// Sets one unit's input within `frame`, creating the set if the slot is
    /// empty or holds an evicted older frame.
    pub fn add_input(
        &mut self,
        frame: Frame,
        unit: crate::UnitId,
        input: I,
    ) -> Result<(), BastionError> {
        self.check_window(frame)?;
        let index = self.index(frame);
        match &mut self.slots[index] {
            Some(slot) if slot.frame == frame => slot.inputs.insert(unit, input),
            slot => {
                let mut inputs = OneFrameInputs::new();
                inputs.insert(unit, input);
                *slot = Some(Slot { frame, inputs });
            }
        }
        if self.latest.is_null() || frame > self.latest {
            self.latest = frame;
        }
        Ok(())
    }

    /// The input set for `frame`.
    pub fn get(&self, frame: Frame) -> Result<&OneFrameInputs<I>, BastionError> {
        self.check_window(frame)?;
        let index = self.index(frame);
        match &self.slots[index] {
            Some(slot) if slot.frame == frame => Ok(&slot.inputs),
            _ => Err(BastionError::FrameOutOfWindow {
                frame,
                earliest: self.earliest(),
                latest: self.latest,
            }),
        }
    }

    /// Whether an input set is stored for `frame`.
    #[must_use]
    pub fn contains(&self, frame: Frame) -> bool {
        self.get(frame).is_ok()
    }
}
