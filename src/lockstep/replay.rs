//! Replay recording and deterministic playback.
//!
//! A replay is nothing but the starting conditions and the authoritative
//! input set of every confirmed frame; because the simulation is
//! deterministic, re-applying them reproduces the whole match. The record is
//! serializable so hosts can persist replays or ship them for desync
//! forensics.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::lockstep::{LockstepConfig, OneFrameInputs};
use crate::{Frame, UnitId};

/// A recorded match: roster, epoch and every confirmed frame's inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: Serialize + DeserializeOwned")]
pub struct ReplayRecord<I> {
    /// First recorded frame (0 for a full match, later for a mid-join record).
    pub start_frame: Frame,
    /// Wall-clock epoch of `start_frame`, for display only.
    pub start_time_ms: u64,
    /// The units participating, in roster order.
    pub roster: Vec<UnitId>,
    /// Confirmed input sets, `frames[i]` belonging to `start_frame + i`.
    pub frames: Vec<OneFrameInputs<I>>,
}

impl<I: Copy> ReplayRecord<I> {
    /// Creates an empty record starting at `start_frame`.
    #[must_use]
    pub fn new(start_frame: Frame, start_time_ms: u64, roster: Vec<UnitId>) -> Self {
        ReplayRecord {
            start_frame,
            start_time_ms,
            roster,
            frames: Vec::new(),
        }
    }

    /// Appends the next confirmed frame's inputs.
    pub fn push(&mut self, inputs: OneFrameInputs<I>) {
        self.frames.push(inputs);
    }

    /// Number of recorded frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether anything has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The last recorded frame, [`Frame::NULL`] if empty.
    #[must_use]
    pub fn last_frame(&self) -> Frame {
        if self.frames.is_empty() {
            Frame::NULL
        } else {
            self.start_frame + (self.frames.len() as i32 - 1)
        }
    }
}

/// Steps a recorded match back through the simulation.
#[derive(Debug)]
pub struct ReplayPlayer<C: LockstepConfig> {
    record: ReplayRecord<C::Input>,
    state: C::State,
    /// Index into `record.frames` of the next frame to apply.
    cursor: usize,
}

impl<C: LockstepConfig> ReplayPlayer<C> {
    /// Creates a player positioned before the first recorded frame.
    /// `initial_state` must be the state the record started from.
    pub fn new(record: ReplayRecord<C::Input>, initial_state: C::State) -> Self {
        ReplayPlayer {
            record,
            state: initial_state,
            cursor: 0,
        }
    }

    /// The state after the last applied frame.
    pub fn state(&self) -> &C::State {
        &self.state
    }

    /// The frame the last `step` produced, [`Frame::NULL`] before any step.
    #[must_use]
    pub fn position(&self) -> Frame {
        if self.cursor == 0 {
            Frame::NULL
        } else {
            self.record.start_frame + (self.cursor as i32 - 1)
        }
    }

    /// Applies the next recorded frame. Returns the frame it advanced to, or
    /// `None` at the end of the record.
    pub fn step(&mut self) -> Option<Frame> {
        let inputs = self.record.frames.get(self.cursor)?;
        let frame = self.record.start_frame + self.cursor as i32;
        C::advance(&mut self.state, frame, inputs);
        self.cursor += 1;
        Some(frame)
    }

    /// Runs the record to completion and returns the final state hash.
    pub fn run_to_end(&mut self) -> u64 {
        while self.step().is_some() {}
        C::state_hash(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a_hash;

    struct Counting;

    impl LockstepConfig for Counting {
        type Input = i32;
        type State = i64;

        fn advance(state: &mut i64, _frame: Frame, inputs: &OneFrameInputs<i32>) {
            for (_, input) in inputs.iter() {
                *state += i64::from(input);
            }
        }

        fn state_hash(state: &i64) -> u64 {
            fnv1a_hash(state)
        }
    }

    fn record() -> ReplayRecord<i32> {
        let roster = vec![UnitId::new(1), UnitId::new(2)];
        let mut record = ReplayRecord::new(Frame::new(0), 0, roster);
        for f in 0..10 {
            let mut inputs = OneFrameInputs::new();
            inputs.insert(UnitId::new(1), f);
            inputs.insert(UnitId::new(2), f * 2);
            record.push(inputs);
        }
        record
    }

    #[test]
    fn last_frame_tracks_pushes() {
        let record = record();
        assert_eq!(record.len(), 10);
        assert_eq!(record.last_frame(), Frame::new(9));
        assert_eq!(
            ReplayRecord::<i32>::new(Frame::new(0), 0, vec![]).last_frame(),
            Frame::NULL
        );
    }

    #[test]
    fn playback_is_deterministic() {
        let hash_a = ReplayPlayer::<Counting>::new(record(), 0).run_to_end();
        let hash_b = ReplayPlayer::<Counting>::new(record(), 0).run_to_end();
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn stepwise_matches_batch() {
        let mut player = ReplayPlayer::<Counting>::new(record(), 0);
        assert_eq!(player.position(), Frame::NULL);
        let mut steps = 0;
        while let Some(frame) = player.step() {
            assert_eq!(frame, Frame::new(steps));
            steps += 1;
        }
        assert_eq!(steps, 10);
        assert_eq!(player.position(), Frame::new(9));
        // Sum of f + 2f for f in 0..10 = 3 * 45.
        assert_eq!(*player.state(), 135);
    }

    #[test]
    fn record_roundtrips_through_codec() {
        let record = record();
        let bytes = crate::network::codec::encode(&record).unwrap();
        let decoded: ReplayRecord<i32> = crate::network::codec::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }
}
