//! Deterministic lockstep synchronization with client-side prediction.
//!
//! The simulation advances in fixed frames. Every peer applies the identical
//! input set for a frame to the identical prior state and must reach the
//! identical next state; the server is authoritative about which inputs make
//! up a frame. Clients run ahead of the server by predicting inputs (their
//! own are known, remote units are assumed to repeat their last confirmed
//! input) and roll back and re-simulate when an authoritative frame proves a
//! prediction wrong.
//!
//! The game supplies its simulation through [`LockstepConfig`]; this module
//! owns only ordering, prediction, rollback, desync detection and replay.

pub mod frame_buffer;
pub mod replay;
pub mod room;
pub mod time;

pub use frame_buffer::FrameBuffer;
pub use replay::{ReplayPlayer, ReplayRecord};
pub use room::{FrameCollector, Room, RoomConfig, RoomSnapshot, RoomState};
pub use time::FixedTimeCounter;

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::UnitId;

/// How many frames a client may run ahead of the last authoritative frame.
pub const PREDICTION_HORIZON: i32 = 5;

/// User-provided simulation the lockstep layer drives.
///
/// `advance` must be deterministic: same state, same frame, same inputs must
/// yield the same next state on every machine, or desync detection will fire.
pub trait LockstepConfig {
    /// One unit's input for one frame.
    type Input: Copy + Default + PartialEq + Debug + Send + Serialize + DeserializeOwned;
    /// The complete simulation state.
    type State: Clone;

    /// Advances `state` by one frame using the given input set.
    fn advance(state: &mut Self::State, frame: crate::Frame, inputs: &OneFrameInputs<Self::Input>);

    /// Deterministic hash of `state`, compared across peers for desync
    /// detection. Use [`crate::hash::DeterministicHasher`].
    fn state_hash(state: &Self::State) -> u64;
}

/// The input of every unit for a single frame.
///
/// Backed by a `BTreeMap` so iteration order is the unit id order on every
/// machine; determinism of `advance` depends on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: Serialize + DeserializeOwned")]
pub struct OneFrameInputs<I> {
    inputs: BTreeMap<UnitId, I>,
}

impl<I> Default for OneFrameInputs<I> {
    fn default() -> Self {
        OneFrameInputs {
            inputs: BTreeMap::new(),
        }
    }
}

impl<I: Copy> OneFrameInputs<I> {
    /// Creates an empty input set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or replaces) one unit's input.
    pub fn insert(&mut self, unit: UnitId, input: I) {
        self.inputs.insert(unit, input);
    }

    /// One unit's input, if present.
    #[must_use]
    pub fn get(&self, unit: UnitId) -> Option<I> {
        self.inputs.get(&unit).copied()
    }

    /// Whether the set holds an input for `unit`.
    #[must_use]
    pub fn contains(&self, unit: UnitId) -> bool {
        self.inputs.contains_key(&unit)
    }

    /// Number of units with an input.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Iterates inputs in unit id order.
    pub fn iter(&self) -> impl Iterator<Item = (UnitId, I)> + '_ {
        self.inputs.iter().map(|(&unit, &input)| (unit, input))
    }
}
