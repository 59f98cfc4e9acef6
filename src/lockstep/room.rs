//! The lockstep room: prediction, authoritative confirmation and rollback.
//!
//! A [`Room`] keeps two simulation states. The *authority* state only ever
//! advances by server-confirmed input sets and is bit-identical on every
//! peer. The *current* state runs ahead of it by up to the prediction
//! horizon, advanced by predicted input sets (the local unit's real input,
//! remote units assumed to repeat their last confirmed input). When a
//! confirmation proves a prediction wrong, the current state is rebuilt from
//! the authority state by re-simulating the predicted frames with corrected
//! inputs, keeping the local unit's own buffered inputs intact.
//!
//! The server side of the same protocol is [`FrameCollector`], which gathers
//! per-unit inputs and decides when a frame is confirmed.

use tracing::{debug, info, warn};

use crate::lockstep::frame_buffer::{FrameBuffer, DEFAULT_CAPACITY};
use crate::lockstep::replay::ReplayRecord;
use crate::lockstep::time::{FixedTimeCounter, FRAME_INTERVAL_MS};
use crate::lockstep::{LockstepConfig, OneFrameInputs, PREDICTION_HORIZON};
use crate::{BastionError, Frame, UnitId};

/// Tunables for a [`Room`].
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Max frames the current state may run ahead of the authority state.
    pub prediction_horizon: i32,
    /// Nominal frame interval, ms.
    pub frame_interval_ms: u64,
    /// Frames of input history retained for rollback and late queries.
    pub input_window: usize,
    /// Authority state hashes retained for desync checks and reconnection.
    pub hash_history: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        RoomConfig {
            prediction_horizon: PREDICTION_HORIZON,
            frame_interval_ms: FRAME_INTERVAL_MS,
            input_window: DEFAULT_CAPACITY,
            hash_history: DEFAULT_CAPACITY,
        }
    }
}

/// Lifecycle of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Created, waiting for the start signal.
    Initializing,
    /// Live: predicting ahead of the authority frame.
    Predicting,
    /// Terminal, entered on desync or explicit close.
    Closed,
}

/// Everything a late joiner needs to enter a running room.
#[derive(Debug, Clone)]
pub struct RoomSnapshot<C: LockstepConfig> {
    /// The authority frame the state corresponds to.
    pub frame: Frame,
    /// The authority state after `frame`.
    pub state: C::State,
    /// The participating units.
    pub roster: Vec<UnitId>,
    /// Last confirmed input per unit, the prediction basis going forward.
    pub last_inputs: OneFrameInputs<C::Input>,
}

/// Client-side lockstep synchronizer for one match.
pub struct Room<C: LockstepConfig> {
    config: RoomConfig,
    roster: Vec<UnitId>,
    local_unit: Option<UnitId>,
    state: RoomState,
    authority_frame: Frame,
    authority_state: C::State,
    predicted_frame: Frame,
    current_state: C::State,
    inputs: FrameBuffer<C::Input>,
    /// Last confirmed input per unit; the basis for predicting remote units.
    last_confirmed: OneFrameInputs<C::Input>,
    hashes: std::collections::VecDeque<(Frame, u64)>,
    replay: ReplayRecord<C::Input>,
    timer: FixedTimeCounter,
}

impl<C: LockstepConfig> std::fmt::Debug for Room<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("state", &self.state)
            .field("authority_frame", &self.authority_frame)
            .field("predicted_frame", &self.predicted_frame)
            .field("roster", &self.roster)
            .finish_non_exhaustive()
    }
}

impl<C: LockstepConfig> Room<C> {
    /// Creates a room in [`RoomState::Initializing`]. `local_unit` is `None`
    /// for observers, which predict by repetition only.
    pub fn new(
        config: RoomConfig,
        roster: Vec<UnitId>,
        local_unit: Option<UnitId>,
        initial_state: C::State,
    ) -> Self {
        Room {
            inputs: FrameBuffer::new(config.input_window),
            timer: FixedTimeCounter::new(0, Frame::new(0)),
            replay: ReplayRecord::new(Frame::new(0), 0, roster.clone()),
            config,
            roster,
            local_unit,
            state: RoomState::Initializing,
            authority_frame: Frame::NULL,
            current_state: initial_state.clone(),
            authority_state: initial_state,
            predicted_frame: Frame::NULL,
            last_confirmed: OneFrameInputs::new(),
            hashes: std::collections::VecDeque::new(),
        }
    }

    /// Rebuilds a room from a snapshot, for reconnection or late join. The
    /// room starts live; its replay records from the snapshot frame on.
    pub fn from_snapshot(
        config: RoomConfig,
        snapshot: RoomSnapshot<C>,
        local_unit: Option<UnitId>,
        now_ms: u64,
    ) -> Self {
        let next = snapshot.frame + 1;
        info!(frame = %snapshot.frame, "restoring room from snapshot");
        Room {
            inputs: FrameBuffer::new(config.input_window),
            timer: FixedTimeCounter::with_interval(now_ms, next, config.frame_interval_ms),
            replay: ReplayRecord::new(next, now_ms, snapshot.roster.clone()),
            config,
            roster: snapshot.roster,
            local_unit,
            state: RoomState::Predicting,
            authority_frame: snapshot.frame,
            current_state: snapshot.state.clone(),
            authority_state: snapshot.state,
            predicted_frame: snapshot.frame,
            last_confirmed: snapshot.last_inputs,
            hashes: std::collections::VecDeque::new(),
        }
    }

    /// Starts the match clock; frame 0 is due at `start_time_ms`.
    pub fn start(&mut self, start_time_ms: u64) {
        if self.state != RoomState::Initializing {
            return;
        }
        self.timer =
            FixedTimeCounter::with_interval(start_time_ms, Frame::new(0), self.config.frame_interval_ms);
        self.replay.start_time_ms = start_time_ms;
        self.state = RoomState::Predicting;
        info!(start_time_ms, roster = self.roster.len(), "room started");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn room_state(&self) -> RoomState {
        self.state
    }

    /// Last server-confirmed frame, [`Frame::NULL`] before the first.
    #[must_use]
    pub fn authority_frame(&self) -> Frame {
        self.authority_frame
    }

    /// Newest predicted frame the current state reflects.
    #[must_use]
    pub fn predicted_frame(&self) -> Frame {
        self.predicted_frame
    }

    /// The predicted (displayed) state.
    pub fn current_state(&self) -> &C::State {
        &self.current_state
    }

    /// The confirmed state, identical on every peer.
    pub fn authority_state(&self) -> &C::State {
        &self.authority_state
    }

    /// The frame timer, for scheduling ticks.
    #[must_use]
    pub fn timer(&self) -> &FixedTimeCounter {
        &self.timer
    }

    /// Adjusts the frame interval (clamped), re-based at the current
    /// predicted frame. Used to speed up when trailing the server.
    pub fn change_interval(&mut self, interval_ms: u64, now_ms: u64) {
        let base = if self.predicted_frame.is_null() {
            Frame::new(0)
        } else {
            self.predicted_frame + 1
        };
        self.timer.change_interval(interval_ms, base, now_ms);
    }

    /// The authority hash recorded for `frame`, if still retained.
    #[must_use]
    pub fn authority_hash(&self, frame: Frame) -> Option<u64> {
        self.hashes
            .iter()
            .find(|(f, _)| *f == frame)
            .map(|(_, h)| *h)
    }

    /// The replay recorded so far.
    #[must_use]
    pub fn replay(&self) -> &ReplayRecord<C::Input> {
        &self.replay
    }

    /// Captures a snapshot a late joiner can restore from.
    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot<C> {
        RoomSnapshot {
            frame: self.authority_frame,
            state: self.authority_state.clone(),
            roster: self.roster.clone(),
            last_inputs: self.last_confirmed.clone(),
        }
    }

    /// Closes the room; every further operation fails.
    pub fn close(&mut self) {
        self.state = RoomState::Closed;
    }

    fn ensure_live(&self) -> Result<(), BastionError> {
        if self.state == RoomState::Predicting {
            Ok(())
        } else {
            Err(BastionError::RoomClosed)
        }
    }

    fn build_predicted_inputs(&self, local_input: Option<C::Input>) -> OneFrameInputs<C::Input> {
        let mut set = OneFrameInputs::new();
        for &unit in &self.roster {
            let input = match (self.local_unit, local_input) {
                (Some(local), Some(input)) if local == unit => input,
                _ => self.last_confirmed.get(unit).unwrap_or_default(),
            };
            set.insert(unit, input);
        }
        set
    }

    fn predict_inner(&mut self, local_input: Option<C::Input>) -> Result<Frame, BastionError> {
        self.ensure_live()?;
        let next = if self.predicted_frame.is_null() {
            Frame::new(0)
        } else {
            self.predicted_frame + 1
        };
        let ahead = next - self.authority_frame;
        if ahead > self.config.prediction_horizon {
            return Err(BastionError::PredictionThreshold);
        }
        let set = self.build_predicted_inputs(local_input);
        self.inputs.set(next, set.clone())?;
        C::advance(&mut self.current_state, next, &set);
        self.predicted_frame = next;
        Ok(next)
    }

    /// Predicts the next frame with the local unit's real input. Returns the
    /// frame the input belongs to; send it to the server under that frame.
    pub fn predict_local(&mut self, input: C::Input) -> Result<Frame, BastionError> {
        self.predict_inner(Some(input))
    }

    /// Predicts the next frame by repetition only (observer mode, or a tick
    /// with no local input).
    pub fn predict(&mut self) -> Result<Frame, BastionError> {
        self.predict_inner(None)
    }

    /// Applies a server-confirmed frame.
    ///
    /// `frame` must be exactly the frame after the last confirmed one.
    /// `server_hash`, when present, is compared against the locally computed
    /// authority hash; a mismatch is a desync, which closes the room.
    ///
    /// Returns `true` when the confirmation contradicted the prediction and a
    /// rollback re-simulation ran.
    pub fn apply_authoritative(
        &mut self,
        frame: Frame,
        confirmed: OneFrameInputs<C::Input>,
        server_hash: Option<u64>,
    ) -> Result<bool, BastionError> {
        self.ensure_live()?;
        let expected = if self.authority_frame.is_null() {
            self.replay.start_frame
        } else {
            self.authority_frame + 1
        };
        if frame != expected {
            return Err(BastionError::FrameOutOfOrder {
                got: frame,
                expected,
            });
        }

        C::advance(&mut self.authority_state, frame, &confirmed);
        let local_hash = C::state_hash(&self.authority_state);
        if let Some(remote_hash) = server_hash {
            if remote_hash != local_hash {
                warn!(%frame, local_hash, remote_hash, "desync detected, closing room");
                self.state = RoomState::Closed;
                return Err(BastionError::Desync {
                    frame,
                    local_hash,
                    remote_hash,
                });
            }
        }
        self.hashes.push_back((frame, local_hash));
        while self.hashes.len() > self.config.hash_history {
            self.hashes.pop_front();
        }
        self.replay.push(confirmed.clone());

        let mispredicted = match self.inputs.get(frame) {
            Ok(predicted) => *predicted != confirmed,
            Err(_) => true,
        };
        for (unit, input) in confirmed.iter() {
            self.last_confirmed.insert(unit, input);
        }
        self.inputs.set(frame, confirmed)?;
        self.authority_frame = frame;

        if self.predicted_frame <= frame {
            // Not ahead of the server; adopt the authority state wholesale.
            self.predicted_frame = frame;
            self.current_state = self.authority_state.clone();
            return Ok(false);
        }
        if !mispredicted {
            return Ok(false);
        }

        // Rollback: rebuild the predicted frames on top of the new authority
        // state, keeping the local unit's own buffered inputs.
        debug!(%frame, predicted = %self.predicted_frame, "rolling back");
        self.current_state = self.authority_state.clone();
        let mut f = frame + 1;
        while f <= self.predicted_frame {
            let old = self.inputs.get(f)?.clone();
            let mut set = OneFrameInputs::new();
            for &unit in &self.roster {
                let input = match self.local_unit {
                    Some(local) if local == unit => old.get(unit).unwrap_or_default(),
                    _ => self.last_confirmed.get(unit).unwrap_or_default(),
                };
                set.insert(unit, input);
            }
            self.inputs.set(f, set.clone())?;
            C::advance(&mut self.current_state, f, &set);
            f += 1;
        }
        Ok(true)
    }
}

/// Server-side input collection for one room.
///
/// Buffers inputs per frame (clients run ahead, so inputs for future frames
/// arrive early), confirms a frame when every unit's input is present, and
/// can force-confirm at a deadline by repeating each missing unit's last
/// input.
#[derive(Debug)]
pub struct FrameCollector<I> {
    roster: Vec<UnitId>,
    collecting: Frame,
    horizon: i32,
    buffer: FrameBuffer<I>,
    last_inputs: OneFrameInputs<I>,
}

impl<I: Copy + Default> FrameCollector<I> {
    /// Creates a collector starting at frame 0.
    #[must_use]
    pub fn new(roster: Vec<UnitId>, input_window: usize) -> Self {
        FrameCollector {
            roster,
            collecting: Frame::new(0),
            horizon: PREDICTION_HORIZON,
            buffer: FrameBuffer::new(input_window),
            last_inputs: OneFrameInputs::new(),
        }
    }

    /// The frame currently awaiting confirmation.
    #[must_use]
    pub fn collecting(&self) -> Frame {
        self.collecting
    }

    /// Records one unit's input for `frame`. Inputs for already-confirmed
    /// frames are stale and rejected. Future frames are buffered, but no
    /// further ahead than the prediction horizon: no well-behaved client can
    /// run past it, and an unbounded write would slide the ring's retention
    /// window beyond the frame still being collected, locking every honest
    /// client out of it.
    pub fn add_input(&mut self, frame: Frame, unit: UnitId, input: I) -> Result<(), BastionError> {
        if frame < self.collecting {
            return Err(BastionError::FrameOutOfOrder {
                got: frame,
                expected: self.collecting,
            });
        }
        if frame - self.collecting > self.horizon {
            return Err(BastionError::FrameOutOfWindow {
                frame,
                earliest: self.collecting,
                latest: self.collecting + self.horizon,
            });
        }
        self.buffer.add_input(frame, unit, input)
    }

    fn complete(&self) -> bool {
        match self.buffer.get(self.collecting) {
            Ok(set) => self.roster.iter().all(|&unit| set.contains(unit)),
            Err(_) => false,
        }
    }

    fn confirm(&mut self, fill_missing: bool) -> Option<OneFrameInputs<I>> {
        let partial = self.buffer.get(self.collecting).ok().cloned();
        let mut set = OneFrameInputs::new();
        for &unit in &self.roster {
            match partial.as_ref().and_then(|p| p.get(unit)) {
                Some(input) => set.insert(unit, input),
                None if fill_missing => {
                    set.insert(unit, self.last_inputs.get(unit).unwrap_or_default());
                }
                None => return None,
            }
        }
        for (unit, input) in set.iter() {
            self.last_inputs.insert(unit, input);
        }
        self.collecting += 1;
        Some(set)
    }

    /// Confirms the current frame if every unit has supplied an input.
    pub fn try_confirm(&mut self) -> Option<OneFrameInputs<I>> {
        if self.complete() {
            self.confirm(false)
        } else {
            None
        }
    }

    /// Confirms the current frame unconditionally, substituting each missing
    /// unit's last known input (default on the very first frames). Called at
    /// the frame deadline so one stalled client cannot freeze the room.
    pub fn confirm_with_fill(&mut self) -> OneFrameInputs<I> {
        match self.confirm(true) {
            Some(set) => set,
            // confirm(true) always yields a set; this arm is unreachable.
            None => OneFrameInputs::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a_hash;

    /// Toy simulation: each unit's input is added into a running total, and
    /// the frame number stirs the state so order mistakes are visible.
    struct Summing;

    impl LockstepConfig for Summing {
        type Input = i32;
        type State = i64;

        fn advance(state: &mut i64, frame: Frame, inputs: &OneFrameInputs<i32>) {
            *state = state.wrapping_mul(31).wrapping_add(i64::from(frame.as_i32()));
            for (unit, input) in inputs.iter() {
                *state = state.wrapping_add(unit.as_i64() ^ i64::from(input));
            }
        }

        fn state_hash(state: &i64) -> u64 {
            fnv1a_hash(state)
        }
    }

    const UNIT_A: UnitId = UnitId::new(1);
    const UNIT_B: UnitId = UnitId::new(2);

    fn live_room(local: Option<UnitId>) -> Room<Summing> {
        let mut room = Room::new(RoomConfig::default(), vec![UNIT_A, UNIT_B], local, 0);
        room.start(0);
        room
    }

    fn confirmed(a: i32, b: i32) -> OneFrameInputs<i32> {
        let mut set = OneFrameInputs::new();
        set.insert(UNIT_A, a);
        set.insert(UNIT_B, b);
        set
    }

    #[test]
    fn operations_require_start() {
        let mut room: Room<Summing> =
            Room::new(RoomConfig::default(), vec![UNIT_A], Some(UNIT_A), 0);
        assert!(matches!(
            room.predict_local(1),
            Err(BastionError::RoomClosed)
        ));
        room.start(0);
        assert_eq!(room.predict_local(1).unwrap(), Frame::new(0));
    }

    #[test]
    fn prediction_horizon_is_enforced() {
        let mut room = live_room(Some(UNIT_A));
        // authority_frame is NULL(-1), so 5 frames ahead means frames 0..=4.
        for f in 0..5 {
            assert_eq!(room.predict_local(f).unwrap(), Frame::new(f));
        }
        assert!(matches!(
            room.predict_local(9),
            Err(BastionError::PredictionThreshold)
        ));
        // One confirmation opens one more frame of headroom.
        room.apply_authoritative(Frame::new(0), confirmed(0, 0), None)
            .unwrap();
        assert_eq!(room.predict_local(5).unwrap(), Frame::new(5));
    }

    #[test]
    fn out_of_order_confirmation_rejected() {
        let mut room = live_room(Some(UNIT_A));
        room.predict_local(1).unwrap();
        assert!(matches!(
            room.apply_authoritative(Frame::new(2), confirmed(0, 0), None),
            Err(BastionError::FrameOutOfOrder { .. })
        ));
    }

    #[test]
    fn correct_prediction_needs_no_rollback() {
        let mut room = live_room(Some(UNIT_A));
        // Remote unit B is predicted to repeat its last confirmed input,
        // which starts as the default 0.
        room.predict_local(7).unwrap();
        let rolled_back = room
            .apply_authoritative(Frame::new(0), confirmed(7, 0), None)
            .unwrap();
        assert!(!rolled_back);
        assert_eq!(room.current_state(), room.authority_state());
    }

    #[test]
    fn rollback_converges_to_pure_authority_simulation() {
        let mut room = live_room(Some(UNIT_A));
        let local_inputs = [3, -1, 4, 1, 5];
        for &input in &local_inputs {
            room.predict_local(input).unwrap();
        }

        // The server reveals that unit B did something unpredicted.
        let frames = [
            confirmed(3, 100),
            confirmed(-1, 100),
            confirmed(4, 100),
            confirmed(1, 100),
            confirmed(5, 100),
        ];
        for (i, set) in frames.iter().enumerate() {
            room.apply_authoritative(Frame::new(i as i32), set.clone(), None)
                .unwrap();
        }

        // Reference: apply the confirmed inputs directly.
        let mut reference = 0i64;
        for (i, set) in frames.iter().enumerate() {
            Summing::advance(&mut reference, Frame::new(i as i32), set);
        }
        assert_eq!(*room.authority_state(), reference);
        assert_eq!(*room.current_state(), reference);
    }

    #[test]
    fn rollback_preserves_local_buffered_inputs() {
        let mut room = live_room(Some(UNIT_A));
        room.predict_local(10).unwrap(); // frame 0
        room.predict_local(20).unwrap(); // frame 1
        room.predict_local(30).unwrap(); // frame 2

        // Frame 0 confirms with B's real input, invalidating the prediction.
        let rolled_back = room
            .apply_authoritative(Frame::new(0), confirmed(10, 99), None)
            .unwrap();
        assert!(rolled_back);

        // The re-simulated current state must equal simulating frames 0..=2
        // with A's real inputs and B repeating its newly confirmed 99.
        let mut reference = 0i64;
        Summing::advance(&mut reference, Frame::new(0), &confirmed(10, 99));
        Summing::advance(&mut reference, Frame::new(1), &confirmed(20, 99));
        Summing::advance(&mut reference, Frame::new(2), &confirmed(30, 99));
        assert_eq!(*room.current_state(), reference);
    }

    #[test]
    fn desync_closes_room() {
        let mut room = live_room(Some(UNIT_A));
        room.predict_local(1).unwrap();
        let result = room.apply_authoritative(Frame::new(0), confirmed(1, 0), Some(0xBAD));
        assert!(matches!(result, Err(BastionError::Desync { .. })));
        assert_eq!(room.room_state(), RoomState::Closed);
        assert!(matches!(room.predict_local(2), Err(BastionError::RoomClosed)));
    }

    #[test]
    fn matching_hash_passes() {
        let mut reference = live_room(None);
        reference
            .apply_authoritative(Frame::new(0), confirmed(1, 2), None)
            .unwrap();
        let expected_hash = reference.authority_hash(Frame::new(0)).unwrap();

        let mut room = live_room(Some(UNIT_A));
        room.apply_authoritative(Frame::new(0), confirmed(1, 2), Some(expected_hash))
            .unwrap();
        assert_eq!(room.room_state(), RoomState::Predicting);
    }

    #[test]
    fn replay_matches_authority_state() {
        let mut room = live_room(Some(UNIT_A));
        for f in 0..20 {
            room.predict_local(f).unwrap();
            room.apply_authoritative(Frame::new(f), confirmed(f, f * 2), None)
                .unwrap();
        }
        let final_hash = Summing::state_hash(room.authority_state());

        let replay = room.replay().clone();
        assert_eq!(replay.len(), 20);
        let mut player = crate::lockstep::ReplayPlayer::<Summing>::new(replay, 0);
        assert_eq!(player.run_to_end(), final_hash);
    }

    #[test]
    fn snapshot_restores_midgame() {
        let mut room = live_room(Some(UNIT_A));
        for f in 0..10 {
            room.apply_authoritative(Frame::new(f), confirmed(f, 7), None)
                .unwrap();
        }
        let snapshot = room.snapshot();
        assert_eq!(snapshot.frame, Frame::new(9));

        let mut rejoined =
            Room::<Summing>::from_snapshot(RoomConfig::default(), snapshot, Some(UNIT_B), 5000);
        assert_eq!(rejoined.authority_frame(), Frame::new(9));
        assert_eq!(rejoined.authority_state(), room.authority_state());

        // Both rooms continue with the same confirmations and stay equal.
        for f in 10..15 {
            room.apply_authoritative(Frame::new(f), confirmed(1, 1), None)
                .unwrap();
            rejoined
                .apply_authoritative(Frame::new(f), confirmed(1, 1), None)
                .unwrap();
        }
        assert_eq!(rejoined.authority_state(), room.authority_state());
    }

    #[test]
    fn collector_confirms_when_all_present() {
        let mut collector: FrameCollector<i32> = FrameCollector::new(vec![UNIT_A, UNIT_B], 64);
        collector.add_input(Frame::new(0), UNIT_A, 1).unwrap();
        assert!(collector.try_confirm().is_none());
        collector.add_input(Frame::new(0), UNIT_B, 2).unwrap();
        let set = collector.try_confirm().unwrap();
        assert_eq!(set.get(UNIT_A), Some(1));
        assert_eq!(set.get(UNIT_B), Some(2));
        assert_eq!(collector.collecting(), Frame::new(1));
    }

    #[test]
    fn collector_buffers_future_inputs() {
        let mut collector: FrameCollector<i32> = FrameCollector::new(vec![UNIT_A], 64);
        // Client running ahead sends frames 0..3 at once.
        for f in 0..3 {
            collector.add_input(Frame::new(f), UNIT_A, f).unwrap();
        }
        for f in 0..3 {
            let set = collector.try_confirm().unwrap();
            assert_eq!(set.get(UNIT_A), Some(f));
        }
        assert!(collector.try_confirm().is_none());
    }

    #[test]
    fn collector_rejects_stale_input() {
        let mut collector: FrameCollector<i32> = FrameCollector::new(vec![UNIT_A], 64);
        collector.add_input(Frame::new(0), UNIT_A, 1).unwrap();
        collector.try_confirm().unwrap();
        assert!(matches!(
            collector.add_input(Frame::new(0), UNIT_A, 9),
            Err(BastionError::FrameOutOfOrder { .. })
        ));
    }

    #[test]
    fn collector_rejects_input_beyond_horizon() {
        let mut collector: FrameCollector<i32> = FrameCollector::new(vec![UNIT_A, UNIT_B], 64);
        assert!(matches!(
            collector.add_input(Frame::new(100_000), UNIT_A, 7),
            Err(BastionError::FrameOutOfWindow { .. })
        ));
        // The rejected input left the collecting frame reachable.
        collector.add_input(Frame::new(0), UNIT_A, 1).unwrap();
        collector.add_input(Frame::new(0), UNIT_B, 2).unwrap();
        let set = collector.try_confirm().unwrap();
        assert_eq!(set.get(UNIT_A), Some(1));
        assert_eq!(collector.collecting(), Frame::new(1));

        // The bound tracks the collecting frame as it advances.
        collector
            .add_input(Frame::new(1 + PREDICTION_HORIZON), UNIT_A, 3)
            .unwrap();
        assert!(matches!(
            collector.add_input(Frame::new(2 + PREDICTION_HORIZON), UNIT_A, 4),
            Err(BastionError::FrameOutOfWindow { .. })
        ));
    }

    #[test]
    fn collector_fill_repeats_last_input() {
        let mut collector: FrameCollector<i32> = FrameCollector::new(vec![UNIT_A, UNIT_B], 64);
        collector.add_input(Frame::new(0), UNIT_A, 5).unwrap();
        collector.add_input(Frame::new(0), UNIT_B, 6).unwrap();
        collector.try_confirm().unwrap();

        // Frame 1: only A reports; the deadline fill repeats B's 6.
        collector.add_input(Frame::new(1), UNIT_A, 7).unwrap();
        let set = collector.confirm_with_fill();
        assert_eq!(set.get(UNIT_A), Some(7));
        assert_eq!(set.get(UNIT_B), Some(6));

        // Frame 2: nobody reports; both repeat.
        let set = collector.confirm_with_fill();
        assert_eq!(set.get(UNIT_A), Some(7));
        assert_eq!(set.get(UNIT_B), Some(6));
    }
}
