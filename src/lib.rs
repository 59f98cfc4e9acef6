//! # Bastion Net
//!
//! A networking stack for real-time multiplayer games, built out of four layers:
//!
//! 1. **Reliable transport** ([`network::service::KcpService`]): connection-oriented,
//!    ordered, reliable delivery over a single shared UDP socket, using a safe
//!    KCP-style ARQ state machine plus an explicit SYN/ACK/FIN handshake.
//! 2. **Sessions and RPC** ([`session::Session`]): typed request/response
//!    correlation over a transport channel, with cancellation and guaranteed
//!    resolution of every pending call.
//! 3. **Actor routing** ([`actor::ActorRouter`]): location-transparent delivery of
//!    messages addressed to game entities that may live on other processes,
//!    guarded by ttl-bounded distributed locks during migration.
//! 4. **Lockstep synchronization** ([`lockstep::Room`]): deterministic fixed-tick
//!    simulation with client-side prediction, server-authoritative rollback and
//!    hash-based desync detection.
//!
//! The crate is poll-driven: nothing spawns threads or tasks. The embedding game
//! loop calls `update(now_ms)` on the service and the room each tick and drains
//! the resulting events. All timestamps are explicit `u64` milliseconds so tests
//! control the clock.
//!
//! Game rules stay outside this crate. The lockstep layer calls back into a
//! user-supplied [`lockstep::LockstepConfig`] to advance the simulation and to
//! hash its state; the wire layer serializes user message types through
//! [`registry::OpcodeRegistry`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use serde::{Deserialize, Serialize};

pub use error::BastionError;

pub mod actor;
pub mod clock;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod lockstep;
pub mod registry;
pub mod rle;
pub mod rng;
pub mod session;
/// Wire-level modules: codec, ARQ state machine, framing, channels, service.
pub mod network {
    pub mod buffer;
    pub mod channel;
    pub mod codec;
    pub mod kcp;
    pub mod service;
    pub mod socket;
}

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single step of lockstep simulation.
///
/// Frames are the fundamental unit of time in the lockstep layer. Frame numbers
/// start at 0 and increase strictly; [`NULL_FRAME`] (-1) means "no frame yet".
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame`. Use [`Frame::is_valid`] to check non-negativity.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;
    #[inline]
    fn add(self, rhs: i32) -> Frame {
        Frame(self.0 + rhs)
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;
    #[inline]
    fn sub(self, rhs: i32) -> Frame {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;
    #[inline]
    fn sub(self, rhs: Frame) -> i32 {
        self.0 - rhs.0
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

/// Identifies one end of a logical transport channel.
///
/// Generated randomly by the connecting side and echoed by the accepting side
/// during the handshake. Values below [`ConnectionId::MIN_VALID`] are reserved
/// for control packets (SYN/ACK/FIN), so a valid id is always distinguishable
/// from a control tag by a datagram's leading 4 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Smallest value a real connection id may take; everything below is a
    /// reserved control tag.
    pub const MIN_VALID: u32 = 1000;

    /// Creates a connection id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        ConnectionId(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` if the raw value is in the valid (non-reserved) range.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= Self::MIN_VALID
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation token linking an RPC request to its eventual response.
///
/// Allocated from a process-wide monotonically increasing counter (see
/// [`session::RpcIdAllocator`]); never reused and never zero, so `0` on the
/// wire means "not a call".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RpcId(u32);

impl RpcId {
    /// Creates an rpc id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        RpcId(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a logical game entity addressable independent of which process
/// currently hosts it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(i64);

impl ActorId {
    /// Creates an actor id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        ActorId(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a backend process that can own actors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Creates a process id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        ProcessId(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a player/unit inside a lockstep room; keys the per-frame input set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(i64);

impl UnitId {
    /// Creates a unit id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        UnitId(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire opcode identifying a concrete message type.
///
/// The opcode also selects the payload format by range: opcodes at or above
/// [`Opcode::TEXT_RANGE_START`] use the textual (JSON) serializer, everything
/// below uses the binary (bincode) serializer. See [`registry::PayloadFormat`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Opcode(u16);

impl Opcode {
    /// First opcode of the textual serializer range.
    pub const TEXT_RANGE_START: u16 = 0x6000;

    /// Creates an opcode from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Opcode(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_null_constant() {
        assert_eq!(Frame::NULL.as_i32(), -1);
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
    }

    #[test]
    fn frame_arithmetic() {
        let frame = Frame::new(10);
        assert_eq!((frame + 5).as_i32(), 15);
        assert_eq!((frame - 3).as_i32(), 7);
        assert_eq!(Frame::new(10) - Frame::new(4), 6);
        let mut f = Frame::new(0);
        f += 2;
        assert_eq!(f, Frame::new(2));
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(42).to_string(), "42");
    }

    #[test]
    fn connection_id_reserved_range() {
        assert!(!ConnectionId::new(1).is_valid());
        assert!(!ConnectionId::new(999).is_valid());
        assert!(ConnectionId::new(ConnectionId::MIN_VALID).is_valid());
        assert!(ConnectionId::new(u32::MAX).is_valid());
    }

    #[test]
    fn opcode_display_is_hex() {
        assert_eq!(Opcode::new(0x07D5).to_string(), "0x07d5");
    }

    #[test]
    fn newtype_ordering() {
        assert!(RpcId::new(1) < RpcId::new(2));
        assert!(ActorId::new(-1) < ActorId::new(0));
        assert!(UnitId::new(5) > UnitId::new(4));
        assert!(ProcessId::new(1) < ProcessId::new(9));
    }
}
