//! The crate-wide error type.
//!
//! One enum spans every layer so results compose across layer boundaries
//! without boxing. The variant groups and how each propagates are documented
//! on [`BastionError`] itself.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{ActorId, ConnectionId, Frame, Opcode, ProcessId, RpcId};

/// All errors this library can return. Most fallible API functions return a
/// `Result<_, BastionError>`.
///
/// The taxonomy mirrors how failures propagate:
///
/// - *Transport-fatal* variants ([`NetworkReset`], [`PeerDisconnect`],
///   [`ConnectTimeout`], [`Socket`]) dispose one channel and never crash the
///   shared service.
/// - *RPC* variants ([`SessionDisposed`], [`CallCancelled`], [`RpcFault`])
///   resolve a single pending call; the connection stays healthy for
///   [`RpcFault`].
/// - *Actor-routing* variants ([`ActorNotFound`], [`ActorLocationNotFound`],
///   [`LockHeld`], [`LockNotHeld`]) are typed error codes surfaced to the
///   request issuer, expected under normal operation (a player logging off is
///   not exceptional).
/// - *Lockstep* variants ([`PredictionThreshold`], [`FrameOutOfWindow`],
///   [`Desync`], [`RoomClosed`]) are fatal to a room at worst, never to the
///   process.
///
/// [`NetworkReset`]: BastionError::NetworkReset
/// [`PeerDisconnect`]: BastionError::PeerDisconnect
/// [`ConnectTimeout`]: BastionError::ConnectTimeout
/// [`Socket`]: BastionError::Socket
/// [`SessionDisposed`]: BastionError::SessionDisposed
/// [`CallCancelled`]: BastionError::CallCancelled
/// [`RpcFault`]: BastionError::RpcFault
/// [`ActorNotFound`]: BastionError::ActorNotFound
/// [`ActorLocationNotFound`]: BastionError::ActorLocationNotFound
/// [`LockHeld`]: BastionError::LockHeld
/// [`LockNotHeld`]: BastionError::LockNotHeld
/// [`PredictionThreshold`]: BastionError::PredictionThreshold
/// [`FrameOutOfWindow`]: BastionError::FrameOutOfWindow
/// [`Desync`]: BastionError::Desync
/// [`RoomClosed`]: BastionError::RoomClosed
#[derive(Debug, Clone, PartialEq)]
pub enum BastionError {
    /// The handshake did not complete within the connect timeout window.
    ConnectTimeout {
        /// The channel that timed out.
        conn: ConnectionId,
    },
    /// A connected channel received nothing for the configured idle window and
    /// was force-closed.
    NetworkReset {
        /// The channel that was reset.
        conn: ConnectionId,
    },
    /// The peer sent an explicit FIN carrying this error code.
    PeerDisconnect {
        /// The channel the FIN addressed.
        conn: ConnectionId,
        /// Error code carried in the FIN payload (0 for a clean close).
        code: u32,
    },
    /// A socket-level send/receive failed.
    Socket {
        /// Description of the underlying I/O failure.
        context: String,
    },
    /// The reliable-delivery state machine declared the link dead (too many
    /// retransmissions of a single segment).
    LinkDead {
        /// The channel whose link died.
        conn: ConnectionId,
    },
    /// Serialization or deserialization of a payload failed.
    Codec {
        /// What was being encoded/decoded.
        context: String,
    },
    /// An inbound packet declared a length over the framing limit.
    PacketTooLarge {
        /// The declared length.
        len: usize,
        /// The framing limit.
        max: usize,
    },
    /// No message type is registered for this opcode.
    UnknownOpcode {
        /// The unregistered opcode.
        opcode: Opcode,
    },
    /// Registration attempted to bind an opcode or type that is already bound.
    DuplicateRegistration {
        /// The opcode involved in the conflict.
        opcode: Opcode,
    },
    /// A decoded message was not of the type its opcode registration promises.
    TypeMismatch {
        /// The opcode whose registration disagreed.
        opcode: Opcode,
    },
    /// The session was disposed while the call was still pending.
    SessionDisposed,
    /// The caller cancelled the pending call locally.
    CallCancelled,
    /// The response arrived but carried a non-zero application error code.
    RpcFault {
        /// The rpc id of the faulted call.
        rpc: RpcId,
        /// The application error code from the response body.
        code: u32,
    },
    /// No entity with this actor id lives on the resolved owning process.
    ActorNotFound {
        /// The actor that could not be found.
        actor: ActorId,
    },
    /// No owning process is recorded for this actor id.
    ActorLocationNotFound {
        /// The actor with no known location.
        actor: ActorId,
    },
    /// The migration lock for this actor is already held.
    LockHeld {
        /// The locked actor.
        actor: ActorId,
        /// The process currently holding the lock.
        holder: ProcessId,
    },
    /// A lock release was requested by a process that does not hold the lock.
    LockNotHeld {
        /// The actor whose lock was not held.
        actor: ActorId,
    },
    /// The gap between predicted and authoritative frames reached the horizon;
    /// the room refuses to predict further until the server catches up.
    PredictionThreshold,
    /// A frame index fell outside the frame buffer's retention window.
    FrameOutOfWindow {
        /// The requested frame.
        frame: Frame,
        /// Oldest frame still retained.
        earliest: Frame,
        /// Newest frame currently seeded.
        latest: Frame,
    },
    /// An authoritative input set arrived out of order.
    FrameOutOfOrder {
        /// The frame the server confirmed.
        got: Frame,
        /// The frame the room expected next.
        expected: Frame,
    },
    /// Local and remote state hashes diverged for a confirmed frame. Fatal to
    /// the room.
    Desync {
        /// The frame at which the hashes diverged.
        frame: Frame,
        /// Hash computed locally.
        local_hash: u64,
        /// Hash reported by the peer/server.
        remote_hash: u64,
    },
    /// The room has been closed; no further frame processing is accepted.
    RoomClosed,
}

impl Display for BastionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BastionError::ConnectTimeout { conn } => {
                write!(f, "channel {} handshake timed out", conn)
            }
            BastionError::NetworkReset { conn } => {
                write!(f, "channel {} idle too long, network reset", conn)
            }
            BastionError::PeerDisconnect { conn, code } => {
                write!(f, "peer closed channel {} (code {})", conn, code)
            }
            BastionError::Socket { context } => write!(f, "socket error: {}", context),
            BastionError::LinkDead { conn } => {
                write!(f, "channel {} link dead after repeated retransmission", conn)
            }
            BastionError::Codec { context } => write!(f, "codec error: {}", context),
            BastionError::PacketTooLarge { len, max } => {
                write!(f, "packet length {} exceeds framing limit {}", len, max)
            }
            BastionError::UnknownOpcode { opcode } => {
                write!(f, "no message type registered for opcode {}", opcode)
            }
            BastionError::DuplicateRegistration { opcode } => {
                write!(f, "opcode {} or its message type is already registered", opcode)
            }
            BastionError::TypeMismatch { opcode } => {
                write!(f, "decoded message type does not match opcode {}", opcode)
            }
            BastionError::SessionDisposed => {
                write!(f, "session disposed while the call was pending")
            }
            BastionError::CallCancelled => write!(f, "call cancelled by the caller"),
            BastionError::RpcFault { rpc, code } => {
                write!(f, "rpc {} failed with application error code {}", rpc, code)
            }
            BastionError::ActorNotFound { actor } => {
                write!(f, "actor {} not found on owning process", actor)
            }
            BastionError::ActorLocationNotFound { actor } => {
                write!(f, "no location recorded for actor {}", actor)
            }
            BastionError::LockHeld { actor, holder } => {
                write!(f, "lock for actor {} already held by process {}", actor, holder)
            }
            BastionError::LockNotHeld { actor } => {
                write!(f, "lock for actor {} is not held by the releasing process", actor)
            }
            BastionError::PredictionThreshold => {
                write!(f, "prediction horizon reached, waiting for authoritative frames")
            }
            BastionError::FrameOutOfWindow {
                frame,
                earliest,
                latest,
            } => write!(
                f,
                "frame {} outside retention window [{}, {}]",
                frame, earliest, latest
            ),
            BastionError::FrameOutOfOrder { got, expected } => {
                write!(f, "authoritative frame {} arrived, expected {}", got, expected)
            }
            BastionError::Desync {
                frame,
                local_hash,
                remote_hash,
            } => write!(
                f,
                "desync at frame {}: local hash {:#018x}, remote hash {:#018x}",
                frame, local_hash, remote_hash
            ),
            BastionError::RoomClosed => write!(f, "room is closed"),
        }
    }
}

impl Error for BastionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_ids() {
        let err = BastionError::LockHeld {
            actor: ActorId::new(77),
            holder: ProcessId::new(3),
        };
        let text = err.to_string();
        assert!(text.contains("77"));
        assert!(text.contains('3'));
    }

    #[test]
    fn display_desync_shows_both_hashes() {
        let err = BastionError::Desync {
            frame: Frame::new(10),
            local_hash: 0xAB,
            remote_hash: 0xCD,
        };
        let text = err.to_string();
        assert!(text.contains("frame 10"));
        assert!(text.contains("0x00000000000000ab"));
        assert!(text.contains("0x00000000000000cd"));
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(BastionError::SessionDisposed, BastionError::SessionDisposed);
        assert_ne!(
            BastionError::SessionDisposed,
            BastionError::CallCancelled
        );
    }
}
