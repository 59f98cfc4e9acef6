//! Sessions: typed request/response correlation over one transport channel.
//!
//! A [`Session`] owns the rpc bookkeeping for a single connection: it stamps
//! outgoing requests with ids from a process-wide [`RpcIdAllocator`], keeps a
//! pending-call table, and resolves each [`CallHandle`] exactly once when the
//! reply arrives (or when the call is cancelled or the session disposed).
//!
//! The session is transport-agnostic: outgoing envelopes accumulate in an
//! outbox that the host drains into [`crate::network::service::KcpService`],
//! and inbound packets are fed through [`Session::handle_packet`]. Replies are
//! consumed internally; everything else comes back as an [`Inbound`] for the
//! dispatcher.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::envelope;
use crate::registry::{Message, MessageClass, OpcodeRegistry, ResponseBody};
use crate::{ActorId, BastionError, ConnectionId, Opcode, RpcId};

/// Rpc ids occupy 30 bits of the envelope's rpc word.
const RPC_ID_MAX: u32 = (1 << 30) - 1;

/// Process-wide allocator of rpc correlation ids.
///
/// Cheap to clone; all clones share one counter. Ids are strictly increasing
/// and never zero, so every session in the process draws from the same
/// sequence and a reply can never match the wrong call.
#[derive(Debug, Clone, Default)]
pub struct RpcIdAllocator {
    counter: Arc<AtomicU32>,
}

impl RpcIdAllocator {
    /// Creates an allocator starting from id 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id.
    #[must_use]
    pub fn next_id(&self) -> RpcId {
        loop {
            let raw = self
                .counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1)
                & RPC_ID_MAX;
            if raw != 0 {
                return RpcId::new(raw);
            }
        }
    }
}

#[derive(Debug)]
struct CallSlot {
    result: Option<Result<Box<dyn Any + Send>, BastionError>>,
    cancelled: bool,
}

impl CallSlot {
    fn complete(&mut self, outcome: Result<Box<dyn Any + Send>, BastionError>) {
        if self.result.is_none() && !self.cancelled {
            self.result = Some(outcome);
        }
    }
}

/// The caller's handle to a pending rpc.
///
/// Resolved at most once; poll [`CallHandle::try_take`] from the game loop.
#[derive(Debug)]
pub struct CallHandle<R> {
    slot: Arc<Mutex<CallSlot>>,
    response_opcode: Opcode,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Message> CallHandle<R> {
    /// Takes the result if the call has resolved. Returns `None` while still
    /// pending; after returning `Some`, subsequent polls return `None` again.
    pub fn try_take(&self) -> Option<Result<R, BastionError>> {
        let outcome = self.slot.lock().result.take()?;
        Some(outcome.and_then(|boxed| {
            boxed.downcast::<R>().map(|b| *b).map_err(|_| {
                BastionError::TypeMismatch {
                    opcode: self.response_opcode,
                }
            })
        }))
    }

    /// Cancels the call locally. The session drops the pending entry on its
    /// next sweep; a response that still arrives is discarded.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.cancelled = true;
        if slot.result.is_none() {
            slot.result = Some(Err(BastionError::CallCancelled));
        }
    }

    /// Whether a result (including cancellation) is waiting or was taken.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        let slot = self.slot.lock();
        slot.result.is_some() || slot.cancelled
    }
}

#[derive(Debug)]
struct PendingCall {
    slot: Arc<Mutex<CallSlot>>,
}

/// A non-reply message decoded off the wire, ready for dispatch.
#[derive(Debug)]
pub struct Inbound {
    /// The wire opcode.
    pub opcode: Opcode,
    /// The opcode's registered class.
    pub class: MessageClass,
    /// Correlation id to answer with, for requests.
    pub rpc_id: Option<RpcId>,
    /// Destination entity, for actor-addressed messages.
    pub actor_id: Option<ActorId>,
    /// The decoded message; downcast via [`OpcodeRegistry::downcast`].
    pub message: Box<dyn Any + Send>,
}

/// Rpc state for one logical connection.
#[derive(Debug)]
pub struct Session {
    conn: ConnectionId,
    registry: Arc<OpcodeRegistry>,
    allocator: RpcIdAllocator,
    pending: HashMap<RpcId, PendingCall>,
    outbox: VecDeque<Vec<u8>>,
    disposed: bool,
}

impl Session {
    /// Creates a session for `conn`.
    #[must_use]
    pub fn new(conn: ConnectionId, registry: Arc<OpcodeRegistry>, allocator: RpcIdAllocator) -> Self {
        Session {
            conn,
            registry,
            allocator,
            pending: HashMap::new(),
            outbox: VecDeque::new(),
            disposed: false,
        }
    }

    /// The connection this session rides on.
    #[must_use]
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Number of calls still awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Drains envelopes queued for the transport.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }

    /// Queues an already-encoded envelope, used by the actor router when
    /// forwarding without re-encoding.
    pub fn push_outgoing(&mut self, bytes: Vec<u8>) -> Result<(), BastionError> {
        if self.disposed {
            return Err(BastionError::SessionDisposed);
        }
        self.outbox.push_back(bytes);
        Ok(())
    }

    fn check_class<M: Message>(&self, expected: MessageClass) -> Result<Opcode, BastionError> {
        let opcode = self.registry.opcode_of::<M>()?;
        match self.registry.class(opcode) {
            Some(class) if class == expected => Ok(opcode),
            _ => Err(BastionError::TypeMismatch { opcode }),
        }
    }

    /// Sends a fire-and-forget message.
    pub fn send<M: Message>(&mut self, message: &M) -> Result<(), BastionError> {
        if self.disposed {
            return Err(BastionError::SessionDisposed);
        }
        let opcode = self.check_class::<M>(MessageClass::Plain)?;
        let (_, payload) = self.registry.encode_payload(message)?;
        let bytes = envelope::encode(opcode, None, false, None, &payload)?;
        self.outbox.push_back(bytes);
        Ok(())
    }

    /// Sends a fire-and-forget message addressed to an entity.
    pub fn send_to_actor<M: Message>(
        &mut self,
        actor: ActorId,
        message: &M,
    ) -> Result<(), BastionError> {
        if self.disposed {
            return Err(BastionError::SessionDisposed);
        }
        let opcode = self.check_class::<M>(MessageClass::ActorMessage)?;
        let (_, payload) = self.registry.encode_payload(message)?;
        let bytes = envelope::encode(opcode, None, false, Some(actor), &payload)?;
        self.outbox.push_back(bytes);
        Ok(())
    }

    fn start_call<Req: Message, Resp: ResponseBody>(
        &mut self,
        class: MessageClass,
        actor: Option<ActorId>,
        request: &Req,
    ) -> Result<CallHandle<Resp>, BastionError> {
        if self.disposed {
            return Err(BastionError::SessionDisposed);
        }
        let opcode = self.check_class::<Req>(class)?;
        let response_opcode = self
            .registry
            .response_opcode(opcode)
            .ok_or(BastionError::TypeMismatch { opcode })?;
        let rpc = self.allocator.next_id();
        let (_, payload) = self.registry.encode_payload(request)?;
        let bytes = envelope::encode(opcode, Some(rpc), false, actor, &payload)?;

        let slot = Arc::new(Mutex::new(CallSlot {
            result: None,
            cancelled: false,
        }));
        self.pending.insert(rpc, PendingCall { slot: Arc::clone(&slot) });
        self.outbox.push_back(bytes);
        trace!(conn = %self.conn, rpc = %rpc, opcode = %opcode, "call started");
        Ok(CallHandle {
            slot,
            response_opcode,
            _marker: PhantomData,
        })
    }

    /// Issues a request and returns the handle its response resolves.
    pub fn call<Req: Message, Resp: ResponseBody>(
        &mut self,
        request: &Req,
    ) -> Result<CallHandle<Resp>, BastionError> {
        self.start_call(MessageClass::Request, None, request)
    }

    /// Issues an actor-addressed request.
    pub fn call_actor<Req: Message, Resp: ResponseBody>(
        &mut self,
        actor: ActorId,
        request: &Req,
    ) -> Result<CallHandle<Resp>, BastionError> {
        self.start_call(MessageClass::ActorRequest, Some(actor), request)
    }

    /// Answers a previously received request.
    pub fn reply<Resp: ResponseBody>(
        &mut self,
        rpc: RpcId,
        response: &Resp,
    ) -> Result<(), BastionError> {
        if self.disposed {
            return Err(BastionError::SessionDisposed);
        }
        let (opcode, payload) = self.registry.encode_payload(response)?;
        let bytes = envelope::encode(opcode, Some(rpc), true, None, &payload)?;
        self.outbox.push_back(bytes);
        Ok(())
    }

    /// Feeds one packet from the transport.
    ///
    /// Replies resolve their pending call and return `Ok(None)`. Anything
    /// else comes back decoded for the dispatcher. A reply with no matching
    /// pending call (already cancelled, or a duplicate) is dropped silently.
    pub fn handle_packet(&mut self, bytes: &[u8]) -> Result<Option<Inbound>, BastionError> {
        let registry = Arc::clone(&self.registry);
        let env = envelope::decode(bytes, |op| registry.has_actor_field(op))?;

        if env.is_reply {
            let Some(rpc) = env.rpc_id else {
                trace!(conn = %self.conn, opcode = %env.opcode, "reply without rpc id dropped");
                return Ok(None);
            };
            let Some(entry) = self.pending.remove(&rpc) else {
                trace!(conn = %self.conn, rpc = %rpc, "unmatched reply dropped");
                return Ok(None);
            };
            let outcome = registry
                .decode_payload(env.opcode, &env.payload)
                .and_then(|boxed| {
                    match registry.response_error_code(env.opcode, boxed.as_ref()) {
                        Some(code) if code != 0 => Err(BastionError::RpcFault { rpc, code }),
                        _ => Ok(boxed),
                    }
                });
            entry.slot.lock().complete(outcome);
            return Ok(None);
        }

        let class = registry
            .class(env.opcode)
            .ok_or(BastionError::UnknownOpcode { opcode: env.opcode })?;
        let message = registry.decode_payload(env.opcode, &env.payload)?;
        Ok(Some(Inbound {
            opcode: env.opcode,
            class,
            rpc_id: env.rpc_id,
            actor_id: env.actor_id,
            message,
        }))
    }

    /// Drops pending entries whose handles were cancelled. Called from the
    /// host's tick; keeps the table from accumulating abandoned calls.
    pub fn sweep_cancelled(&mut self) {
        self.pending.retain(|rpc, entry| {
            let cancelled = entry.slot.lock().cancelled;
            if cancelled {
                trace!(conn = %self.conn, rpc = %rpc, "cancelled call swept");
            }
            !cancelled
        });
    }

    /// Disposes the session: every pending call resolves with
    /// [`BastionError::SessionDisposed`] and further sends fail.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for (_, entry) in self.pending.drain() {
            entry.slot.lock().complete(Err(BastionError::SessionDisposed));
        }
        self.outbox.clear();
    }

    /// Whether [`Session::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}
