//! Message dispatch: one switch from decoded packet to typed handler.
//!
//! The [`Dispatcher`] owns a handler per opcode, registered against the same
//! [`OpcodeRegistry`] the session decodes with. Dispatch never panics on bad
//! traffic: a missing handler, a class mismatch or a failed downcast is
//! logged at the boundary and the packet is dropped, because a remote peer
//! must not be able to take the process down with one crafted message.
//!
//! Request handlers return their response value and the dispatcher sends the
//! reply itself, so a handler cannot forget to answer and leave the caller's
//! pending entry dangling.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::registry::{Message, MessageClass, OpcodeRegistry, ResponseBody};
use crate::session::{Inbound, Session};
use crate::{ActorId, BastionError, Opcode};

type Handler = Box<dyn FnMut(&mut Session, Inbound) + Send>;

/// Routes decoded inbound messages to registered typed handlers.
pub struct Dispatcher {
    registry: Arc<OpcodeRegistry>,
    handlers: HashMap<Opcode, Handler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over the given registry.
    #[must_use]
    pub fn new(registry: Arc<OpcodeRegistry>) -> Self {
        Dispatcher {
            registry,
            handlers: HashMap::new(),
        }
    }

    fn insert(&mut self, opcode: Opcode, handler: Handler) -> Result<(), BastionError> {
        if self.handlers.contains_key(&opcode) {
            return Err(BastionError::DuplicateRegistration { opcode });
        }
        self.handlers.insert(opcode, handler);
        Ok(())
    }

    fn checked_opcode<M: Message>(&self, expected: MessageClass) -> Result<Opcode, BastionError> {
        let opcode = self.registry.opcode_of::<M>()?;
        match self.registry.class(opcode) {
            Some(class) if class == expected => Ok(opcode),
            _ => Err(BastionError::TypeMismatch { opcode }),
        }
    }

    /// Registers a handler for a plain session message.
    pub fn on_message<M, F>(&mut self, mut handler: F) -> Result<(), BastionError>
    where
        M: Message,
        F: FnMut(&mut Session, M) + Send + 'static,
    {
        let opcode = self.checked_opcode::<M>(MessageClass::Plain)?;
        let registry = Arc::clone(&self.registry);
        self.insert(
            opcode,
            Box::new(move |session, inbound| {
                match registry.downcast::<M>(inbound.opcode, inbound.message) {
                    Ok(message) => handler(session, message),
                    Err(e) => warn!(opcode = %inbound.opcode, error = %e, "dropping message"),
                }
            }),
        )
    }

    /// Registers a handler for a session request. The returned response is
    /// sent back under the caller's rpc id; encode application failures in
    /// the response's error code.
    pub fn on_request<Req, Resp, F>(&mut self, mut handler: F) -> Result<(), BastionError>
    where
        Req: Message,
        Resp: ResponseBody,
        F: FnMut(&mut Session, Req) -> Resp + Send + 'static,
    {
        let opcode = self.checked_opcode::<Req>(MessageClass::Request)?;
        let registry = Arc::clone(&self.registry);
        self.insert(
            opcode,
            Box::new(move |session, inbound| {
                let Some(rpc) = inbound.rpc_id else {
                    warn!(opcode = %inbound.opcode, "request without rpc id dropped");
                    return;
                };
                match registry.downcast::<Req>(inbound.opcode, inbound.message) {
                    Ok(request) => {
                        let response = handler(session, request);
                        if let Err(e) = session.reply(rpc, &response) {
                            warn!(rpc = %rpc, error = %e, "reply failed");
                        }
                    }
                    Err(e) => warn!(opcode = %inbound.opcode, error = %e, "dropping request"),
                }
            }),
        )
    }

    /// Registers a handler for an actor-addressed message.
    pub fn on_actor_message<M, F>(&mut self, mut handler: F) -> Result<(), BastionError>
    where
        M: Message,
        F: FnMut(&mut Session, ActorId, M) + Send + 'static,
    {
        let opcode = self.checked_opcode::<M>(MessageClass::ActorMessage)?;
        let registry = Arc::clone(&self.registry);
        self.insert(
            opcode,
            Box::new(move |session, inbound| {
                let Some(actor) = inbound.actor_id else {
                    warn!(opcode = %inbound.opcode, "actor message without actor id dropped");
                    return;
                };
                match registry.downcast::<M>(inbound.opcode, inbound.message) {
                    Ok(message) => handler(session, actor, message),
                    Err(e) => warn!(opcode = %inbound.opcode, error = %e, "dropping actor message"),
                }
            }),
        )
    }

    /// Registers a handler for an actor-addressed request.
    pub fn on_actor_request<Req, Resp, F>(&mut self, mut handler: F) -> Result<(), BastionError>
    where
        Req: Message,
        Resp: ResponseBody,
        F: FnMut(&mut Session, ActorId, Req) -> Resp + Send + 'static,
    {
        let opcode = self.checked_opcode::<Req>(MessageClass::ActorRequest)?;
        let registry = Arc::clone(&self.registry);
        self.insert(
            opcode,
            Box::new(move |session, inbound| {
                let Some(rpc) = inbound.rpc_id else {
                    warn!(opcode = %inbound.opcode, "actor request without rpc id dropped");
                    return;
                };
                let Some(actor) = inbound.actor_id else {
                    warn!(opcode = %inbound.opcode, "actor request without actor id dropped");
                    return;
                };
                match registry.downcast::<Req>(inbound.opcode, inbound.message) {
                    Ok(request) => {
                        let response = handler(session, actor, request);
                        if let Err(e) = session.reply(rpc, &response) {
                            warn!(rpc = %rpc, error = %e, "reply failed");
                        }
                    }
                    Err(e) => warn!(opcode = %inbound.opcode, error = %e, "dropping actor request"),
                }
            }),
        )
    }

    /// Routes one inbound message to its handler. Unhandled traffic is logged
    /// and dropped, never an error: the connection stays healthy.
    pub fn dispatch(&mut self, session: &mut Session, inbound: Inbound) {
        if inbound.class == MessageClass::Response {
            // Responses resolve pending calls inside the session and should
            // never surface here.
            warn!(opcode = %inbound.opcode, "stray response reached dispatch");
            return;
        }
        match self.handlers.get_mut(&inbound.opcode) {
            Some(handler) => handler(session, inbound),
            None => warn!(opcode = %inbound.opcode, "no handler registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RpcIdAllocator;
    use crate::{envelope, ConnectionId};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        nonce: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct AddRequest {
        a: i32,
        b: i32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct AddResponse {
        error: u32,
        sum: i32,
    }

    impl ResponseBody for AddResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Nudge {
        amount: i32,
    }

    const OP_PING: Opcode = Opcode::new(0x0101);
    const OP_ADD_REQ: Opcode = Opcode::new(0x0102);
    const OP_ADD_RESP: Opcode = Opcode::new(0x0103);
    const OP_NUDGE: Opcode = Opcode::new(0x0301);

    fn registry() -> Arc<OpcodeRegistry> {
        let mut reg = OpcodeRegistry::new();
        reg.register_plain::<Ping>(OP_PING).unwrap();
        reg.register_request::<AddRequest, AddResponse>(OP_ADD_REQ, OP_ADD_RESP)
            .unwrap();
        reg.register_actor_message::<Nudge>(OP_NUDGE).unwrap();
        Arc::new(reg)
    }

    fn session(reg: &Arc<OpcodeRegistry>) -> Session {
        Session::new(
            ConnectionId::new(1000),
            Arc::clone(reg),
            RpcIdAllocator::new(),
        )
    }

    #[test]
    fn plain_handler_invoked() {
        let reg = registry();
        let mut dispatcher = Dispatcher::new(Arc::clone(&reg));
        static SEEN: AtomicU64 = AtomicU64::new(0);
        dispatcher
            .on_message(|_session, ping: Ping| {
                SEEN.store(ping.nonce, Ordering::SeqCst);
            })
            .unwrap();

        let mut sender = session(&reg);
        sender.send(&Ping { nonce: 42 }).unwrap();
        let bytes = sender.take_outgoing().remove(0);

        let mut receiver = session(&reg);
        let inbound = receiver.handle_packet(&bytes).unwrap().unwrap();
        dispatcher.dispatch(&mut receiver, inbound);
        assert_eq!(SEEN.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn request_handler_auto_replies() {
        let reg = registry();
        let mut dispatcher = Dispatcher::new(Arc::clone(&reg));
        dispatcher
            .on_request(|_session, req: AddRequest| AddResponse {
                error: 0,
                sum: req.a + req.b,
            })
            .unwrap();

        let mut caller = session(&reg);
        let handle = caller
            .call::<AddRequest, AddResponse>(&AddRequest { a: 2, b: 3 })
            .unwrap();
        let request_bytes = caller.take_outgoing().remove(0);

        let mut server = session(&reg);
        let inbound = server.handle_packet(&request_bytes).unwrap().unwrap();
        dispatcher.dispatch(&mut server, inbound);

        let reply_bytes = server.take_outgoing().remove(0);
        caller.handle_packet(&reply_bytes).unwrap();
        let response = handle.try_take().unwrap().unwrap();
        assert_eq!(response.sum, 5);
    }

    #[test]
    fn actor_message_handler_gets_actor_id() {
        let reg = registry();
        let mut dispatcher = Dispatcher::new(Arc::clone(&reg));
        static TARGET: AtomicU64 = AtomicU64::new(0);
        dispatcher
            .on_actor_message(|_session, actor: ActorId, _nudge: Nudge| {
                TARGET.store(actor.as_i64() as u64, Ordering::SeqCst);
            })
            .unwrap();

        let mut sender = session(&reg);
        sender
            .send_to_actor(ActorId::new(777), &Nudge { amount: 1 })
            .unwrap();
        let bytes = sender.take_outgoing().remove(0);

        let mut receiver = session(&reg);
        let inbound = receiver.handle_packet(&bytes).unwrap().unwrap();
        dispatcher.dispatch(&mut receiver, inbound);
        assert_eq!(TARGET.load(Ordering::SeqCst), 777);
    }

    #[test]
    fn duplicate_handler_rejected() {
        let reg = registry();
        let mut dispatcher = Dispatcher::new(Arc::clone(&reg));
        dispatcher.on_message(|_, _: Ping| {}).unwrap();
        assert!(matches!(
            dispatcher.on_message(|_, _: Ping| {}),
            Err(BastionError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn wrong_class_registration_rejected() {
        let reg = registry();
        let mut dispatcher = Dispatcher::new(Arc::clone(&reg));
        // AddRequest is a request, not a plain message.
        assert!(matches!(
            dispatcher.on_message(|_, _: AddRequest| {}),
            Err(BastionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unhandled_message_is_dropped_quietly() {
        let reg = registry();
        let mut dispatcher = Dispatcher::new(Arc::clone(&reg));
        let mut receiver = session(&reg);
        let bytes = envelope::encode(OP_PING, None, false, None, &crate::network::codec::encode(&Ping { nonce: 1 }).unwrap()).unwrap();
        let inbound = receiver.handle_packet(&bytes).unwrap().unwrap();
        // No handler registered; must not panic.
        dispatcher.dispatch(&mut receiver, inbound);
    }
}
