//! Opcode registry: the mapping between wire opcodes and Rust message types.
//!
//! Every message type that crosses the wire is registered exactly once,
//! explicitly, at startup. Registration records the message class (which
//! controls envelope shape and dispatch), the serializer (chosen by opcode
//! range), and for requests the opcode of their paired response.
//!
//! The registry is immutable after setup, so handlers on multiple threads can
//! share it behind an `Arc` without locking.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

use crate::network::codec;
use crate::{BastionError, Opcode};

/// Bound required of every wire message type.
pub trait Message: Any + Send + Debug + Serialize + DeserializeOwned {}

impl<T: Any + Send + Debug + Serialize + DeserializeOwned> Message for T {}

/// Bound for response bodies: they carry an application error code, where `0`
/// means success and anything else fails the pending call as an rpc fault.
pub trait ResponseBody: Message {
    /// The application-level error code of this response.
    fn error_code(&self) -> u32;
}

/// How a registered opcode participates in dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Fire-and-forget, addressed to the session itself.
    Plain,
    /// Expects a paired response; addressed to the session itself.
    Request,
    /// The response half of a request; routed by rpc id, never dispatched.
    Response,
    /// Fire-and-forget, addressed to an entity via actor id.
    ActorMessage,
    /// Expects a paired response; addressed to an entity via actor id.
    ActorRequest,
}

impl MessageClass {
    /// Whether envelopes of this class carry the 8-byte actor id field.
    #[must_use]
    pub fn has_actor_field(self) -> bool {
        matches!(self, MessageClass::ActorMessage | MessageClass::ActorRequest)
    }
}

/// Which serializer a payload uses, selected by opcode range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Compact fixed-int bincode; the default for game traffic.
    Binary,
    /// JSON, for opcodes in the diagnostic/tooling range.
    Text,
}

impl PayloadFormat {
    /// The format the given opcode's payload uses.
    #[must_use]
    pub fn for_opcode(opcode: Opcode) -> Self {
        if opcode.as_u16() >= Opcode::TEXT_RANGE_START {
            PayloadFormat::Text
        } else {
            PayloadFormat::Binary
        }
    }
}

type DecodeFn = Box<dyn Fn(&[u8], PayloadFormat) -> Result<Box<dyn Any + Send>, BastionError> + Send + Sync>;
type ErrorCodeFn = Box<dyn Fn(&dyn Any) -> Option<u32> + Send + Sync>;

struct OpcodeEntry {
    class: MessageClass,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
    /// For requests: the opcode their response arrives under.
    response_opcode: Option<Opcode>,
    /// For responses: extracts the application error code.
    error_code: Option<ErrorCodeFn>,
}

impl Debug for OpcodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeEntry")
            .field("class", &self.class)
            .field("type_name", &self.type_name)
            .field("response_opcode", &self.response_opcode)
            .finish_non_exhaustive()
    }
}

/// Immutable-after-setup table of every registered message type.
#[derive(Debug, Default)]
pub struct OpcodeRegistry {
    entries: HashMap<Opcode, OpcodeEntry>,
    by_type: HashMap<TypeId, Opcode>,
}

fn decode_with<M: Message>(bytes: &[u8], format: PayloadFormat) -> Result<Box<dyn Any + Send>, BastionError> {
    let value: M = match format {
        PayloadFormat::Binary => codec::decode(bytes)?,
        PayloadFormat::Text => serde_json::from_slice(bytes).map_err(|e| BastionError::Codec {
            context: format!("json decode {}: {}", type_name::<M>(), e),
        })?,
    };
    Ok(Box::new(value))
}

impl OpcodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert<M: Message>(
        &mut self,
        opcode: Opcode,
        class: MessageClass,
        response_opcode: Option<Opcode>,
        error_code: Option<ErrorCodeFn>,
    ) -> Result<(), BastionError> {
        let type_id = TypeId::of::<M>();
        if self.entries.contains_key(&opcode) || self.by_type.contains_key(&type_id) {
            return Err(BastionError::DuplicateRegistration { opcode });
        }
        self.entries.insert(
            opcode,
            OpcodeEntry {
                class,
                type_id,
                type_name: type_name::<M>(),
                decode: Box::new(decode_with::<M>),
                response_opcode,
                error_code,
            },
        );
        self.by_type.insert(type_id, opcode);
        Ok(())
    }

    /// Registers a fire-and-forget session message.
    pub fn register_plain<M: Message>(&mut self, opcode: Opcode) -> Result<(), BastionError> {
        self.insert::<M>(opcode, MessageClass::Plain, None, None)
    }

    /// Registers a session request together with its response type.
    pub fn register_request<Req: Message, Resp: ResponseBody>(
        &mut self,
        request: Opcode,
        response: Opcode,
    ) -> Result<(), BastionError> {
        self.insert::<Req>(request, MessageClass::Request, Some(response), None)?;
        self.insert::<Resp>(
            response,
            MessageClass::Response,
            None,
            Some(Box::new(|any| {
                any.downcast_ref::<Resp>().map(ResponseBody::error_code)
            })),
        )
    }

    /// Registers a fire-and-forget actor-addressed message.
    pub fn register_actor_message<M: Message>(&mut self, opcode: Opcode) -> Result<(), BastionError> {
        self.insert::<M>(opcode, MessageClass::ActorMessage, None, None)
    }

    /// Registers an actor-addressed request together with its response type.
    pub fn register_actor_request<Req: Message, Resp: ResponseBody>(
        &mut self,
        request: Opcode,
        response: Opcode,
    ) -> Result<(), BastionError> {
        self.insert::<Req>(request, MessageClass::ActorRequest, Some(response), None)?;
        self.insert::<Resp>(
            response,
            MessageClass::Response,
            None,
            Some(Box::new(|any| {
                any.downcast_ref::<Resp>().map(ResponseBody::error_code)
            })),
        )
    }

    /// The message class of `opcode`, if registered.
    #[must_use]
    pub fn class(&self, opcode: Opcode) -> Option<MessageClass> {
        self.entries.get(&opcode).map(|e| e.class)
    }

    /// Whether envelopes under `opcode` carry an actor id. Unregistered
    /// opcodes report `false`; the payload decode rejects them later.
    #[must_use]
    pub fn has_actor_field(&self, opcode: Opcode) -> bool {
        self.class(opcode).is_some_and(MessageClass::has_actor_field)
    }

    /// The registered type name for `opcode`, for logging.
    #[must_use]
    pub fn type_name(&self, opcode: Opcode) -> Option<&'static str> {
        self.entries.get(&opcode).map(|e| e.type_name)
    }

    /// The opcode a request's response arrives under.
    #[must_use]
    pub fn response_opcode(&self, request: Opcode) -> Option<Opcode> {
        self.entries.get(&request).and_then(|e| e.response_opcode)
    }

    /// The opcode registered for message type `M`.
    pub fn opcode_of<M: Message>(&self) -> Result<Opcode, BastionError> {
        self.by_type
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or_else(|| BastionError::Codec {
                context: format!("message type {} is not registered", type_name::<M>()),
            })
    }

    /// Serializes `value` with the format its opcode selects. Returns the
    /// opcode alongside the payload bytes.
    pub fn encode_payload<M: Message>(&self, value: &M) -> Result<(Opcode, Vec<u8>), BastionError> {
        let opcode = self.opcode_of::<M>()?;
        let bytes = match PayloadFormat::for_opcode(opcode) {
            PayloadFormat::Binary => codec::encode(value)?,
            PayloadFormat::Text => serde_json::to_vec(value).map_err(|e| BastionError::Codec {
                context: format!("json encode {}: {}", type_name::<M>(), e),
            })?,
        };
        Ok((opcode, bytes))
    }

    /// Deserializes a payload into the type registered for `opcode`.
    pub fn decode_payload(
        &self,
        opcode: Opcode,
        bytes: &[u8],
    ) -> Result<Box<dyn Any + Send>, BastionError> {
        let entry = self
            .entries
            .get(&opcode)
            .ok_or(BastionError::UnknownOpcode { opcode })?;
        (entry.decode)(bytes, PayloadFormat::for_opcode(opcode))
    }

    /// Extracts the application error code from a decoded response.
    ///
    /// Returns `None` if `opcode` is not a response or the value's type does
    /// not match the registration.
    #[must_use]
    pub fn response_error_code(&self, opcode: Opcode, value: &dyn Any) -> Option<u32> {
        self.entries
            .get(&opcode)
            .and_then(|e| e.error_code.as_ref())
            .and_then(|extract| extract(value))
    }

    /// Downcasts a decoded payload to its concrete type, verifying it against
    /// the registration for `opcode`.
    pub fn downcast<M: Message>(
        &self,
        opcode: Opcode,
        value: Box<dyn Any + Send>,
    ) -> Result<M, BastionError> {
        let entry = self
            .entries
            .get(&opcode)
            .ok_or(BastionError::UnknownOpcode { opcode })?;
        if entry.type_id != TypeId::of::<M>() {
            return Err(BastionError::TypeMismatch { opcode });
        }
        value
            .downcast::<M>()
            .map(|boxed| *boxed)
            .map_err(|_| BastionError::TypeMismatch { opcode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        nonce: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct MoveRequest {
        x: i32,
        y: i32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct MoveResponse {
        error: u32,
    }

    impl ResponseBody for MoveResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct DebugDump {
        detail: String,
    }

    const OP_PING: Opcode = Opcode::new(0x0101);
    const OP_MOVE_REQ: Opcode = Opcode::new(0x07D5);
    const OP_MOVE_RESP: Opcode = Opcode::new(0x07D6);
    const OP_DEBUG: Opcode = Opcode::new(0x6001);

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::new();
        reg.register_plain::<Ping>(OP_PING).unwrap();
        reg.register_request::<MoveRequest, MoveResponse>(OP_MOVE_REQ, OP_MOVE_RESP)
            .unwrap();
        reg.register_plain::<DebugDump>(OP_DEBUG).unwrap();
        reg
    }

    #[test]
    fn classes_and_pairing_recorded() {
        let reg = registry();
        assert_eq!(reg.class(OP_PING), Some(MessageClass::Plain));
        assert_eq!(reg.class(OP_MOVE_REQ), Some(MessageClass::Request));
        assert_eq!(reg.class(OP_MOVE_RESP), Some(MessageClass::Response));
        assert_eq!(reg.response_opcode(OP_MOVE_REQ), Some(OP_MOVE_RESP));
        assert_eq!(reg.response_opcode(OP_PING), None);
    }

    #[test]
    fn binary_payload_roundtrip() {
        let reg = registry();
        let (opcode, bytes) = reg.encode_payload(&MoveRequest { x: 3, y: -4 }).unwrap();
        assert_eq!(opcode, OP_MOVE_REQ);
        let decoded = reg.decode_payload(opcode, &bytes).unwrap();
        let value: MoveRequest = reg.downcast(opcode, decoded).unwrap();
        assert_eq!(value, MoveRequest { x: 3, y: -4 });
    }

    #[test]
    fn text_range_uses_json() {
        let reg = registry();
        let (opcode, bytes) = reg
            .encode_payload(&DebugDump {
                detail: "stack".into(),
            })
            .unwrap();
        assert_eq!(PayloadFormat::for_opcode(opcode), PayloadFormat::Text);
        assert!(std::str::from_utf8(&bytes).unwrap().contains("stack"));
        let decoded = reg.decode_payload(opcode, &bytes).unwrap();
        let value: DebugDump = reg.downcast(opcode, decoded).unwrap();
        assert_eq!(value.detail, "stack");
    }

    #[test]
    fn unknown_opcode_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.decode_payload(Opcode::new(0x0FFF), &[]),
            Err(BastionError::UnknownOpcode { .. })
        ));
    }

    #[test]
    fn duplicate_opcode_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.register_plain::<MoveResponse>(OP_PING),
            Err(BastionError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn duplicate_type_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.register_plain::<Ping>(Opcode::new(0x0999)),
            Err(BastionError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn wrong_downcast_is_type_mismatch() {
        let reg = registry();
        let (opcode, bytes) = reg.encode_payload(&Ping { nonce: 1 }).unwrap();
        let decoded = reg.decode_payload(opcode, &bytes).unwrap();
        let result: Result<MoveRequest, _> = reg.downcast(opcode, decoded);
        assert!(matches!(result, Err(BastionError::TypeMismatch { .. })));
    }

    #[test]
    fn response_error_code_extracted() {
        let reg = registry();
        let response = MoveResponse { error: 7 };
        assert_eq!(
            reg.response_error_code(OP_MOVE_RESP, &response),
            Some(7)
        );
        assert_eq!(reg.response_error_code(OP_PING, &response), None);
    }

    #[test]
    fn actor_field_only_for_actor_classes() {
        let mut reg = registry();

        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Poke;
        reg.register_actor_message::<Poke>(Opcode::new(0x0301)).unwrap();

        assert!(reg.has_actor_field(Opcode::new(0x0301)));
        assert!(!reg.has_actor_field(OP_PING));
        assert!(!reg.has_actor_field(Opcode::new(0x0FFF)));
    }
}
