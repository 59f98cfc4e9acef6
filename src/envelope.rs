//! Wire envelope wrapping every application message.
//!
//! Layout, little endian throughout:
//!
//! ```text
//! [opcode u16][rpc u32][actor_id i64 (only for actor-addressed opcodes)][payload...]
//! ```
//!
//! The `rpc` word packs three things: bit 31 marks a reply, bit 30 marks a
//! compressed payload, and the low 30 bits are the rpc correlation id (`0`
//! means the message is not part of a call).
//!
//! Whether the actor id field is present depends on the opcode's message
//! class, which only the [`crate::registry::OpcodeRegistry`] knows. The
//! decoder therefore takes a lookup closure instead of depending on the
//! registry directly.
//!
//! Payloads longer than [`COMPRESS_THRESHOLD`] are run-length encoded when
//! that actually shrinks them; the compressed bit tells the receiver which
//! form it got.

use crate::{rle, ActorId, BastionError, Opcode, RpcId};

/// Reply marker bit in the rpc word.
const FLAG_REPLY: u32 = 1 << 31;

/// Compressed-payload marker bit in the rpc word.
const FLAG_COMPRESSED: u32 = 1 << 30;

/// Mask selecting the rpc correlation id.
const RPC_MASK: u32 = FLAG_COMPRESSED - 1;

/// Payloads at or below this many bytes are never compressed.
pub const COMPRESS_THRESHOLD: usize = 100;

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type tag.
    pub opcode: Opcode,
    /// Correlation id; `None` when the message is not part of a call.
    pub rpc_id: Option<RpcId>,
    /// Whether this is the response half of a call.
    pub is_reply: bool,
    /// Destination entity, present only for actor-addressed opcodes.
    pub actor_id: Option<ActorId>,
    /// Decompressed message payload.
    pub payload: Vec<u8>,
}

/// Encodes an envelope into wire bytes.
///
/// `rpc_id` must fit in 30 bits; the allocator never exceeds that within a
/// process lifetime, but ids from elsewhere are validated here.
pub fn encode(
    opcode: Opcode,
    rpc_id: Option<RpcId>,
    is_reply: bool,
    actor_id: Option<ActorId>,
    payload: &[u8],
) -> Result<Vec<u8>, BastionError> {
    let rpc_raw = rpc_id.map_or(0, RpcId::as_u32);
    if rpc_raw & !RPC_MASK != 0 {
        return Err(BastionError::Codec {
            context: format!("rpc id {} exceeds 30 bits", rpc_raw),
        });
    }
    let mut word = rpc_raw;
    if is_reply {
        word |= FLAG_REPLY;
    }

    let mut body: &[u8] = payload;
    let compressed;
    if payload.len() > COMPRESS_THRESHOLD {
        compressed = rle::encode(payload);
        if compressed.len() < payload.len() {
            word |= FLAG_COMPRESSED;
            body = &compressed;
        }
    }

    let mut out = Vec::with_capacity(2 + 4 + 8 + body.len());
    out.extend_from_slice(&opcode.as_u16().to_le_bytes());
    out.extend_from_slice(&word.to_le_bytes());
    if let Some(actor) = actor_id {
        out.extend_from_slice(&actor.as_i64().to_le_bytes());
    }
    out.extend_from_slice(body);
    Ok(out)
}

/// Decodes wire bytes into an [`Envelope`].
///
/// `has_actor_field` reports whether the given opcode carries an actor id;
/// unknown opcodes must be rejected by the closure's caller before payload
/// decoding, but the envelope itself decodes with `false`.
pub fn decode(
    bytes: &[u8],
    has_actor_field: impl FnOnce(Opcode) -> bool,
) -> Result<Envelope, BastionError> {
    if bytes.len() < 6 {
        return Err(BastionError::Codec {
            context: format!("envelope shorter than header: {} bytes", bytes.len()),
        });
    }
    let opcode = Opcode::new(u16::from_le_bytes([bytes[0], bytes[1]]));
    let word = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let is_reply = word & FLAG_REPLY != 0;
    let is_compressed = word & FLAG_COMPRESSED != 0;
    let rpc_raw = word & RPC_MASK;
    let rpc_id = (rpc_raw != 0).then(|| RpcId::new(rpc_raw));

    let mut pos = 6;
    let actor_id = if has_actor_field(opcode) {
        let end = pos + 8;
        let raw = bytes.get(pos..end).ok_or_else(|| BastionError::Codec {
            context: format!("envelope for {} missing actor id", opcode),
        })?;
        pos = end;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Some(ActorId::new(i64::from_le_bytes(buf)))
    } else {
        None
    };

    let body = &bytes[pos..];
    let payload = if is_compressed {
        rle::decode(body).map_err(|e| BastionError::Codec {
            context: format!("envelope payload decompress: {}", e),
        })?
    } else {
        body.to_vec()
    };

    Ok(Envelope {
        opcode,
        rpc_id,
        is_reply,
        actor_id,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_roundtrips() {
        let bytes = encode(Opcode::new(0x0101), None, false, None, b"payload").unwrap();
        let envelope = decode(&bytes, |_| false).unwrap();
        assert_eq!(envelope.opcode, Opcode::new(0x0101));
        assert_eq!(envelope.rpc_id, None);
        assert!(!envelope.is_reply);
        assert_eq!(envelope.actor_id, None);
        assert_eq!(envelope.payload, b"payload");
    }

    #[test]
    fn request_and_reply_flags() {
        let rpc = Some(RpcId::new(77));
        let request = encode(Opcode::new(0x07D5), rpc, false, None, b"req").unwrap();
        let reply = encode(Opcode::new(0x07D6), rpc, true, None, b"resp").unwrap();

        let decoded_req = decode(&request, |_| false).unwrap();
        assert_eq!(decoded_req.rpc_id, rpc);
        assert!(!decoded_req.is_reply);

        let decoded_reply = decode(&reply, |_| false).unwrap();
        assert_eq!(decoded_reply.rpc_id, rpc);
        assert!(decoded_reply.is_reply);
    }

    #[test]
    fn actor_id_present_only_for_actor_opcodes() {
        let actor = Some(ActorId::new(-12345));
        let bytes = encode(Opcode::new(0x0200), None, false, actor, b"x").unwrap();
        let envelope = decode(&bytes, |op| op == Opcode::new(0x0200)).unwrap();
        assert_eq!(envelope.actor_id, actor);
        assert_eq!(envelope.payload, b"x");
    }

    #[test]
    fn missing_actor_id_rejected() {
        // Header only, but the opcode claims an actor field.
        let bytes = encode(Opcode::new(0x0200), None, false, None, b"").unwrap();
        assert!(matches!(
            decode(&bytes, |_| true),
            Err(BastionError::Codec { .. })
        ));
    }

    #[test]
    fn large_compressible_payload_is_compressed() {
        let payload = vec![0u8; 5000];
        let bytes = encode(Opcode::new(0x0101), None, false, None, &payload).unwrap();
        assert!(bytes.len() < payload.len(), "compression should kick in");
        let envelope = decode(&bytes, |_| false).unwrap();
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn incompressible_payload_sent_raw() {
        let payload: Vec<u8> = (0..200u32).map(|i| (i * 7 % 251) as u8).collect();
        let bytes = encode(Opcode::new(0x0101), None, false, None, &payload).unwrap();
        assert_eq!(bytes.len(), 6 + payload.len());
        let envelope = decode(&bytes, |_| false).unwrap();
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn small_payload_never_compressed() {
        let payload = vec![0u8; COMPRESS_THRESHOLD];
        let bytes = encode(Opcode::new(0x0101), None, false, None, &payload).unwrap();
        assert_eq!(bytes.len(), 6 + payload.len());
    }

    #[test]
    fn zero_rpc_id_means_no_call() {
        let bytes = encode(Opcode::new(0x0101), None, false, None, b"").unwrap();
        let envelope = decode(&bytes, |_| false).unwrap();
        assert_eq!(envelope.rpc_id, None);
    }

    #[test]
    fn oversized_rpc_id_rejected() {
        let result = encode(
            Opcode::new(0x0101),
            Some(RpcId::new(1 << 30)),
            false,
            None,
            b"",
        );
        assert!(matches!(result, Err(BastionError::Codec { .. })));
    }

    #[test]
    fn runt_envelope_rejected() {
        assert!(matches!(
            decode(&[1, 2, 3], |_| false),
            Err(BastionError::Codec { .. })
        ));
    }

    #[test]
    fn corrupt_compressed_payload_rejected() {
        let payload = vec![0u8; 5000];
        let mut bytes = encode(Opcode::new(0x0101), None, false, None, &payload).unwrap();
        let last = bytes.len() - 1;
        bytes.truncate(last); // chop the compressed stream
        assert!(matches!(
            decode(&bytes, |_| false),
            Err(BastionError::Codec { .. })
        ));
    }
}
