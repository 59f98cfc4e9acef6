//! Binary codec shared by the wire layers.
//!
//! Centralizes the bincode configuration so every encode/decode in the crate
//! uses the same deterministic settings: `standard()` with fixed-int encoding.
//! Fixed-size integers keep message sizes stable, which matters both for MTU
//! budgeting in the transport and for byte-identical comparison of lockstep
//! input sets.

use serde::{de::DeserializeOwned, Serialize};

use crate::BastionError;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BastionError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| BastionError::Codec {
        context: format!("bincode encode: {}", e),
    })
}

/// Decodes a value from a byte slice. The whole slice must be consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BastionError> {
    let (value, read) =
        bincode::serde::decode_from_slice(bytes, config()).map_err(|e| BastionError::Codec {
            context: format!("bincode decode: {}", e),
        })?;
    if read != bytes.len() {
        return Err(BastionError::Codec {
            context: format!(
                "bincode decode consumed {} of {} bytes",
                read,
                bytes.len()
            ),
        });
    }
    Ok(value)
}
