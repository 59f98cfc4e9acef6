//! Run-length payload compression.
//!
//! The message envelope may substitute a payload with a compressed form when
//! the payload exceeds a size threshold and the compressed form is strictly
//! smaller (see [`crate::envelope`]). Game payloads are dominated by runs of
//! identical bytes (zeroed option fields, default-valued structs), which a
//! byte-level RLE handles well without pulling in a general-purpose
//! compression dependency.
//!
//! # Format
//!
//! The encoded stream is a sequence of segments, each starting with a varint
//! header `h`:
//!
//! - `h` even: a run; `h / 2` is the run length, followed by the single byte
//!   to repeat.
//! - `h` odd: a literal; `(h - 1) / 2` is the literal length, followed by that
//!   many raw bytes.
//!
//! Runs shorter than four bytes are folded into literals since the header
//! overhead would outweigh the saving.

use std::fmt;

/// Minimum repeat length worth encoding as a run.
const MIN_RUN: usize = 4;

/// Why an RLE decode failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RleDecodeError {
    /// A varint header continued past the end of the input.
    TruncatedHeader,
    /// A segment declared more bytes than the input contains.
    TruncatedSegment,
    /// The declared output size exceeds the decode limit.
    OutputTooLarge {
        /// The declared total output length so far.
        declared: usize,
        /// The configured decode limit.
        limit: usize,
    },
}

impl fmt::Display for RleDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RleDecodeError::TruncatedHeader => write!(f, "rle header truncated"),
            RleDecodeError::TruncatedSegment => write!(f, "rle segment truncated"),
            RleDecodeError::OutputTooLarge { declared, limit } => {
                write!(f, "rle output {} exceeds limit {}", declared, limit)
            }
        }
    }
}

impl std::error::Error for RleDecodeError {}

/// Upper bound on decoded output, guarding against malicious headers.
pub const MAX_DECODED_LEN: usize = 1 << 24;

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, RleDecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf.get(*pos).ok_or(RleDecodeError::TruncatedHeader)?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(RleDecodeError::TruncatedHeader);
        }
    }
}

fn flush_literal(out: &mut Vec<u8>, literal: &mut Vec<u8>) {
    if literal.is_empty() {
        return;
    }
    write_varint(out, (literal.len() as u64) * 2 + 1);
    out.append(literal);
}

/// Encodes `data` into the RLE stream format.
#[must_use]
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 8);
    let mut literal: Vec<u8> = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let mut run = 1;
        while i + run < data.len() && data[i + run] == byte {
            run += 1;
        }
        if run >= MIN_RUN {
            flush_literal(&mut out, &mut literal);
            write_varint(&mut out, (run as u64) * 2);
            out.push(byte);
        } else {
            literal.extend(std::iter::repeat(byte).take(run));
        }
        i += run;
    }
    flush_literal(&mut out, &mut literal);
    out
}

/// Decodes an RLE stream produced by [`encode`].
///
/// Rejects streams whose declared output exceeds [`MAX_DECODED_LEN`].
pub fn decode(data: &[u8]) -> Result<Vec<u8>, RleDecodeError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut pos = 0;
    while pos < data.len() {
        let header = read_varint(data, &mut pos)?;
        let len = (header >> 1) as usize;
        if out.len() + len > MAX_DECODED_LEN {
            return Err(RleDecodeError::OutputTooLarge {
                declared: out.len() + len,
                limit: MAX_DECODED_LEN,
            });
        }
        if header & 1 == 0 {
            // Run segment.
            let byte = *data.get(pos).ok_or(RleDecodeError::TruncatedSegment)?;
            pos += 1;
            out.extend(std::iter::repeat(byte).take(len));
        } else {
            let end = pos + len;
            let segment = data
                .get(pos..end)
                .ok_or(RleDecodeError::TruncatedSegment)?;
            out.extend_from_slice(segment);
            pos = end;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_empty() {
        assert_eq!(decode(&encode(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn roundtrip_runs_and_literals() {
        let data = [
            vec![0u8; 100],
            vec![1, 2, 3],
            vec![0xFF; 37],
            vec![9, 9],
        ]
        .concat();
        let encoded = encode(&data);
        assert!(encoded.len() < data.len());
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn incompressible_data_roundtrips() {
        let data: Vec<u8> = (0..=255).collect();
        let encoded = encode(&data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn short_runs_folded_into_literals() {
        // Three repeats are below MIN_RUN, so the whole input is one literal.
        let data = [5u8, 5, 5, 7];
        let encoded = encode(&data);
        assert_eq!(encoded[0], 4 * 2 + 1);
        assert_eq!(&encoded[1..], &data);
    }

    #[test]
    fn truncated_header_rejected() {
        assert_eq!(decode(&[0x80]), Err(RleDecodeError::TruncatedHeader));
    }

    #[test]
    fn truncated_run_rejected() {
        // Run of 4, but the repeated byte is missing.
        assert_eq!(decode(&[8]), Err(RleDecodeError::TruncatedSegment));
    }

    #[test]
    fn truncated_literal_rejected() {
        // Literal of 4, only 2 bytes present.
        assert_eq!(decode(&[9, 1, 2]), Err(RleDecodeError::TruncatedSegment));
    }

    #[test]
    fn oversized_output_rejected() {
        let mut stream = Vec::new();
        write_varint(&mut stream, (MAX_DECODED_LEN as u64 + 1) * 2);
        stream.push(0);
        assert!(matches!(
            decode(&stream),
            Err(RleDecodeError::OutputTooLarge { .. })
        ));
    }
}
