//! Circular receive buffer and length-prefixed packet framing.
//!
//! KCP hands the channel a clean byte stream, but consumers want whole
//! messages. [`RingBuffer`] decouples network arrival cadence from consumption
//! cadence; [`PacketParser`] pulls length-prefixed frames out of it, emitting a
//! packet only once its full declared length is buffered.
//!
//! Frame layout: `[len: u32 LE][len bytes of payload]`.

use crate::BastionError;

/// Default chunk size for the ring's backing segments.
const CHUNK_SIZE: usize = 8 * 1024;

/// Maximum packet body length the parser will accept. A declared length above
/// this is treated as stream corruption and is fatal to the channel.
pub const MAX_PACKET_LEN: usize = 1 << 20;

/// A growable circular byte buffer.
///
/// Backed by a list of fixed-size chunks so that sustained traffic reuses
/// segments instead of reallocating, while bursts can still grow the ring.
#[derive(Debug, Default)]
pub struct RingBuffer {
    chunks: std::collections::VecDeque<Box<[u8; CHUNK_SIZE]>>,
    /// Read offset into the front chunk.
    first_index: usize,
    /// Write offset into the back chunk.
    last_index: usize,
    /// Spare chunk kept for reuse after a full chunk is drained.
    spare: Option<Box<[u8; CHUNK_SIZE]>>,
}

impl RingBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of readable bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.chunks.len() {
            0 => 0,
            1 => self.last_index - self.first_index,
            n => (n - 1) * CHUNK_SIZE + self.last_index - self.first_index,
        }
    }

    /// Returns `true` if no bytes are readable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_chunk(&mut self) {
        let chunk = self
            .spare
            .take()
            .unwrap_or_else(|| Box::new([0u8; CHUNK_SIZE]));
        self.chunks.push_back(chunk);
        self.last_index = 0;
    }

    /// Appends `data` to the buffer.
    pub fn write(&mut self, data: &[u8]) {
        let mut remaining = data;
        while !remaining.is_empty() {
            if self.chunks.is_empty() || self.last_index == CHUNK_SIZE {
                self.add_chunk();
            }
            let back = match self.chunks.back_mut() {
                Some(chunk) => chunk,
                None => return, // unreachable: add_chunk above guarantees a chunk
            };
            let space = CHUNK_SIZE - self.last_index;
            let take = space.min(remaining.len());
            back[self.last_index..self.last_index + take].copy_from_slice(&remaining[..take]);
            self.last_index += take;
            remaining = &remaining[take..];
        }
    }

    /// Reads exactly `out.len()` bytes into `out`. Returns `false` (and reads
    /// nothing) if fewer bytes are buffered.
    pub fn read_exact(&mut self, out: &mut [u8]) -> bool {
        if self.len() < out.len() {
            return false;
        }
        let mut written = 0;
        while written < out.len() {
            let is_last_chunk = self.chunks.len() == 1;
            let chunk_end = if is_last_chunk { self.last_index } else { CHUNK_SIZE };
            let front = match self.chunks.front() {
                Some(chunk) => chunk,
                None => return false, // unreachable: len() check above
            };
            let available = chunk_end - self.first_index;
            let take = available.min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&front[self.first_index..self.first_index + take]);
            self.first_index += take;
            written += take;
            if self.first_index == chunk_end {
                if let Some(drained) = self.chunks.pop_front() {
                    self.spare = Some(drained);
                }
                self.first_index = 0;
                if self.chunks.is_empty() {
                    self.last_index = 0;
                }
            }
        }
        true
    }
}

/// Parser state: reading the 4-byte length prefix or the packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Length,
    Body(usize),
}

/// Extracts length-prefixed packets from a [`RingBuffer`].
#[derive(Debug)]
pub struct PacketParser {
    state: ParseState,
    max_len: usize,
}

impl Default for PacketParser {
    fn default() -> Self {
        PacketParser {
            state: ParseState::Length,
            max_len: MAX_PACKET_LEN,
        }
    }
}

impl PacketParser {
    /// Creates a parser with the default packet-size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames `payload` for the wire: length prefix followed by the body.
    pub fn frame(payload: &[u8]) -> Result<Vec<u8>, BastionError> {
        if payload.len() > MAX_PACKET_LEN {
            return Err(BastionError::PacketTooLarge {
                len: payload.len(),
                max: MAX_PACKET_LEN,
            });
        }
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(payload);
        Ok(framed)
    }

    /// Tries to pull the next complete packet out of `buffer`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame. A
    /// declared length above the limit is unrecoverable for this stream.
    pub fn parse(&mut self, buffer: &mut RingBuffer) -> Result<Option<Vec<u8>>, BastionError> {
        loop {
            match self.state {
                ParseState::Length => {
                    let mut prefix = [0u8; 4];
                    if !buffer.read_exact(&mut prefix) {
                        return Ok(None);
                    }
                    let len = u32::from_le_bytes(prefix) as usize;
                    if len > self.max_len {
                        return Err(BastionError::PacketTooLarge {
                            len,
                            max: self.max_len,
                        });
                    }
                    self.state = ParseState::Body(len);
                }
                ParseState::Body(len) => {
                    if buffer.len() < len {
                        return Ok(None);
                    }
                    let mut body = vec![0u8; len];
                    buffer.read_exact(&mut body);
                    self.state = ParseState::Length;
                    return Ok(Some(body));
                }
            }
        }
    }
}
