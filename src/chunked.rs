//! Chunked HTTP transfer decoding for NTRIP 2.0 data streams

use crate::NtripError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ChunkState {
    /// Start of a chunk: reset the size accumulator.
    SizeStart,
    /// Accumulating hex size digits.
    SizeDigits,
    /// Size line seen, expecting `\n`.
    Lf,
    /// Copying `size` payload bytes through.
    Body,
    /// Skipping a `;ext` chunk extension until `\r`.
    Extension,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// Feed it reads in whatever pieces the socket delivers; output is identical
/// for any partition of the same byte stream. A framing violation is
/// unrecoverable: data integrity is lost, the session must not reconnect.
pub struct ChunkDecoder {
    state: ChunkState,
    size: usize,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeStart,
            size: 0,
        }
    }

    /// Decode `input`, appending payload bytes to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), NtripError> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ChunkState::SizeStart => {
                    self.size = 0;
                    self.state = ChunkState::SizeDigits;
                }
                ChunkState::SizeDigits => {
                    let b = input[pos];
                    pos += 1;
                    match b {
                        b'0'..=b'9' => self.push_digit(b - b'0'),
                        b'a'..=b'f' => self.push_digit(b - b'a' + 10),
                        b'A'..=b'F' => self.push_digit(b - b'A' + 10),
                        b'\r' => self.state = ChunkState::Lf,
                        b';' => self.state = ChunkState::Extension,
                        _ => return Err(NtripError::ChunkFraming),
                    }
                }
                ChunkState::Lf => {
                    if input[pos] != b'\n' {
                        return Err(NtripError::ChunkFraming);
                    }
                    pos += 1;
                    self.state = if self.size > 0 {
                        ChunkState::Body
                    } else {
                        // final chunk: the stream ends cleanly
                        ChunkState::SizeStart
                    };
                }
                ChunkState::Body => {
                    let take = (input.len() - pos).min(self.size);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.size -= take;
                    if self.size == 0 {
                        self.state = ChunkState::SizeStart;
                    }
                }
                ChunkState::Extension => {
                    if input[pos] == b'\r' {
                        self.state = ChunkState::Lf;
                    }
                    pos += 1;
                }
            }
        }

        Ok(())
    }

    fn push_digit(&mut self, digit: u8) {
        self.size = self.size.saturating_mul(16).saturating_add(digit as usize);
    }
}
