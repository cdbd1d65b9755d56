//! NMEA GGA sentence recognition on the serial return path
//!
//! Bytes read back from the GNSS receiver are scanned for `$GPGGA,` fix
//! sentences; completed sentences are uploaded to the caster so it can serve
//! a location-dependent stream.

const PREFIX: &[u8] = b"$GPGGA,";

/// Longest sentence accepted before the scanner gives up on it.
const MAX_SENTENCE: usize = 190;

/// Byte-level recogniser for `$GPGGA,` sentences.
///
/// A sentence is complete on `\r`, `\n`, or three characters past the `*`
/// that starts the checksum; the completed sentence is returned with `\r\n`
/// appended, ready for the control socket.
///
/// A `$` in the middle of a sentence resets the scan and is re-examined as a
/// potential sentence start. Receivers that emit a literal `$` inside a field
/// will therefore lose that sentence; this matches the upload format, which
/// has no escaping for it.
#[derive(Default)]
pub struct NmeaScanner {
    buf: Vec<u8>,
    star: Option<usize>,
}

impl NmeaScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a completed sentence when one ends here.
    pub fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < PREFIX.len() {
                if byte == PREFIX[self.buf.len()] {
                    self.buf.push(byte);
                    return None;
                }
                if self.buf.is_empty() {
                    return None;
                }
                // mismatch mid-prefix: reset and re-examine this byte
                self.reset();
                continue;
            }

            let checksum_done = self.star.is_some_and(|star| self.buf.len() == star + 3);
            if byte == b'\r' || byte == b'\n' || checksum_done {
                let mut sentence = std::mem::take(&mut self.buf);
                sentence.extend_from_slice(b"\r\n");
                self.reset();
                // the terminating byte may itself start the next sentence
                if byte == b'$' {
                    self.buf.push(byte);
                }
                return Some(sentence);
            }

            if self.buf.len() > MAX_SENTENCE || byte == b'$' {
                self.reset();
                continue;
            }

            if byte == b'*' {
                self.star = Some(self.buf.len());
            }
            self.buf.push(byte);
            return None;
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.star = None;
    }
}
