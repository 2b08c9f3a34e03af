//! UTF-8 validation for text messages.
//!
//! Whole-buffer checks go through `simdutf8`; streamed messages use
//! [`Utf8Validator`], which tolerates multi-byte sequences split across
//! frame or read boundaries and rejects everything `std::str` would.

/// Validate that the input is entirely valid UTF-8.
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate data that may end mid-sequence.
///
/// Returns `(true, n)` when all complete sequences are valid and the last
/// `n` bytes (0..=3) form an incomplete trailing sequence, or `(false, 0)`
/// on a hard error.
pub(crate) fn validate_utf8_incomplete(data: &[u8]) -> (bool, usize) {
    match std::str::from_utf8(data) {
        Ok(_) => (true, 0),
        Err(e) => match e.error_len() {
            // Invalid sequence in the middle of the input.
            Some(_) => (false, 0),
            // Unexpected end of input: only the trailing sequence is short.
            None => (true, data.len() - e.valid_up_to()),
        },
    }
}

fn sequence_width(lead: u8) -> usize {
    if lead < 0xE0 {
        2
    } else if lead < 0xF0 {
        3
    } else {
        4
    }
}

/// Incremental UTF-8 validator for a message streamed in chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8Validator {
    partial: [u8; 4],
    partial_len: usize,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk. Returns false on an invalid sequence.
    pub fn feed(&mut self, mut chunk: &[u8]) -> bool {
        if self.partial_len > 0 {
            let width = sequence_width(self.partial[0]);
            while self.partial_len < width {
                let Some(&b) = chunk.first() else {
                    // Still mid-sequence; wait for more input.
                    return true;
                };
                if b & 0xC0 != 0x80 {
                    return false;
                }
                self.partial[self.partial_len] = b;
                self.partial_len += 1;
                chunk = &chunk[1..];
            }
            if std::str::from_utf8(&self.partial[..width]).is_err() {
                return false;
            }
            self.partial_len = 0;
        }

        let (ok, incomplete) = validate_utf8_incomplete(chunk);
        if !ok {
            return false;
        }
        if incomplete > 0 {
            let tail = &chunk[chunk.len() - incomplete..];
            self.partial[..incomplete].copy_from_slice(tail);
            self.partial_len = incomplete;
        }
        true
    }

    /// Returns false if the message ended in the middle of a sequence.
    pub fn finish(&mut self) -> bool {
        let complete = self.partial_len == 0;
        self.partial_len = 0;
        complete
    }
}
