//! Sliding window of sent plaintext, used as the DEFLATE preset dictionary.

/// Dictionary capacity in bytes for the compression write path.
pub(crate) const WINDOW_CAPACITY: usize = 8192;

/// Fixed-capacity window over the tail of a byte stream.
///
/// Maintained as a linear buffer; overflow shifts the oldest bytes out with
/// `copy_within`, which keeps `bytes()` a single contiguous slice.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    buf: Vec<u8>,
    cap: usize,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the window if it is not already sized to `cap`.
    pub fn init(&mut self, cap: usize) {
        if self.cap != cap {
            self.cap = cap;
            self.buf = Vec::with_capacity(cap);
        }
    }

    /// The last `min(total_written, capacity)` bytes, in stream order.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append `p`, evicting the oldest bytes past capacity.
    pub fn write(&mut self, p: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if p.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&p[p.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + p.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.copy_within(overflow.., 0);
            self.buf.truncate(self.buf.len() - overflow);
        }
        self.buf.extend_from_slice(p);
    }

    /// Release the window's memory; `init` re-creates it.
    pub fn close(&mut self) {
        self.buf = Vec::new();
        self.cap = 0;
    }
}
