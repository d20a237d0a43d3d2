//! Growable byte buffer with a prepend region and read/write cursors.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=        reader      <=      writer      <=    capacity
//! ```
//!
//! The fixed prepend region lets message framers insert a length header
//! in O(1) after the payload has been written. When writable space runs
//! short but consumed prepend slack plus writable space suffices, the
//! readable bytes shift left instead of reallocating, keeping amortized
//! append cost linear.

/// Size of the fixed prepend region.
pub const CHEAP_PREPEND: usize = 8;

/// Default initial capacity of the data region.
pub const INITIAL_SIZE: usize = 1024;

#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `capacity` bytes of data region (the prepend
    /// region is additional).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; CHEAP_PREPEND + capacity],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reader == self.writer
    }

    /// The readable region. Stable until the next mutation.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Consume `n` readable bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes(), "retrieve exceeds readable bytes");
        if n == self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.reader += n;
        }
    }

    /// Consume everything and reset both cursors to just past the
    /// prepend region.
    #[inline]
    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Copy out `n` readable bytes and consume them.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes(), "retrieve exceeds readable bytes");
        let out = self.data[self.reader..self.reader + n].to_vec();
        self.retrieve(n);
        out
    }

    /// Copy out the whole readable region and fully reset.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Append `data`, growing or shifting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Ensure at least `n` writable bytes.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() - CHEAP_PREPEND >= n {
            // Enough slack before the reader: shift readable bytes back to
            // the prepend boundary instead of reallocating.
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
        } else {
            let new_len = (self.writer + n).next_power_of_two();
            self.data.resize(new_len, 0);
        }
    }

    /// Write `data` immediately before the reader cursor.
    ///
    /// # Panics
    /// Panics if the prependable region is too small.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend exceeds prependable bytes"
        );
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// The writable region, for I/O completion to fill and then commit
    /// with [`Buffer::has_written`].
    #[inline]
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.data[self.writer..]
    }

    /// Commit `n` bytes written into [`Buffer::begin_write`].
    ///
    /// # Panics
    /// Panics if `n` exceeds the writable bytes.
    pub fn has_written(&mut self, n: usize) {
        assert!(n <= self.writable_bytes(), "has_written exceeds writable bytes");
        self.writer += n;
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    /// Read a big-endian u32 at the reader cursor without consuming.
    ///
    /// # Panics
    /// Panics if fewer than four bytes are readable.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4, "peek_u32 on short buffer");
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.reader..self.reader + 4]);
        u32::from_be_bytes(raw)
    }

    pub fn read_u32(&mut self) -> u32 {
        let v = self.peek_u32();
        self.retrieve(4);
        v
    }

    /// Prepend a big-endian u32, the length-header fast path.
    pub fn prepend_u32(&mut self, v: u32) {
        self.prepend(&v.to_be_bytes());
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
