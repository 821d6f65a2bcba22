use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::RingError;

/// Fixed-capacity byte ring used as send/receive staging for socket
/// endpoints.
///
/// Data is appended at the head and read from the tail. Reads may start at
/// an offset past the tail without disturbing it (`peek`), or advance the
/// tail (`consume`). `modify` rewrites bytes that are already queued, which
/// is how a partially transmitted record gets its length prefix patched in
/// place.
///
/// All operations serialise on an internal mutex. When several operations
/// must be atomic as a group (a record header followed by its payload),
/// [`RingBuffer::lock`] hands out a guard that performs the same operations
/// under the single held lock.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
}

struct RingInner {
    data: Box<[u8]>,
    capacity: usize,
    head: usize,
    tail: usize,
    used: usize,
}

impl RingBuffer {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            inner: Mutex::new(RingInner {
                data: vec![0; capacity].into_boxed_slice(),
                capacity,
                head: 0,
                tail: 0,
                used: 0,
            }),
        }
    }

    /// Clears the indices and reallocates the storage.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.head = 0;
        inner.tail = 0;
        inner.used = 0;
        inner.data = vec![0; inner.capacity].into_boxed_slice();
    }

    /// Locks the ring for a batch of operations that must be atomic as a
    /// group.
    pub fn lock(&self) -> RingGuard<'_> {
        RingGuard { inner: self.lock_inner() }
    }

    pub fn capacity(&self) -> usize {
        self.lock_inner().capacity
    }

    pub fn used(&self) -> usize {
        self.lock_inner().used
    }

    pub fn free(&self) -> usize {
        let inner = self.lock_inner();
        inner.capacity - inner.used
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().used == 0
    }

    /// Copies up to `length` bytes starting `offset` bytes past the tail
    /// without advancing it. Returns the number of bytes actually copied,
    /// bounded by availability. `dest: None` probes availability only.
    pub fn peek(
        &self,
        dest: Option<&mut [u8]>,
        offset: usize,
        length: usize,
    ) -> Result<usize, RingError> {
        self.lock_inner().read(dest, offset, length, true)
    }

    /// Same as [`peek`](Self::peek) but advances the tail by the number of
    /// bytes copied. `dest: None` discards the bytes.
    pub fn consume(
        &self,
        dest: Option<&mut [u8]>,
        offset: usize,
        length: usize,
    ) -> Result<usize, RingError> {
        self.lock_inner().read(dest, offset, length, false)
    }

    /// Appends `src` at the head. All-or-nothing: if the bytes do not fit,
    /// nothing is written and `AttemptToExceedCapacity` is returned.
    pub fn append(&self, src: &[u8]) -> Result<(), RingError> {
        self.lock_inner().append(src)
    }

    /// Overwrites `src.len()` bytes starting `offset` past the tail. Head,
    /// tail and used are left untouched.
    pub fn modify(&self, src: &[u8], offset: usize) -> Result<(), RingError> {
        self.lock_inner().modify(src, offset)
    }

    fn lock_inner(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("RingBuffer")
            .field("capacity", &inner.capacity)
            .field("head", &inner.head)
            .field("tail", &inner.tail)
            .field("used", &inner.used)
            .finish()
    }
}

/// Held lock over a [`RingBuffer`], exposing the same operations without
/// re-locking per call.
pub struct RingGuard<'a> {
    inner: MutexGuard<'a, RingInner>,
}

impl RingGuard<'_> {
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn used(&self) -> usize {
        self.inner.used
    }

    pub fn free(&self) -> usize {
        self.inner.capacity - self.inner.used
    }

    pub fn is_empty(&self) -> bool {
        self.inner.used == 0
    }

    pub fn peek(
        &mut self,
        dest: Option<&mut [u8]>,
        offset: usize,
        length: usize,
    ) -> Result<usize, RingError> {
        self.inner.read(dest, offset, length, true)
    }

    pub fn consume(
        &mut self,
        dest: Option<&mut [u8]>,
        offset: usize,
        length: usize,
    ) -> Result<usize, RingError> {
        self.inner.read(dest, offset, length, false)
    }

    pub fn append(&mut self, src: &[u8]) -> Result<(), RingError> {
        self.inner.append(src)
    }

    pub fn modify(&mut self, src: &[u8], offset: usize) -> Result<(), RingError> {
        self.inner.modify(src, offset)
    }
}

impl RingInner {
    fn read(
        &mut self,
        mut dest: Option<&mut [u8]>,
        offset: usize,
        length: usize,
        peek: bool,
    ) -> Result<usize, RingError> {
        if self.used == 0 {
            if self.head != self.tail {
                return Err(RingError::HeadAndTailOutOfSync);
            }
            return Ok(0);
        }
        if offset >= self.used {
            return Ok(0);
        }

        let length = match dest.as_deref() {
            Some(d) => length.min(d.len()),
            None => length,
        };

        let mut amt_read = 0;
        let mut remaining = self.used - offset;
        let mut pos = self.tail + offset;
        if pos >= self.capacity {
            pos -= self.capacity;
        }

        while amt_read < length && remaining > 0 {
            // Contiguous run up to the head or the end of the storage.
            let mut run = if pos < self.head { self.head - pos } else { self.capacity - pos };
            run = run.min(length - amt_read);

            if let Some(d) = dest.as_deref_mut() {
                d[amt_read..amt_read + run].copy_from_slice(&self.data[pos..pos + run]);
            }

            amt_read += run;
            remaining = remaining.checked_sub(run).ok_or(RingError::UsedLessThanZero)?;

            pos += run;
            if pos == self.capacity {
                pos = 0;
            } else if pos > self.capacity {
                return Err(RingError::TailExceededCapacity);
            }
        }

        if !peek {
            self.used -= amt_read;
            self.tail += amt_read;
            if self.tail >= self.capacity {
                self.tail -= self.capacity;
            }
        }

        Ok(amt_read)
    }

    fn append(&mut self, src: &[u8]) -> Result<(), RingError> {
        if self.used + src.len() > self.capacity {
            return Err(RingError::AttemptToExceedCapacity {
                used: self.used,
                requested: src.len(),
                capacity: self.capacity,
            });
        }

        let mut written = 0;
        while written < src.len() {
            let mut run =
                if self.head < self.tail { self.tail - self.head } else { self.capacity - self.head };
            run = run.min(src.len() - written);

            self.data[self.head..self.head + run].copy_from_slice(&src[written..written + run]);

            written += run;
            self.used += run;
            if self.used > self.capacity {
                return Err(RingError::BufferSizeHasBeenExceeded);
            }

            self.head += run;
            if self.head == self.capacity {
                self.head = 0;
            } else if self.head > self.capacity {
                return Err(RingError::HeadHasExceededCapacity);
            }
        }

        Ok(())
    }

    fn modify(&mut self, src: &[u8], offset: usize) -> Result<(), RingError> {
        if offset + src.len() > self.used {
            return Err(RingError::ModifyOutOfBounds {
                offset,
                length: src.len(),
                used: self.used,
            });
        }

        let mut pos = self.tail + offset;
        if pos >= self.capacity {
            pos -= self.capacity;
        }

        let mut written = 0;
        while written < src.len() {
            let mut run = src.len() - written;
            if pos + run > self.capacity {
                run = self.capacity - pos;
            }

            self.data[pos..pos + run].copy_from_slice(&src[written..written + run]);

            written += run;
            pos += run;
            if pos == self.capacity {
                pos = 0;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(ring: &RingBuffer) -> Vec<u8> {
        let used = ring.used();
        let mut buf = vec![0; used];
        assert_eq!(ring.peek(Some(&mut buf), 0, used).unwrap(), used);
        buf
    }

    #[test]
    fn wraps_around() {
        let ring = RingBuffer::new(8);
        ring.append(b"ABCDE").unwrap();
        assert_eq!(ring.used(), 5);

        let mut buf = [0u8; 3];
        assert_eq!(ring.consume(Some(&mut buf), 0, 3).unwrap(), 3);
        assert_eq!(&buf, b"ABC");
        assert_eq!(ring.used(), 2);
        assert_eq!(contents(&ring), b"DE");

        ring.append(b"FGHIJ").unwrap();
        assert_eq!(ring.used(), 7);

        let mut buf = [0u8; 7];
        assert_eq!(ring.peek(Some(&mut buf), 0, 7).unwrap(), 7);
        assert_eq!(&buf, b"DEFGHIJ");
        // Peeking never drains.
        assert_eq!(ring.used(), 7);
    }

    #[test]
    fn rejects_append_past_capacity_untouched() {
        let ring = RingBuffer::new(8);
        ring.append(b"ABCDE").unwrap();

        let err = ring.append(b"FGHI").unwrap_err();
        assert_eq!(
            err,
            RingError::AttemptToExceedCapacity { used: 5, requested: 4, capacity: 8 }
        );
        assert_eq!(ring.used(), 5);
        assert_eq!(contents(&ring), b"ABCDE");
    }

    #[test]
    fn partial_record_prefix_rewrite() {
        // A queued record ⟨len, payload⟩ with 4 payload bytes sent: consume
        // the sent bytes and patch the prefix to the residual length.
        let ring = RingBuffer::new(64);
        {
            let mut guard = ring.lock();
            guard.append(&10i32.to_ne_bytes()).unwrap();
            guard.append(b"0123456789").unwrap();
        }
        assert_eq!(ring.used(), 14);

        ring.consume(None, 0, 4).unwrap();
        ring.modify(&6i32.to_ne_bytes(), 0).unwrap();

        let mut prefix = [0u8; 4];
        assert_eq!(ring.peek(Some(&mut prefix), 0, 4).unwrap(), 4);
        assert_eq!(prefix, 6i32.to_ne_bytes());
        assert_eq!(ring.used(), 10);

        let mut rest = [0u8; 6];
        assert_eq!(ring.peek(Some(&mut rest), 4, 6).unwrap(), 6);
        assert_eq!(&rest, b"456789");
    }

    #[test]
    fn modify_matches_following_peek() {
        let ring = RingBuffer::new(16);
        ring.append(b"abcdefghij").unwrap();
        ring.consume(None, 0, 6).unwrap();
        ring.append(b"KLMNOPQR").unwrap();

        // The queued run ghijKLMNOPQR now wraps; rewrite across the seam.
        ring.modify(b"wxyz", 8).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ring.peek(Some(&mut buf), 8, 4).unwrap(), 4);
        assert_eq!(&buf, b"wxyz");
    }

    #[test]
    fn modify_out_of_bounds() {
        let ring = RingBuffer::new(8);
        ring.append(b"abc").unwrap();
        let err = ring.modify(b"xy", 2).unwrap_err();
        assert_eq!(err, RingError::ModifyOutOfBounds { offset: 2, length: 2, used: 3 });
        assert_eq!(contents(&ring), b"abc");
    }

    #[test]
    fn short_reads_and_offsets() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.peek(None, 0, 4).unwrap(), 0);
        assert_eq!(ring.consume(None, 0, 4).unwrap(), 0);

        ring.append(b"abcde").unwrap();
        assert_eq!(ring.peek(None, 5, 1).unwrap(), 0);
        assert_eq!(ring.peek(None, 7, 1).unwrap(), 0);

        let mut buf = [0u8; 8];
        // Only two bytes are available past offset 3.
        assert_eq!(ring.peek(Some(&mut buf), 3, 8).unwrap(), 2);
        assert_eq!(&buf[..2], b"de");
    }

    #[test]
    fn guard_batches_atomically() {
        let ring = RingBuffer::new(16);
        {
            let mut guard = ring.lock();
            guard.append(&4i32.to_ne_bytes()).unwrap();
            guard.append(b"data").unwrap();
            assert_eq!(guard.used(), 8);
        }
        assert_eq!(ring.used(), 8);
    }

    #[test]
    fn reset_clears() {
        let ring = RingBuffer::new(8);
        ring.append(b"abcdefgh").unwrap();
        assert_eq!(ring.free(), 0);
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 8);
        ring.append(b"xy").unwrap();
        assert_eq!(contents(&ring), b"xy");
    }

    #[test]
    fn tracks_a_shadow_model() {
        use std::collections::VecDeque;

        let ring = RingBuffer::new(13);
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut next = 0u8;

        for step in 0..500 {
            let n = (step * 7 + 3) % 9;
            let chunk: Vec<u8> = (0..n)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();

            if model.len() + n <= 13 {
                ring.append(&chunk).unwrap();
                model.extend(&chunk);
            } else {
                assert!(matches!(
                    ring.append(&chunk),
                    Err(RingError::AttemptToExceedCapacity { .. })
                ));
            }

            let take = (step * 5 + 1) % 7;
            let mut buf = vec![0; take];
            let got = ring.consume(Some(&mut buf), 0, take).unwrap();
            assert_eq!(got, take.min(model.len()));
            for b in buf.iter().take(got) {
                assert_eq!(*b, model.pop_front().unwrap());
            }

            assert_eq!(ring.used(), model.len());
            assert_eq!(ring.free(), 13 - model.len());
            let queued: Vec<u8> = model.iter().copied().collect();
            assert_eq!(contents(&ring), queued);
        }
    }
}
