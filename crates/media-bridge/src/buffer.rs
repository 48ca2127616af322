//! PCM byte ring
//!
//! Append-at-tail, consume-at-head byte queue feeding the capture
//! direction. Bytes are never reordered. The ring is bounded: when the
//! producer outpaces the telephony clock the oldest audio is dropped, in
//! whole channel strides, so latency cannot grow without limit.

use std::collections::VecDeque;

use tracing::trace;

#[derive(Debug)]
pub struct PcmRing {
    data: VecDeque<u8>,
    capacity: usize,
    stride: usize,
    dropped: u64,
}

impl PcmRing {
    /// `capacity` bytes at most; drops happen in multiples of `stride`
    pub fn new(capacity: usize, stride: usize) -> Self {
        let stride = stride.max(1);
        let capacity = capacity.max(stride);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            stride,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append `bytes`, returning how many old bytes were dropped to fit them
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        self.data.extend(bytes);
        if self.data.len() <= self.capacity {
            return 0;
        }

        let excess = self.data.len() - self.capacity;
        let drop = excess.div_ceil(self.stride) * self.stride;
        let drop = drop.min(self.data.len());
        self.data.drain(..drop);
        self.dropped += drop as u64;
        trace!("PCM ring overflow, dropped {} oldest bytes", drop);
        drop
    }

    /// Move up to `out.len()` bytes from the head into `out`
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        let (front, back) = self.data.as_slices();
        if n <= front.len() {
            out[..n].copy_from_slice(&front[..n]);
        } else {
            let split = front.len();
            out[..split].copy_from_slice(front);
            out[split..n].copy_from_slice(&back[..n - split]);
        }
        self.data.drain(..n);
        n
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_pushes() {
        let mut ring = PcmRing::new(64, 2);
        ring.push(&[1, 2, 3]);
        ring.push(&[4, 5]);

        let mut out = [0u8; 4];
        assert_eq!(ring.pop_into(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        let mut rest = [0u8; 4];
        assert_eq!(ring.pop_into(&mut rest), 1);
        assert_eq!(rest[0], 5);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_pop_across_wraparound() {
        let mut ring = PcmRing::new(8, 1);
        ring.push(&[0; 6]);
        let mut sink = [0u8; 5];
        ring.pop_into(&mut sink);
        ring.push(&[10, 11, 12, 13, 14, 15]);

        let mut out = [0u8; 7];
        assert_eq!(ring.pop_into(&mut out), 7);
        assert_eq!(out, [0, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_overflow_drops_oldest_whole_strides() {
        let mut ring = PcmRing::new(8, 4);
        assert_eq!(ring.push(&[1, 1, 1, 1, 2, 2, 2, 2]), 0);
        // One extra byte forces a whole 4-byte stride out
        assert_eq!(ring.push(&[3]), 4);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.dropped(), 4);

        let mut out = [0u8; 5];
        ring.pop_into(&mut out);
        assert_eq!(out, [2, 2, 2, 2, 3]);
    }

    #[test]
    fn test_capacity_never_below_stride() {
        let ring = PcmRing::new(1, 4);
        assert_eq!(ring.capacity(), 4);
    }
}
