//! Buffers between network arrival timing and device consumption timing
//!
//! - [`RingBuffer`]: a mutex-guarded byte ring on the capture path. The
//!   producer always wins: inserting into a full ring overwrites the oldest
//!   unread bytes.
//! - [`JitterQueue`]: a bounded FIFO of [`AudioData`] that drops the oldest
//!   entry on overflow, with pre-roll (fill) and drain (flush) phases.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::data::AudioData;
use crate::error::{Error, Result};

struct RingState {
    data: Vec<u8>,
    /// Next byte to read
    read_pos: usize,
    /// Next byte to write
    write_pos: usize,
    /// Unread bytes
    readable: usize,
}

/// Fixed-capacity byte ring with producer-priority overwrite
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
    overwritten_bytes: AtomicUsize,
}

impl RingBuffer {
    /// Allocate the backing storage
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
                readable: 0,
            }),
            capacity,
            overwritten_bytes: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append bytes. If the free space is too small the oldest unread bytes
    /// are overwritten; a write larger than the whole ring is rejected.
    pub fn insert(&self, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        if len > self.capacity {
            return Err(Error::CapacityExceeded {
                len,
                capacity: self.capacity,
            });
        }
        if len == 0 {
            return Ok(());
        }

        let mut state = self.state.lock();
        let writable = self.capacity - state.readable;
        if len > writable {
            let lost = len - writable;
            state.read_pos = (state.read_pos + lost) % self.capacity;
            state.readable -= lost;
            self.overwritten_bytes.fetch_add(lost, Ordering::Relaxed);
        }

        let start = state.write_pos;
        let first = len.min(self.capacity - start);
        state.data[start..start + first].copy_from_slice(&bytes[..first]);
        if first < len {
            state.data[..len - first].copy_from_slice(&bytes[first..]);
        }
        state.write_pos = (start + len) % self.capacity;
        state.readable += len;
        Ok(())
    }

    /// Whether `len` bytes are ready to read
    pub fn can_read(&self, len: usize) -> bool {
        self.state.lock().readable >= len
    }

    /// Copy `buf.len()` bytes out and advance the read cursor. Fails without
    /// consuming anything if not enough bytes are buffered.
    pub fn get_data(&self, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let mut state = self.state.lock();
        if state.readable < len {
            return Err(Error::StatusErr(format!(
                "ring holds {} bytes, {} requested",
                state.readable, len
            )));
        }
        if len == 0 {
            return Ok(());
        }

        let start = state.read_pos;
        let first = len.min(self.capacity - start);
        buf[..first].copy_from_slice(&state.data[start..start + first]);
        if first < len {
            buf[first..].copy_from_slice(&state.data[..len - first]);
        }
        state.read_pos = (start + len) % self.capacity;
        state.readable -= len;
        Ok(())
    }

    /// Unread bytes
    pub fn readable(&self) -> usize {
        self.state.lock().readable
    }

    /// Free bytes
    pub fn writable(&self) -> usize {
        self.capacity - self.state.lock().readable
    }

    /// Bytes lost to producer-priority overwrites since creation
    pub fn overwritten_bytes(&self) -> usize {
        self.overwritten_bytes.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.read_pos = 0;
        state.write_pos = 0;
        state.readable = 0;
    }
}

/// Bounded drop-oldest FIFO of audio buffers
pub struct JitterQueue {
    queue: Mutex<VecDeque<AudioData>>,
    max_size: AtomicUsize,
    dropped: AtomicUsize,
    underruns: AtomicUsize,
}

impl JitterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(max_size + 1)),
            max_size: AtomicUsize::new(max_size.max(1)),
            dropped: AtomicUsize::new(0),
            underruns: AtomicUsize::new(0),
        }
    }

    /// Append to the tail, first dropping from the head so that the queue
    /// never holds more than the current maximum. Returns how many entries
    /// were dropped.
    pub fn push(&self, data: AudioData) -> usize {
        let limit = self.max_size.load(Ordering::Relaxed);
        self.push_with_limit(data, limit)
    }

    /// Like [`push`](Self::push) with an explicit size limit for this call
    pub fn push_with_limit(&self, data: AudioData, limit: usize) -> usize {
        let limit = limit.max(1);
        let mut queue = self.queue.lock();
        let mut dropped = 0;
        while queue.len() >= limit {
            queue.pop_front();
            dropped += 1;
        }
        queue.push_back(data);
        drop(queue);
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        dropped
    }

    pub fn pop(&self) -> Option<AudioData> {
        self.queue.lock().pop_front()
    }

    /// Pop the head, or hand out `silence_len` zero bytes when empty so that
    /// downstream pacing never stalls
    pub fn pop_or_silence(&self, silence_len: usize) -> AudioData {
        match self.pop() {
            Some(data) => data,
            None => {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                AudioData::new(silence_len)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size.max(1), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Pre-roll: poll until at least `threshold` entries are buffered.
    /// Returns false if `running` was cleared or `timeout` elapsed first.
    pub fn wait_fill(
        &self,
        threshold: usize,
        running: &AtomicBool,
        poll: Duration,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while self.len() < threshold {
            if !running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
        true
    }

    /// Drain: poll until the consumer has emptied the queue.
    /// Returns false if `running` was cleared or `timeout` elapsed first.
    pub fn wait_flush(&self, running: &AtomicBool, poll: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_empty() {
            if !running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
        true
    }

    pub fn stats(&self) -> JitterQueueStats {
        JitterQueueStats {
            level: self.len(),
            max_size: self.max_size(),
            dropped: self.dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe handle to a jitter queue
pub type SharedJitterQueue = Arc<JitterQueue>;

/// Jitter queue statistics
#[derive(Debug, Clone)]
pub struct JitterQueueStats {
    pub level: usize,
    pub max_size: usize,
    pub dropped: usize,
    pub underruns: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(tag: u8) -> AudioData {
        AudioData::from_vec(vec![tag; 4])
    }

    #[test]
    fn test_ring_buffer_basic() {
        let ring = RingBuffer::new(8);
        ring.insert(&[1, 2, 3]).unwrap();
        assert!(ring.can_read(3));
        assert!(!ring.can_read(4));

        let mut out = [0u8; 3];
        ring.get_data(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(ring.readable(), 0);
        assert!(ring.get_data(&mut out).is_err());
    }

    #[test]
    fn test_ring_buffer_overwrites_oldest() {
        let ring = RingBuffer::new(6);
        ring.insert(&[1, 2, 3, 4]).unwrap();
        ring.insert(&[5, 6, 7, 8]).unwrap();
        assert_eq!(ring.readable(), 6);
        assert_eq!(ring.overwritten_bytes(), 2);

        let mut out = [0u8; 6];
        ring.get_data(&mut out).unwrap();
        assert_eq!(out, [3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_ring_buffer_rejects_oversized() {
        let ring = RingBuffer::new(4);
        assert!(matches!(
            ring.insert(&[0; 5]),
            Err(Error::CapacityExceeded { len: 5, capacity: 4 })
        ));
        assert_eq!(ring.readable(), 0);
    }

    #[test]
    fn test_jitter_queue_drop_oldest() {
        let queue = JitterQueue::new(3);
        for tag in 0..5u8 {
            queue.push(frame(tag));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.stats().dropped, 2);
        assert_eq!(queue.pop().unwrap().data()[0], 2);
    }

    #[test]
    fn test_jitter_queue_silence_on_empty() {
        let queue = JitterQueue::new(3);
        let data = queue.pop_or_silence(16);
        assert_eq!(data.size(), 16);
        assert!(data.data().iter().all(|&b| b == 0));
        assert_eq!(queue.stats().underruns, 1);
    }

    #[test]
    fn test_jitter_queue_fill_and_flush() {
        let queue = Arc::new(JitterQueue::new(8));
        let running = AtomicBool::new(true);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for tag in 0..3u8 {
                    thread::sleep(Duration::from_millis(5));
                    queue.push(frame(tag));
                }
            })
        };
        assert!(queue.wait_fill(3, &running, Duration::from_millis(1), Duration::from_secs(2)));
        producer.join().unwrap();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || while queue.pop().is_some() {})
        };
        assert!(queue.wait_flush(&running, Duration::from_millis(1), Duration::from_secs(2)));
        consumer.join().unwrap();

        let stopped = AtomicBool::new(false);
        assert!(!queue.wait_fill(1, &stopped, Duration::from_millis(1), Duration::from_secs(2)));
    }

    proptest! {
        #[test]
        fn prop_ring_insert_then_read_is_identity(
            prefill in 0usize..64,
            bytes in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let ring = RingBuffer::new(64);
            // move the cursors so that writes wrap around
            ring.insert(&vec![0xAA; prefill]).unwrap();
            let mut skip = vec![0u8; prefill];
            ring.get_data(&mut skip).unwrap();

            ring.insert(&bytes).unwrap();
            let mut out = vec![0u8; bytes.len()];
            ring.get_data(&mut out).unwrap();
            prop_assert_eq!(out, bytes);
        }

        #[test]
        fn prop_ring_space_accounts_for_capacity(
            writes in proptest::collection::vec(0usize..40, 0..20),
        ) {
            let ring = RingBuffer::new(32);
            for len in writes {
                let result = ring.insert(&vec![1u8; len]);
                prop_assert_eq!(result.is_err(), len > 32);
                prop_assert_eq!(ring.readable() + ring.writable(), 32);
            }
        }

        #[test]
        fn prop_jitter_queue_keeps_newest(max in 1usize..16, pushes in 0usize..64) {
            let queue = JitterQueue::new(max);
            for i in 0..pushes {
                queue.push(AudioData::from_vec((i as u32).to_le_bytes().to_vec()));
                prop_assert!(queue.len() <= max);
            }
            let kept: Vec<u32> = std::iter::from_fn(|| queue.pop())
                .map(|d| u32::from_le_bytes(d.data().try_into().unwrap()))
                .collect();
            let expected: Vec<u32> = (pushes.saturating_sub(max)..pushes).map(|i| i as u32).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
