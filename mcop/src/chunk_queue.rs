//! Bounded ring of byte chunks shared by one producer and one consumer.
//!
//! Two counting semaphores carry the whole protocol: `free` counts slots the
//! producer may take, `filled` counts slots the consumer may take. A slot is
//! only ever touched by the side holding its permit, so the chunks themselves
//! need no lock.

use crate::mutex::UnsafeMutex;
use crate::thread::{Semaphore, Threads};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const DEFAULT_CHUNK_COUNT: usize = 3;

/// Fixed-capacity byte buffer with a logical size and a read offset.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    data: Vec<u8>,
    size: usize,
    pos: usize,
}

impl Chunk {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            size: 0,
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.data.resize(capacity, 0);
        self.clear();
    }

    /// Replaces the contents; returns how many bytes fit.
    pub fn put(&mut self, src: &[u8]) -> usize {
        self.clear();
        self.push(src)
    }

    /// Appends after the current contents; returns how many bytes fit.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.size);
        self.data[self.size..self.size + n].copy_from_slice(&src[..n]);
        self.size += n;
        n
    }

    /// Unread contents.
    pub fn get(&self) -> &[u8] {
        &self.data[self.pos..self.size]
    }

    pub fn pop(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.size);
    }

    pub fn len(&self) -> usize {
        self.size - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size == self.data.len()
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.pos = 0;
    }

    /// Whole backing storage, for filling straight from a device read.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_filled(&mut self, size: usize) {
        self.size = size.min(self.data.len());
        self.pos = 0;
    }
}

pub struct ChunkQueue {
    chunks: Vec<UnsafeMutex<Chunk>>,
    // Unread length of each slot as of its last commit
    lengths: Vec<AtomicUsize>,
    chunk_size: AtomicUsize,
    read_index: AtomicUsize,
    write_index: AtomicUsize,
    filled: Semaphore,
    free: Semaphore,
    // Set while a side owns its current slot between wait and commit
    reading: AtomicBool,
    writing: AtomicBool,
    waiters: AtomicUsize,
}

impl std::fmt::Debug for ChunkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkQueue")
            .field("chunks", &self.chunks.len())
            .field("chunk_size", &self.chunk_size())
            .field("buffered", &self.buffered_chunks())
            .finish()
    }
}

impl ChunkQueue {
    pub fn new(threads: &Threads, chunk_count: usize, chunk_size: usize) -> Self {
        let chunk_count = chunk_count.max(1);
        Self {
            chunks: (0..chunk_count)
                .map(|_| UnsafeMutex::new(Chunk::with_capacity(chunk_size)))
                .collect(),
            lengths: (0..chunk_count).map(|_| AtomicUsize::new(0)).collect(),
            chunk_size: AtomicUsize::new(chunk_size),
            read_index: AtomicUsize::new(0),
            write_index: AtomicUsize::new(0),
            filled: Semaphore::new(threads, 0),
            free: Semaphore::new(threads, chunk_count),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn max_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Acquire)
    }

    /// Resizes every slot and empties it. Same precondition as [`Self::clear`].
    pub fn set_chunk_size(&self, size: usize) {
        for chunk in &self.chunks {
            chunk.lock().set_capacity(size);
        }
        self.chunk_size.store(size, Ordering::Release);
    }

    pub fn buffered_chunks(&self) -> usize {
        self.filled.value()
    }

    pub fn free_chunks(&self) -> usize {
        self.max_chunks() - self.buffered_chunks()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered_chunks() == 0
    }

    /// Bytes the consumer can take without blocking. Only the consumer may
    /// call this: it looks into the slot the consumer holds.
    pub fn readable_bytes(&self) -> usize {
        let start = self.read_index.load(Ordering::Acquire);
        let (held, start) = if self.is_consuming() {
            (self.chunks[start].get().len(), start + 1)
        } else {
            (0, start)
        };
        let committed: usize = (0..self.filled.value())
            .map(|i| self.lengths[(start + i) % self.chunks.len()].load(Ordering::Acquire))
            .sum();
        held + committed
    }

    /// Bytes the producer can put without blocking. Only the producer may
    /// call this: it looks into the slot the producer holds.
    pub fn writable_bytes(&self) -> usize {
        let held = if self.is_producing() {
            let chunk = self.chunks[self.write_index.load(Ordering::Acquire)].get();
            chunk.capacity() - chunk.size
        } else {
            0
        };
        held + self.free.value() * self.chunk_size()
    }

    fn publish(&self) {
        let index = self.write_index.load(Ordering::Acquire);
        let len = self.chunks[index].get().len();
        self.lengths[index].store(len, Ordering::Release);
        self.advance(&self.write_index);
        self.filled.post();
    }

    fn slot(&self, index: &AtomicUsize) -> &mut Chunk {
        self.chunks[index.load(Ordering::Acquire)].lock()
    }

    fn advance(&self, index: &AtomicUsize) {
        let next = (index.load(Ordering::Acquire) + 1) % self.chunks.len();
        index.store(next, Ordering::Release);
    }

    fn acquire(&self, sem: &Semaphore) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        sem.wait();
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Producer convenience: blocks while the ring is full, never drops data.
    /// Anything beyond the chunk size is cut off.
    pub fn write(&self, data: &[u8]) {
        debug_assert!(!self.writing.load(Ordering::Acquire));
        self.acquire(&self.free);
        self.slot(&self.write_index).put(data);
        self.publish();
    }

    /// Producer: blocks for a free slot, or returns the slot already held.
    /// A newly taken slot starts out empty.
    pub fn wait_consumed(&self) -> &mut Chunk {
        if !self.writing.swap(true, Ordering::AcqRel) {
            self.acquire(&self.free);
            self.slot(&self.write_index).clear();
        }
        self.slot(&self.write_index)
    }

    /// Producer: hands the held slot to the consumer.
    pub fn produced(&self) {
        let held = self.writing.swap(false, Ordering::AcqRel);
        debug_assert!(held, "produced() without wait_consumed()");
        self.publish();
    }

    /// Consumer: blocks for a filled slot, or returns the slot already held.
    pub fn wait_produced(&self) -> &mut Chunk {
        if !self.reading.swap(true, Ordering::AcqRel) {
            self.acquire(&self.filled);
        }
        self.slot(&self.read_index)
    }

    /// Consumer: gives the held slot back to the producer.
    pub fn consumed(&self) {
        let held = self.reading.swap(false, Ordering::AcqRel);
        debug_assert!(held, "consumed() without wait_produced()");
        self.advance(&self.read_index);
        self.free.post();
    }

    /// Producer currently owns a partially filled slot.
    pub fn is_producing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Consumer currently owns a partially drained slot.
    pub fn is_consuming(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Back to the empty state. Only valid while neither side is blocked in a
    /// wait; the semaphores are reinitialized underneath any such waiter.
    pub fn clear(&self) {
        debug_assert_eq!(
            self.waiters.load(Ordering::Acquire),
            0,
            "clear() while a producer or consumer is waiting"
        );
        self.read_index.store(0, Ordering::Release);
        self.write_index.store(0, Ordering::Release);
        self.reading.store(false, Ordering::Release);
        self.writing.store(false, Ordering::Release);
        for chunk in &self.chunks {
            chunk.lock().clear();
        }
        for len in &self.lengths {
            len.store(0, Ordering::Release);
        }
        self.filled.reset(0);
        self.free.reset(self.chunks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Thread;
    use std::sync::{Arc, Mutex};

    fn assert_balanced(queue: &ChunkQueue) {
        assert_eq!(
            queue.buffered_chunks() + queue.free_chunks(),
            queue.max_chunks()
        );
    }

    #[test]
    fn write_then_drain_in_order() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, DEFAULT_CHUNK_COUNT, 4);
        assert!(queue.is_empty());
        assert_eq!(queue.free_chunks(), 3);

        queue.write(&[1, 2, 3, 4]);
        queue.write(&[5, 6]);
        assert_eq!(queue.buffered_chunks(), 2);
        assert_balanced(&queue);

        assert_eq!(queue.wait_produced().get(), &[1, 2, 3, 4]);
        queue.consumed();
        assert_eq!(queue.wait_produced().get(), &[5, 6]);
        queue.consumed();
        assert!(queue.is_empty());
        assert_balanced(&queue);
    }

    #[test]
    fn write_truncates_to_chunk_size() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 2, 2);
        queue.write(&[9, 8, 7]);
        assert_eq!(queue.wait_produced().get(), &[9, 8]);
    }

    #[test]
    fn partial_drain_keeps_the_slot() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 8);
        queue.write(&[1, 2, 3, 4, 5, 6]);

        let chunk = queue.wait_produced();
        assert_eq!(&chunk.get()[..2], &[1, 2]);
        chunk.pop(2);
        assert!(queue.is_consuming());

        // Second wait returns the held slot without taking another permit
        let chunk = queue.wait_produced();
        assert_eq!(chunk.get(), &[3, 4, 5, 6]);
        chunk.pop(4);
        assert!(chunk.is_empty());
        queue.consumed();
        assert!(!queue.is_consuming());
        assert_eq!(queue.free_chunks(), 3);
    }

    #[test]
    fn partial_fill_spans_calls() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 4);
        assert_eq!(queue.wait_consumed().push(&[1, 2]), 2);
        assert!(queue.is_producing());
        assert_eq!(queue.buffered_chunks(), 0);
        let chunk = queue.wait_consumed();
        assert_eq!(chunk.push(&[3, 4, 5]), 2);
        assert!(chunk.is_full());
        queue.produced();
        assert_eq!(queue.buffered_chunks(), 1);
        assert_eq!(queue.wait_produced().get(), &[1, 2, 3, 4]);
    }

    #[test]
    fn indices_wrap_around() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 1);
        for round in 0..10u8 {
            queue.write(&[round]);
            assert_eq!(queue.wait_produced().get(), &[round]);
            queue.consumed();
            assert_balanced(&queue);
        }
    }

    #[test]
    fn clear_restores_empty_state() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 4);
        queue.write(&[1]);
        queue.write(&[2]);
        queue.wait_produced();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.free_chunks(), 3);
        assert!(!queue.is_consuming());
        queue.write(&[3]);
        assert_eq!(queue.wait_produced().get(), &[3]);
    }

    #[test]
    fn byte_counts_follow_held_slots() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 4);
        assert_eq!(queue.writable_bytes(), 12);
        assert_eq!(queue.readable_bytes(), 0);

        queue.write(&[1, 2, 3]);
        queue.wait_consumed().push(&[4]);
        assert_eq!(queue.writable_bytes(), 3 + 4);
        assert_eq!(queue.readable_bytes(), 3);

        queue.wait_produced().pop(1);
        assert_eq!(queue.readable_bytes(), 2);
        queue.produced();
        assert_eq!(queue.readable_bytes(), 3);
    }

    #[test]
    fn readable_bytes_ignore_the_slot_being_filled() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 4);
        queue.write(&[1, 2]);
        queue.wait_consumed().push(&[3, 4, 5]);
        assert_eq!(queue.readable_bytes(), 2);
        queue.produced();
        assert_eq!(queue.readable_bytes(), 5);
        queue.clear();
        assert_eq!(queue.readable_bytes(), 0);
        assert_eq!(queue.writable_bytes(), 12);
    }

    #[test]
    fn set_chunk_size_resizes_slots() {
        let threads = Threads::new();
        let queue = ChunkQueue::new(&threads, 3, 4);
        queue.set_chunk_size(1024);
        assert_eq!(queue.chunk_size(), 1024);
    }

    #[test]
    fn producer_blocks_instead_of_dropping() {
        let threads = Threads::native();
        let queue = Arc::new(ChunkQueue::new(&threads, 3, 2));
        let producer_queue = queue.clone();
        let mut producer = Thread::new(&threads, "producer", move || {
            for i in 0..50u8 {
                producer_queue.write(&[i, i]);
            }
        });
        producer.start().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..50 {
            let chunk = queue.wait_produced();
            received.lock().unwrap().push(chunk.get()[0]);
            queue.consumed();
            assert!(queue.buffered_chunks() <= queue.max_chunks());
        }
        producer.wait_for_termination();
        assert_eq!(*received.lock().unwrap(), (0..50u8).collect::<Vec<_>>());
        assert_balanced(&queue);
    }
}
