//! Multi-slot period ring shared by the render producer and the device consumer.
//!
//! Exactly one writer and one reader may hold a slot at a time. The writer may
//! split its slot into per-channel sub-blocks and hand those to worker threads;
//! every sub-block lock must be released before the slot is committed.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::format::{Presets, SampleFormat};

pub const DEFAULT_SUB_BLOCK_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("all {slots} slots are pending, writing would overrun the reader")]
    WouldOverrun { slots: usize },
    #[error("no slot is ready for reading")]
    WouldUnderrun,
    #[error("ring buffer is closed")]
    Closed,
    #[error("the write slot is already held")]
    WriterBusy,
    #[error("the read slot is already held")]
    ReaderBusy,
    #[error("{held} sub-block lock(s) still held at commit")]
    SubBlockHeld { held: usize },
    #[error("invalid ring layout: {0}")]
    InvalidLayout(String),
}

/// Slot count, period shape and sub-block partitioning of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub slots: usize,
    pub presets: Presets,
    /// Sub-blocks per channel.
    pub sub_block_count: usize,
}

impl RingLayout {
    pub fn new(slots: usize, presets: Presets, sub_block_count: usize) -> Self {
        Self {
            slots,
            presets,
            sub_block_count,
        }
    }

    fn validate(&self) -> Result<(), RingError> {
        if self.slots < 2 {
            return Err(RingError::InvalidLayout(format!(
                "at least two slots are required, got {}",
                self.slots
            )));
        }
        if self.presets.buffer_size == 0 || self.presets.channels == 0 {
            return Err(RingError::InvalidLayout("empty period".into()));
        }
        if self.sub_block_count == 0 || self.sub_block_count > self.presets.buffer_size {
            return Err(RingError::InvalidLayout(format!(
                "sub-block count {} must be within 1..={}",
                self.sub_block_count, self.presets.buffer_size
            )));
        }
        Ok(())
    }

    pub fn sub_blocks_per_slot(&self) -> usize {
        self.sub_block_count * self.presets.channels
    }

    /// Channel and frame range covered by sub-block `id`.
    pub fn sub_block(&self, id: usize) -> (usize, Range<usize>) {
        let channel = id / self.sub_block_count;
        let block = id % self.sub_block_count;
        let frames = self.presets.buffer_size;
        let start = block * frames / self.sub_block_count;
        let end = (block + 1) * frames / self.sub_block_count;
        (channel, start..end)
    }
}

struct Slot {
    cells: Box<[UnsafeCell<u8>]>,
    sub_blocks: Box<[Mutex<()>]>,
    held: AtomicUsize,
}

impl Slot {
    fn new(bytes: usize, sub_blocks: usize) -> Self {
        Self {
            cells: (0..bytes).map(|_| UnsafeCell::new(0)).collect(),
            sub_blocks: (0..sub_blocks).map(|_| Mutex::new(())).collect(),
            held: AtomicUsize::new(0),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8.
        self.cells.as_ptr() as *mut u8
    }
}

#[derive(Debug, Default)]
struct Cursor {
    written: u64,
    read: u64,
    writer: bool,
    reader: bool,
    closed: bool,
}

#[derive(Clone, Copy)]
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

pub struct RingBuffer {
    layout: RingLayout,
    slots: Box<[Slot]>,
    cursor: Mutex<Cursor>,
    space: Condvar,
    data: Condvar,
}

// Slot bytes are only reached through `WriteSlot`, `SubBlockGuard` and
// `ReadSlot`. The cursor hands out at most one of each, the writer slot is
// never the reader slot while `written - read < slots`, and sub-blocks cover
// disjoint byte ranges behind their own locks.
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("layout", &self.layout)
            .field("cursor", &*self.cursor.lock())
            .finish()
    }
}

impl RingBuffer {
    pub fn new(layout: RingLayout) -> Result<Self, RingError> {
        layout.validate()?;
        let bytes = layout.presets.period_bytes();
        let sub_blocks = layout.sub_blocks_per_slot();
        let slots = (0..layout.slots)
            .map(|_| Slot::new(bytes, sub_blocks))
            .collect();
        Ok(Self {
            layout,
            slots,
            cursor: Mutex::new(Cursor::default()),
            space: Condvar::new(),
            data: Condvar::new(),
        })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Committed slots not yet consumed.
    pub fn pending(&self) -> usize {
        let cursor = self.cursor.lock();
        (cursor.written - cursor.read) as usize
    }

    pub fn write_index(&self) -> usize {
        (self.cursor.lock().written % self.slots.len() as u64) as usize
    }

    pub fn read_index(&self) -> usize {
        (self.cursor.lock().read % self.slots.len() as u64) as usize
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.lock().closed
    }

    /// Blocks until a slot is free for writing.
    pub fn acquire_write(&self) -> Result<WriteSlot<'_>, RingError> {
        self.acquire_write_with(Wait::Forever)
    }

    /// Fails with [`RingError::WouldOverrun`] instead of blocking.
    pub fn try_acquire_write(&self) -> Result<WriteSlot<'_>, RingError> {
        self.acquire_write_with(Wait::Never)
    }

    pub fn acquire_write_timeout(&self, timeout: Duration) -> Result<WriteSlot<'_>, RingError> {
        self.acquire_write_with(Wait::Until(Instant::now() + timeout))
    }

    /// Blocks until a committed slot is available.
    ///
    /// After [`close`](Self::close) the remaining slots can still be drained;
    /// only an empty closed ring reports [`RingError::Closed`].
    pub fn acquire_read(&self) -> Result<ReadSlot<'_>, RingError> {
        self.acquire_read_with(Wait::Forever)
    }

    /// Fails with [`RingError::WouldUnderrun`] instead of blocking.
    pub fn try_acquire_read(&self) -> Result<ReadSlot<'_>, RingError> {
        self.acquire_read_with(Wait::Never)
    }

    pub fn acquire_read_timeout(&self, timeout: Duration) -> Result<ReadSlot<'_>, RingError> {
        self.acquire_read_with(Wait::Until(Instant::now() + timeout))
    }

    /// Wakes every waiter; writers fail from now on, readers once drained.
    pub fn close(&self) {
        let mut cursor = self.cursor.lock();
        cursor.closed = true;
        tracing::debug!(
            pending = cursor.written - cursor.read,
            "ring buffer closed"
        );
        drop(cursor);
        self.space.notify_all();
        self.data.notify_all();
    }

    /// Empties and reopens a ring nobody is holding a slot of.
    pub fn reset(&self) -> Result<(), RingError> {
        let mut cursor = self.cursor.lock();
        if cursor.writer {
            return Err(RingError::WriterBusy);
        }
        if cursor.reader {
            return Err(RingError::ReaderBusy);
        }
        for slot in self.slots.iter() {
            // No slot is held, so nothing else can observe these bytes.
            unsafe { std::ptr::write_bytes(slot.as_ptr(), 0, slot.cells.len()) };
        }
        tracing::debug!(slots = self.slots.len(), "ring buffer reset");
        *cursor = Cursor::default();
        Ok(())
    }

    /// Waits until the reader has consumed every committed slot.
    ///
    /// Returns `false` when the timeout elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cursor = self.cursor.lock();
        while cursor.written != cursor.read {
            if self.space.wait_until(&mut cursor, deadline).timed_out() {
                return cursor.written == cursor.read;
            }
        }
        true
    }

    fn acquire_write_with(&self, wait: Wait) -> Result<WriteSlot<'_>, RingError> {
        let slots = self.slots.len() as u64;
        let mut cursor = self.cursor.lock();
        loop {
            if cursor.closed {
                return Err(RingError::Closed);
            }
            if cursor.writer {
                return Err(RingError::WriterBusy);
            }
            if cursor.written - cursor.read < slots {
                break;
            }
            if !self.park(&self.space, &mut cursor, wait) {
                return Err(RingError::WouldOverrun {
                    slots: slots as usize,
                });
            }
        }
        cursor.writer = true;
        Ok(WriteSlot {
            ring: self,
            index: (cursor.written % slots) as usize,
            sequence: cursor.written,
            committed: false,
        })
    }

    fn acquire_read_with(&self, wait: Wait) -> Result<ReadSlot<'_>, RingError> {
        let slots = self.slots.len() as u64;
        let mut cursor = self.cursor.lock();
        loop {
            if cursor.reader {
                return Err(RingError::ReaderBusy);
            }
            if cursor.written != cursor.read {
                break;
            }
            if cursor.closed {
                return Err(RingError::Closed);
            }
            if !self.park(&self.data, &mut cursor, wait) {
                return Err(RingError::WouldUnderrun);
            }
        }
        cursor.reader = true;
        Ok(ReadSlot {
            ring: self,
            index: (cursor.read % slots) as usize,
            sequence: cursor.read,
            committed: false,
        })
    }

    /// Returns `false` when the caller must give up waiting.
    fn park(&self, condvar: &Condvar, cursor: &mut MutexGuard<'_, Cursor>, wait: Wait) -> bool {
        match wait {
            Wait::Never => false,
            Wait::Forever => {
                condvar.wait(cursor);
                true
            }
            Wait::Until(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                condvar.wait_until(cursor, deadline);
                true
            }
        }
    }

    fn release_writer(&self, commit: bool) {
        let mut cursor = self.cursor.lock();
        cursor.writer = false;
        if commit {
            cursor.written += 1;
        }
        drop(cursor);
        if commit {
            self.data.notify_one();
        }
        self.space.notify_one();
    }

    fn release_reader(&self, commit: bool) {
        let mut cursor = self.cursor.lock();
        cursor.reader = false;
        if commit {
            cursor.read += 1;
        }
        drop(cursor);
        self.space.notify_all();
        self.data.notify_one();
    }
}

/// The slot at the write index, exclusively owned by the producer.
///
/// Dropping it without [`commit`](Self::commit) abandons the period; the
/// same slot is handed out again by the next acquire.
pub struct WriteSlot<'a> {
    ring: &'a RingBuffer,
    index: usize,
    sequence: u64,
    committed: bool,
}

impl<'a> WriteSlot<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of slots committed before this one.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn presets(&self) -> &Presets {
        &self.ring.layout.presets
    }

    pub fn frames(&self) -> usize {
        self.ring.layout.presets.buffer_size
    }

    pub fn channels(&self) -> usize {
        self.ring.layout.presets.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.ring.layout.presets.format
    }

    pub fn sub_block_count(&self) -> usize {
        self.ring.layout.sub_blocks_per_slot()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let slot = self.slot();
        // `&mut self` rules out live sub-block guards.
        unsafe { std::slice::from_raw_parts_mut(slot.as_ptr(), slot.cells.len()) }
    }

    /// Encodes `sample` at `(frame, channel)` of the interleaved period.
    pub fn write_sample(&mut self, frame: usize, channel: usize, sample: f32) {
        let format = self.format();
        let offset = sample_offset(&self.ring.layout.presets, frame, channel);
        let word = format.word_size();
        format.encode(sample, &mut self.bytes_mut()[offset..offset + word]);
    }

    pub fn silence(&mut self) {
        self.bytes_mut().fill(0);
    }

    /// Locks sub-block `id`, blocking while another worker holds it.
    pub fn lock_sub_block(&self, id: usize) -> SubBlockGuard<'_> {
        let slot = self.slot();
        let lock = slot.sub_blocks[id].lock();
        SubBlockGuard::new(self.ring, slot, id, lock)
    }

    pub fn try_lock_sub_block(&self, id: usize) -> Option<SubBlockGuard<'_>> {
        let slot = self.slot();
        let lock = slot.sub_blocks.get(id)?.try_lock()?;
        Some(SubBlockGuard::new(self.ring, slot, id, lock))
    }

    /// Publishes the slot to the reader and advances the write index.
    pub fn commit(mut self) -> Result<(), RingError> {
        let held = self.slot().held.load(Ordering::Acquire);
        if held != 0 {
            return Err(RingError::SubBlockHeld { held });
        }
        self.committed = true;
        self.ring.release_writer(true);
        Ok(())
    }

    fn slot(&self) -> &'a Slot {
        &self.ring.slots[self.index]
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.release_writer(false);
        }
    }
}

/// Exclusive access to one channel's frame range inside a [`WriteSlot`].
pub struct SubBlockGuard<'a> {
    slot: &'a Slot,
    presets: Presets,
    id: usize,
    channel: usize,
    frames: Range<usize>,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> SubBlockGuard<'a> {
    fn new(ring: &'a RingBuffer, slot: &'a Slot, id: usize, lock: MutexGuard<'a, ()>) -> Self {
        let (channel, frames) = ring.layout.sub_block(id);
        slot.held.fetch_add(1, Ordering::AcqRel);
        Self {
            slot,
            presets: ring.layout.presets,
            id,
            channel,
            frames,
            _lock: lock,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn frames(&self) -> Range<usize> {
        self.frames.clone()
    }

    /// Writes `sample` at period frame `frame`, which must lie in [`frames`](Self::frames).
    pub fn write_sample(&mut self, frame: usize, sample: f32) {
        assert!(
            self.frames.contains(&frame),
            "frame {frame} outside sub-block {} ({:?})",
            self.id,
            self.frames
        );
        let format = self.presets.format;
        let offset = sample_offset(&self.presets, frame, self.channel);
        // The word belongs to this sub-block's channel and frame range,
        // which no other guard covers.
        let word = unsafe {
            std::slice::from_raw_parts_mut(self.slot.as_ptr().add(offset), format.word_size())
        };
        format.encode(sample, word);
    }

    /// Fills the whole sub-block, calling `sample` with each period frame.
    pub fn fill(&mut self, mut sample: impl FnMut(usize) -> f32) {
        for frame in self.frames() {
            self.write_sample(frame, sample(frame));
        }
    }
}

impl Drop for SubBlockGuard<'_> {
    fn drop(&mut self) {
        self.slot.held.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The slot at the read index, exclusively owned by the consumer.
pub struct ReadSlot<'a> {
    ring: &'a RingBuffer,
    index: usize,
    sequence: u64,
    committed: bool,
}

impl ReadSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn presets(&self) -> &Presets {
        &self.ring.layout.presets
    }

    pub fn bytes(&self) -> &[u8] {
        let slot = &self.ring.slots[self.index];
        unsafe { std::slice::from_raw_parts(slot.as_ptr(), slot.cells.len()) }
    }

    pub fn read_sample(&self, frame: usize, channel: usize) -> f32 {
        let presets = &self.ring.layout.presets;
        let offset = sample_offset(presets, frame, channel);
        presets
            .format
            .decode(&self.bytes()[offset..offset + presets.format.word_size()])
    }

    /// Releases the slot back to the producer and advances the read index.
    pub fn commit(mut self) {
        self.committed = true;
        self.ring.release_reader(true);
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.release_reader(false);
        }
    }
}

fn sample_offset(presets: &Presets, frame: usize, channel: usize) -> usize {
    assert!(frame < presets.buffer_size && channel < presets.channels);
    (frame * presets.channels + channel) * presets.format.word_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(slots: usize) -> RingBuffer {
        let presets = Presets::new(2, 48_000, 64, SampleFormat::S16);
        RingBuffer::new(RingLayout::new(slots, presets, 4)).unwrap()
    }

    #[test]
    fn sub_blocks_partition_each_channel() {
        let ring = ring(4);
        let layout = ring.layout();
        assert_eq!(layout.sub_blocks_per_slot(), 8);
        assert_eq!(layout.sub_block(0), (0, 0..16));
        assert_eq!(layout.sub_block(3), (0, 48..64));
        assert_eq!(layout.sub_block(5), (1, 16..32));
    }

    #[test]
    fn abandoned_write_slot_is_reissued() {
        let ring = ring(4);
        let first = ring.try_acquire_write().unwrap();
        assert!(matches!(ring.try_acquire_write(), Err(RingError::WriterBusy)));
        drop(first);
        let again = ring.try_acquire_write().unwrap();
        assert_eq!(again.index(), 0);
        assert_eq!(ring.pending(), 0);
    }

    #[test]
    fn leaked_sub_block_lock_blocks_commit() {
        let ring = ring(4);
        let slot = ring.try_acquire_write().unwrap();
        std::mem::forget(slot.lock_sub_block(2));
        assert_eq!(slot.commit(), Err(RingError::SubBlockHeld { held: 1 }));
    }

    #[test]
    fn empty_ring_reports_underrun() {
        let ring = ring(4);
        assert!(matches!(ring.try_acquire_read(), Err(RingError::WouldUnderrun)));
        assert!(matches!(
            ring.acquire_read_timeout(Duration::from_millis(5)),
            Err(RingError::WouldUnderrun)
        ));
    }

    #[test]
    fn rejects_single_slot_ring() {
        let presets = Presets::default();
        assert!(matches!(
            RingBuffer::new(RingLayout::new(1, presets, 4)),
            Err(RingError::InvalidLayout(_))
        ));
    }
}
