//! Ring channels between the audio thread and the background stages
//!
//! One writer publishes a monotonic write count with release ordering;
//! readers copy samples out of a power-of-two circular buffer.
//!
//! Two flavours:
//! - **SPSC** (`RingChannel::spsc`): the reader publishes its read count, the
//!   writer never overwrites unread data. Used for section outputs and the
//!   assembly queue.
//! - **Broadcast** (`RingChannel::broadcast`): any number of readers, each
//!   with its own cursor, no back-pressure on the writer. Used for the input
//!   feed, where the audio thread must never wait. A reader that has been
//!   lapped reports `SynchronizationLost` and may `seek` forward.
//!
//! Broadcast writers claim the range they are about to overwrite before
//! touching the slots, and readers check the claim after copying, so a copy
//! that raced an overwrite is always caught.
//!
//! Readers borrow up to [`BORROW_LIMIT`] samples per fenced load of the write
//! count. Waiting spins first (crossbeam `Backoff`) and then parks on a
//! condition variable in short slices.
//!
//! CRITICAL: `write` never blocks. Only `read`, `write_blocking` and the
//! explicit wait calls may park the calling thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};
use std::time::Instant;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::{ConvolutionError, ConvolutionResult, Sample, WaitPolicy};

/// Samples a reader may consume per fenced load of the write count.
pub const BORROW_LIMIT: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

struct Shared {
    /// Sample storage (f64 bit patterns)
    buffer: Box<[AtomicU64]>,
    /// Buffer capacity (power of 2)
    capacity: usize,
    /// Capacity mask for efficient modulo
    mask: usize,
    /// Total samples ever written (only modified by the writer)
    write_count: CachePadded<AtomicUsize>,
    /// End of the range the writer is storing into (broadcast only)
    claim_count: CachePadded<AtomicUsize>,
    /// Total samples consumed by the SPSC reader
    read_count: CachePadded<AtomicUsize>,
    /// Writer respects `read_count`
    flow_controlled: bool,
    closed: AtomicBool,
    /// Threads currently parked (or about to park) on `signal`
    waiters: AtomicUsize,
    lock: Mutex<()>,
    signal: Condvar,
    wait: WaitPolicy,
}

impl Shared {
    fn new(min_capacity: usize, flow_controlled: bool, wait: WaitPolicy) -> Self {
        let capacity = min_capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            capacity,
            mask: capacity - 1,
            write_count: CachePadded::new(AtomicUsize::new(0)),
            claim_count: CachePadded::new(AtomicUsize::new(0)),
            read_count: CachePadded::new(AtomicUsize::new(0)),
            flow_controlled,
            closed: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            signal: Condvar::new(),
            wait,
        }
    }

    #[inline(always)]
    fn load(&self, index: usize) -> Sample {
        Sample::from_bits(self.buffer[index & self.mask].load(Ordering::Relaxed))
    }

    #[inline(always)]
    fn store(&self, index: usize, sample: Sample) {
        self.buffer[index & self.mask].store(sample.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wake parked threads. Lock-free unless someone is actually waiting.
    #[inline]
    fn notify(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.signal.notify_all();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Taking the lock orders the flag against waiters between check and park
        drop(self.lock.lock());
        self.signal.notify_all();
    }

    /// Spin, then park until `ready` holds, the channel closes, or `deadline`
    /// passes.
    fn wait_until(
        &self,
        mut ready: impl FnMut() -> bool,
        deadline: Option<Instant>,
    ) -> ConvolutionResult<()> {
        let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| Instant::now() >= d);

        let backoff = Backoff::new();
        for _ in 0..self.wait.spin_rounds {
            if self.is_closed() {
                return Err(ConvolutionError::Closed);
            }
            if ready() {
                return Ok(());
            }
            if expired(deadline) {
                return Err(ConvolutionError::Timeout);
            }
            backoff.snooze();
        }

        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let slice = self.wait.park_slice();
        let result = loop {
            if self.is_closed() {
                break Err(ConvolutionError::Closed);
            }
            if ready() {
                break Ok(());
            }
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(ConvolutionError::Timeout);
                    }
                    slice.min(deadline - now)
                }
                None => slice,
            };
            // A missed notification costs at most one slice
            self.signal.wait_for(&mut guard, timeout);
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Constructors for the two channel flavours.
pub struct RingChannel;

impl RingChannel {
    /// Single-producer single-consumer channel with back-pressure.
    pub fn spsc(min_capacity: usize, wait: WaitPolicy) -> (RingWriter, RingReader) {
        let shared = Arc::new(Shared::new(min_capacity, true, wait));
        let reader = RingReader::new(Arc::clone(&shared), true);
        (RingWriter { shared, cursor: 0 }, reader)
    }

    /// Single-writer channel without back-pressure. Readers come from
    /// [`RingWriter::subscribe`].
    pub fn broadcast(min_capacity: usize, wait: WaitPolicy) -> RingWriter {
        RingWriter {
            shared: Arc::new(Shared::new(min_capacity, false, wait)),
            cursor: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WRITER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RingWriter {
    shared: Arc<Shared>,
    /// Local copy of the write count
    cursor: usize,
}

impl RingWriter {
    /// Space the writer may fill without overwriting unread samples.
    #[inline]
    pub fn free(&self) -> usize {
        if self.shared.flow_controlled {
            let read = self.shared.read_count.load(Ordering::Acquire);
            self.shared.capacity - self.cursor.wrapping_sub(read)
        } else {
            self.shared.capacity
        }
    }

    /// Append samples and publish them. Never blocks.
    pub fn write(&mut self, samples: &[Sample]) -> ConvolutionResult<()> {
        if self.shared.is_closed() {
            return Err(ConvolutionError::Closed);
        }
        let free = self.free();
        if samples.len() > free {
            return Err(ConvolutionError::Overrun {
                requested: samples.len(),
                free,
            });
        }
        if samples.is_empty() {
            return Ok(());
        }

        let end = self.cursor.wrapping_add(samples.len());
        self.claim(end);
        for (i, &sample) in samples.iter().enumerate() {
            self.shared.store(self.cursor.wrapping_add(i), sample);
        }
        self.cursor = end;
        self.shared.write_count.store(end, Ordering::SeqCst);
        self.shared.notify();
        Ok(())
    }

    /// Announce that slots up to `end` are about to be overwritten. The
    /// release fence orders the claim before every following sample store.
    #[inline]
    fn claim(&self, end: usize) {
        if !self.shared.flow_controlled {
            self.shared.claim_count.store(end, Ordering::Relaxed);
            fence(Ordering::Release);
        }
    }

    /// Park until `needed` samples fit (SPSC only; broadcast always fits).
    pub fn wait_for_space(&self, needed: usize, deadline: Option<Instant>) -> ConvolutionResult<()> {
        let shared = &self.shared;
        let needed = needed.min(shared.capacity);
        let cursor = self.cursor;
        shared.wait_until(
            || {
                !shared.flow_controlled || {
                    let read = shared.read_count.load(Ordering::SeqCst);
                    shared.capacity - cursor.wrapping_sub(read) >= needed
                }
            },
            deadline,
        )
    }

    /// Append samples, parking while the reader frees space.
    pub fn write_blocking(&mut self, samples: &[Sample]) -> ConvolutionResult<()> {
        let mut offset = 0;
        while offset < samples.len() {
            let free = self.free();
            if free == 0 {
                self.wait_for_space(1, None)?;
                continue;
            }
            let chunk = free.min(samples.len() - offset);
            self.write(&samples[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    /// New reader positioned at the current write count.
    pub fn subscribe(&self) -> RingReader {
        debug_assert!(
            !self.shared.flow_controlled,
            "SPSC channels have exactly one reader"
        );
        let mut reader = RingReader::new(Arc::clone(&self.shared), false);
        reader.cursor = self.cursor;
        reader.checked_from = self.cursor;
        reader
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.cursor
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// READER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RingReader {
    shared: Arc<Shared>,
    /// Samples consumed so far
    cursor: usize,
    /// Samples known available without another fenced load
    borrowed: usize,
    /// Start of the samples copied since the last lap check
    checked_from: usize,
    /// SPSC reader: publish `read_count` for the writer
    publishes: bool,
}

impl RingReader {
    fn new(shared: Arc<Shared>, publishes: bool) -> Self {
        Self {
            shared,
            cursor: 0,
            borrowed: 0,
            checked_from: 0,
            publishes,
        }
    }

    /// Fenced load of the write count. Validates everything copied since the
    /// previous check and re-borrows.
    fn refresh(&mut self) -> ConvolutionResult<usize> {
        // Orders the preceding sample loads before the claim load: a sample
        // stored after a claim makes that claim visible here
        fence(Ordering::Acquire);
        if !self.shared.flow_controlled {
            let claimed = self.shared.claim_count.load(Ordering::Relaxed);
            if claimed.wrapping_sub(self.checked_from) > self.shared.capacity {
                return Err(ConvolutionError::SynchronizationLost {
                    read: self.checked_from,
                    written: claimed,
                    capacity: self.shared.capacity,
                });
            }
        }
        let written = self.shared.write_count.load(Ordering::Acquire);
        self.checked_from = self.cursor;
        let available = written.wrapping_sub(self.cursor);
        self.borrowed = available.min(BORROW_LIMIT);
        Ok(available)
    }

    #[inline]
    fn publish(&self) {
        if self.publishes {
            self.shared.read_count.store(self.cursor, Ordering::SeqCst);
            self.shared.notify();
        }
    }

    /// Samples written but not yet consumed by this reader.
    #[inline]
    pub fn available(&self) -> usize {
        self.shared
            .write_count
            .load(Ordering::Acquire)
            .wrapping_sub(self.cursor)
    }

    /// Copy as many samples as are available, up to `out.len()`. Never blocks.
    pub fn try_read(&mut self, out: &mut [Sample]) -> ConvolutionResult<usize> {
        if self.shared.is_closed() {
            return Err(ConvolutionError::Closed);
        }

        let mut done = 0;
        while done < out.len() {
            if self.borrowed == 0 && self.refresh()? == 0 {
                break;
            }
            let n = self.borrowed.min(out.len() - done);
            for (i, slot) in out[done..done + n].iter_mut().enumerate() {
                *slot = self.shared.load(self.cursor.wrapping_add(i));
            }
            self.cursor = self.cursor.wrapping_add(n);
            self.borrowed -= n;
            done += n;
        }

        if self.checked_from != self.cursor {
            self.refresh()?;
        }
        if done > 0 {
            self.publish();
        }
        Ok(done)
    }

    /// Fill `out` completely, parking while the writer catches up.
    pub fn read(&mut self, out: &mut [Sample]) -> ConvolutionResult<()> {
        let mut done = self.try_read(out)?;
        while done < out.len() {
            let wanted = (out.len() - done).min(self.shared.capacity);
            self.wait_available(wanted, None)?;
            done += self.try_read(&mut out[done..])?;
        }
        Ok(())
    }

    /// Park until at least `min` samples are available.
    pub fn wait_available(&self, min: usize, deadline: Option<Instant>) -> ConvolutionResult<()> {
        let shared = &self.shared;
        let target = self.cursor.wrapping_add(min);
        shared.wait_until(
            || {
                let written = shared.write_count.load(Ordering::SeqCst);
                written.wrapping_sub(target) as isize >= 0
            },
            deadline,
        )
    }

    /// Discard up to `count` available samples. Never blocks.
    pub fn skip(&mut self, count: usize) -> ConvolutionResult<usize> {
        if self.shared.is_closed() {
            return Err(ConvolutionError::Closed);
        }
        let skipped = count.min(self.available());
        if skipped > 0 {
            self.cursor = self.cursor.wrapping_add(skipped);
            self.checked_from = self.cursor;
            self.borrowed = 0;
            self.publish();
        }
        Ok(skipped)
    }

    /// Move a broadcast reader to stream position `position`, dropping any
    /// borrowed samples. Used to recover after being lapped.
    pub fn seek(&mut self, position: usize) {
        debug_assert!(!self.publishes, "SPSC readers cannot seek");
        self.cursor = position;
        self.checked_from = position;
        self.borrowed = 0;
    }

    /// Samples consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Samples published by the writer so far.
    #[inline]
    pub fn write_count(&self) -> usize {
        self.shared.write_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn borrowed(&self) -> usize {
        self.borrowed
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Side-less view of a channel: close it, observe it, wait on its writer.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    pub fn close(&self) {
        self.shared.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    #[inline]
    pub fn write_count(&self) -> usize {
        self.shared.write_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Park until the writer has published at least `target` samples.
    pub fn wait_for_write_count(
        &self,
        target: usize,
        deadline: Option<Instant>,
    ) -> ConvolutionResult<usize> {
        let shared = &self.shared;
        shared.wait_until(
            || shared.write_count.load(Ordering::SeqCst) >= target,
            deadline,
        )?;
        Ok(self.write_count())
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("capacity", &self.shared.capacity)
            .field("write_count", &self.write_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
