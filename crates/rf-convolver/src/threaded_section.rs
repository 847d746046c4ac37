//! FFT section bound to its channels
//!
//! Reads its input from the shared input feed, writes finished blocks into a
//! private SPSC channel that the assembly stage drains.
//!
//! The input feed never waits for workers. A section that falls so far
//! behind that its unread input is about to be overwritten resynchronizes:
//! every block whose output position the audio thread has already passed
//! (and replaced with silence) is published as silence, the overlap window
//! is re-primed from input that is still intact, and computation resumes at
//! the first block the audio thread has not reached yet.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::fft_section::FftSection;
use crate::planner::SectionDescriptor;
use crate::ring_channel::{RingReader, RingWriter};
use crate::{ConvolutionError, ConvolutionResult, Sample};

/// Per-section counters, shared with the engine for diagnostics.
#[derive(Debug, Default)]
pub struct SectionStats {
    blocks: AtomicU64,
    late_blocks: AtomicU64,
    resyncs: AtomicU64,
}

impl SectionStats {
    pub fn snapshot(&self, section: usize, size: usize) -> SectionStatsSnapshot {
        SectionStatsSnapshot {
            section,
            size,
            blocks: self.blocks.load(Ordering::Relaxed),
            late_blocks: self.late_blocks.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionStatsSnapshot {
    /// Index into the partition plan
    pub section: usize,
    pub size: usize,
    /// Blocks computed
    pub blocks: u64,
    /// Blocks published after the audio thread had already reached them
    pub late_blocks: u64,
    /// Times the section skipped ahead after falling behind the input feed
    pub resyncs: u64,
}

pub struct ThreadedSection {
    index: usize,
    descriptor: SectionDescriptor,
    fft: FftSection,
    input: RingReader,
    output: RingWriter,
    /// Output samples produced so far
    current_sample: usize,
    /// Index of the next block to compute
    blocks: usize,
    /// Silent blocks owed to the output before block `blocks`
    silence_blocks: usize,
    /// Largest host block; bounds how far the writer runs ahead of the stream
    max_block: usize,
    /// Unread input beyond which the section resynchronizes
    lag_limit: usize,
    block: Vec<Sample>,
    stats: Arc<SectionStats>,
}

impl ThreadedSection {
    pub fn new(
        index: usize,
        descriptor: SectionDescriptor,
        impulse: &[Sample],
        input: RingReader,
        output: RingWriter,
        stats: Arc<SectionStats>,
        max_block: usize,
    ) -> ConvolutionResult<Self> {
        let fft = FftSection::new(descriptor.size, descriptor.impulse_offset, impulse)?;
        let lag_limit = input.capacity().saturating_sub(4 * max_block);

        Ok(Self {
            index,
            descriptor,
            fft,
            input,
            output,
            current_sample: 0,
            blocks: 0,
            silence_blocks: 0,
            max_block,
            lag_limit,
            block: vec![0.0; descriptor.size],
            stats,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn descriptor(&self) -> &SectionDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn current_sample(&self) -> usize {
        self.current_sample
    }

    /// Input write count needed before the next block can run.
    #[inline]
    pub fn next_trigger(&self) -> usize {
        self.descriptor.trigger(self.blocks)
    }

    /// Silence is owed or input for the next block is published.
    #[inline]
    pub fn has_work(&self, write_count: usize) -> bool {
        self.silence_blocks > 0 || write_count >= self.next_trigger()
    }

    /// There is work and the output channel can take one block.
    #[inline]
    pub fn is_ready(&self, write_count: usize) -> bool {
        self.has_work(write_count) && self.output.free() >= self.descriptor.size
    }

    /// Park until the output channel can take one more block.
    pub fn wait_for_output_space(&self, deadline: Option<Instant>) -> ConvolutionResult<()> {
        self.output.wait_for_space(self.descriptor.size, deadline)
    }

    /// Publish one block (owed silence first, else a computed one). Call
    /// only when `is_ready`.
    pub fn execute(&mut self) -> ConvolutionResult<()> {
        if self.silence_blocks > 0 {
            self.block.fill(0.0);
            self.output.write(&self.block)?;
            self.silence_blocks -= 1;
            self.current_sample += self.descriptor.size;
            return Ok(());
        }

        let unread = self.input.write_count().wrapping_sub(self.input.position());
        if unread > self.lag_limit {
            return self.resync();
        }
        match self.input.read(&mut self.block) {
            Ok(()) => {}
            Err(ConvolutionError::SynchronizationLost { .. }) => return self.resync(),
            Err(e) => return Err(e),
        }

        // Output index (in the engine's stream) of this block's first sample
        let due = self.descriptor.section_delay + self.current_sample;

        if let Some(out) = self.fft.execute(&self.block)? {
            self.output.write(out)?;
        }

        let written = self.input.position() + self.input.available();
        if written > due {
            self.stats.late_blocks.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.blocks.fetch_add(1, Ordering::Relaxed);
        self.current_sample += self.descriptor.size;
        self.blocks += 1;
        Ok(())
    }

    /// Skip ahead to the first block whose output the audio thread cannot
    /// have passed yet. Retries if the input moves on while priming.
    fn resync(&mut self) -> ConvolutionResult<()> {
        let size = self.descriptor.size;
        loop {
            // The audio thread has consumed its stream up to at least
            // `written - max_block`; outputs before that were substituted
            let written = self.input.write_count();
            let settled = written.saturating_sub(self.max_block + self.descriptor.section_delay);
            let target = (settled / size).max(self.blocks + 1);

            self.fft.reset();
            self.input.seek((target - 1) * size);
            match self.input.read(&mut self.block) {
                Ok(()) => {}
                Err(ConvolutionError::SynchronizationLost { .. }) => continue,
                Err(e) => return Err(e),
            }
            // Primes the overlap window; the output belongs to a skipped block
            self.fft.execute(&self.block)?;

            log::warn!(
                "Section {} ({} samples) fell behind the input feed: skipping blocks {}..{}",
                self.index,
                size,
                self.blocks,
                target
            );
            self.silence_blocks += target - self.blocks;
            self.blocks = target;
            self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    }

    /// Close the output channel so the assembly stage stops waiting on it.
    pub fn close(&self) {
        self.output.close();
    }
}
