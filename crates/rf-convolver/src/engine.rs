//! Convolution engine
//!
//! Public façade. Owns the plan, the sections evaluated on the audio thread
//! (direct head and inline FFT sections), and the background pipeline:
//!
//! ```text
//! tick(input) ──▶ input feed ──▶ workers (threaded sections) ──▶ section channels
//!     │                                                                │
//!     │                                               assembly (partition order)
//!     │                                                                │
//!     └── direct + inline sections ──(+)◀── AssemblyQueue ◀─────────────┘
//! ```
//!
//! The audio thread never allocates in `tick` and blocks only when the
//! AssemblyQueue is short (underrun), for at most the configured timeout.
//! Workers that stall for longer than the input feed can hold skip ahead on
//! their own (see `threaded_section`), so a long underrun degrades to
//! silence and never desynchronizes the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::assembly::{AssemblyInput, AssemblyQueue, AssemblyStage, READ_CHUNK};
use crate::direct::DirectSection;
use crate::error::fatal;
use crate::impulse::{ImpulseResponse, validate_samples};
use crate::inline_section::InlineSection;
use crate::listener::{ConvolutionListener, NullListener};
use crate::planner::{PartitionPlan, PartitionPlanner, PlannerConfig};
use crate::ring_channel::{ChannelHandle, RingChannel, RingWriter};
use crate::threaded_section::{SectionStats, SectionStatsSnapshot};
use crate::worker::{SectionSeed, StartupLatch, WorkerContext, WorkerThreadGroup};
use crate::{ConvolutionError, ConvolutionResult, EngineConfig, Sample, SchedulingPolicy};

// ═══════════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine counters (atomic, readable from any thread)
#[derive(Debug, Default)]
pub struct EngineStats {
    blocks: AtomicU64,
    samples: AtomicU64,
    underruns: AtomicU64,
    substituted_samples: AtomicU64,
}

impl EngineStats {
    #[inline]
    fn record_block(&self, frames: usize) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_substituted(&self, samples: usize) {
        self.substituted_samples
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            blocks: self.blocks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            substituted_samples: self.substituted_samples.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Blocks processed (after splitting oversized host blocks)
    pub blocks: u64,
    /// Samples processed
    pub samples: u64,
    /// Blocks that had to wait for background output
    pub underruns: u64,
    /// Background samples replaced with silence after a timeout
    pub substituted_samples: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BACKGROUND PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

struct Background {
    input: RingWriter,
    queue: AssemblyQueue,
    workers: WorkerThreadGroup,
    assembly: AssemblyStage,
    /// Every channel, for shutdown
    channels: Vec<ChannelHandle>,
    section_stats: Vec<(usize, usize, Arc<SectionStats>)>,
}

impl Background {
    fn start(
        plan: &PartitionPlan,
        impulse: &Arc<[Sample]>,
        config: &EngineConfig,
    ) -> ConvolutionResult<Self> {
        let wait = config.wait;
        let max_block = plan.max_block_size;
        let queue_capacity = AssemblyQueue::capacity_for(max_block);

        // Slowest reader lags by its offset plus one FFT window; the second
        // impulse length is headroom for a section catching up after a resync
        let input_capacity =
            2 * plan.impulse_len + 2 * plan.largest_threaded_size() + 4 * max_block + queue_capacity;
        let input = RingChannel::broadcast(input_capacity, wait);
        let (queue_tx, queue) = AssemblyQueue::channel(max_block, wait);

        let mut channels = vec![input.handle(), queue.handle()];
        let mut seeds = Vec::new();
        let mut assembly_inputs = Vec::new();
        let mut section_stats = Vec::new();

        for (index, descriptor) in plan.threaded_sections() {
            let capacity = 4 * descriptor.size + 2 * max_block + queue_capacity;
            let (tx, rx) = RingChannel::spsc(capacity, wait);
            let stats = Arc::new(SectionStats::default());

            channels.push(tx.handle());
            section_stats.push((index, descriptor.size, Arc::clone(&stats)));
            seeds.push(SectionSeed {
                index,
                descriptor: *descriptor,
                input: input.subscribe(),
                output: tx,
                stats,
            });
            assembly_inputs.push(AssemblyInput {
                offset: descriptor.section_delay,
                reader: rx,
            });
        }

        let latch = Arc::new(StartupLatch::new(plan.threads.len() + 1));
        let workers = WorkerThreadGroup::spawn(
            plan,
            seeds,
            WorkerContext {
                impulse: Arc::clone(impulse),
                input: input.handle(),
                max_block,
                scheduling: config.scheduling,
                wait,
                latch: Arc::clone(&latch),
            },
        );
        let chunk = READ_CHUNK.min(plan.smallest_threaded_size());
        let assembly = AssemblyStage::spawn(
            assembly_inputs,
            queue_tx,
            chunk,
            config.scheduling,
            Arc::clone(&latch),
        );

        let mut background = Self {
            input,
            queue,
            workers,
            assembly,
            channels,
            section_stats,
        };

        if let Err(e) = latch.wait() {
            background.shutdown();
            return Err(e);
        }
        Ok(background)
    }

    /// Fill `out` with assembled background output. Returns whether the
    /// block underran.
    fn pull(
        &mut self,
        out: &mut [Sample],
        timeout: Duration,
        stats: &EngineStats,
        listener: &dyn ConvolutionListener,
    ) -> ConvolutionResult<bool> {
        let mut filled = self.queue.try_fill(out)?;
        if filled == out.len() {
            return Ok(false);
        }

        stats.record_underrun();
        listener.on_underrun();

        let deadline = Instant::now() + timeout;
        while filled < out.len() {
            match self.queue.wait(out.len() - filled, Some(deadline)) {
                Ok(()) => filled += self.queue.try_fill(&mut out[filled..])?,
                Err(ConvolutionError::Timeout) => {
                    // Silence now, drop the late samples when they arrive
                    let missing = out.len() - filled;
                    out[filled..].fill(0.0);
                    self.queue.add_debt(missing);
                    stats.record_substituted(missing);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Close every channel and join every thread. Idempotent.
    fn shutdown(&mut self) {
        for channel in &self.channels {
            channel.close();
        }
        self.workers.close();
        self.workers.join();
        self.assembly.join();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ConvolutionEngine {
    config: EngineConfig,
    plan: PartitionPlan,
    /// Direct head, evaluated per sample
    direct: Vec<DirectSection>,
    /// FFT sections too early in the impulse for a worker to meet
    inline: Vec<InlineSection>,
    background: Option<Background>,
    listener: Arc<dyn ConvolutionListener>,
    stats: Arc<EngineStats>,
    underrun_timeout: Duration,
    in_underrun: bool,
    ready_pending: bool,
    closed: bool,
}

impl ConvolutionEngine {
    pub fn new(
        impulse: &[Sample],
        sample_rate: f64,
        max_block_size: usize,
        scheduling: SchedulingPolicy,
    ) -> ConvolutionResult<Self> {
        let config = EngineConfig::new(sample_rate, max_block_size).with_scheduling(scheduling);
        Self::with_config(impulse, config)
    }

    pub fn with_config(impulse: &[Sample], config: EngineConfig) -> ConvolutionResult<Self> {
        Self::with_listener(impulse, config, Arc::new(NullListener))
    }

    /// Build from a loaded (multi-channel) impulse. The impulse must already
    /// be at the engine's sample rate.
    pub fn from_impulse(
        impulse: &ImpulseResponse,
        channel: u8,
        config: EngineConfig,
    ) -> ConvolutionResult<Self> {
        impulse.validate()?;
        if (impulse.sample_rate - config.sample_rate).abs() > f64::EPSILON {
            return Err(ConvolutionError::Configuration(format!(
                "impulse at {} Hz, engine at {} Hz",
                impulse.sample_rate, config.sample_rate
            )));
        }
        Self::with_config(&impulse.channel(channel)?, config)
    }

    /// Plan, allocate and start the background pipeline. Blocks until every
    /// background thread is running or one of them failed to start.
    pub fn with_listener(
        impulse: &[Sample],
        config: EngineConfig,
        listener: Arc<dyn ConvolutionListener>,
    ) -> ConvolutionResult<Self> {
        config.validate()?;
        validate_samples(impulse)?;

        let plan = PartitionPlanner::new(PlannerConfig::from(&config)).plan(
            impulse.len(),
            config.sample_rate,
            config.max_block_size,
        )?;
        let impulse: Arc<[Sample]> = Arc::from(impulse);

        let direct = plan
            .direct_sections()
            .map(|s| DirectSection::new(&impulse[s.impulse_offset..s.end()]))
            .collect();
        let inline = plan
            .inline_sections()
            .map(|s| InlineSection::new(s, &impulse))
            .collect::<ConvolutionResult<Vec<_>>>()?;

        let background = if plan.needs_workers() {
            Some(Background::start(&plan, &impulse, &config)?)
        } else {
            None
        };

        log::info!(
            "Convolution engine: {} samples @ {} Hz, {} sections ({} inline, {} threaded) on {} workers, {} MACs/sample direct",
            plan.impulse_len,
            plan.sample_rate,
            plan.sections.len(),
            plan.inline_sections().count(),
            plan.threaded_sections().count(),
            plan.threads.len(),
            plan.direct_cost()
        );
        for thread in &plan.threads {
            log::debug!(
                "  worker {}: sections {:?}, est. load {:.3}",
                thread.thread_id,
                thread.sections,
                thread.estimated_load
            );
        }

        Ok(Self {
            underrun_timeout: config.underrun_timeout(),
            config,
            plan,
            direct,
            inline,
            background,
            listener,
            stats: Arc::new(EngineStats::default()),
            in_underrun: false,
            ready_pending: true,
            closed: false,
        })
    }

    /// Convolve one host block. `input` and `output` carry the same frame
    /// count; blocks larger than `max_block_size` are split.
    pub fn tick(&mut self, input: &[Sample], output: &mut [Sample]) -> ConvolutionResult<()> {
        if self.closed {
            return Err(ConvolutionError::Closed);
        }

        let frames = input.len().min(output.len());
        let max_block = self.config.max_block_size;
        let mut start = 0;
        while start < frames {
            let end = (start + max_block).min(frames);
            if let Err(e) = self.process_block(&input[start..end], &mut output[start..end]) {
                if e.is_fatal() {
                    fatal("Convolution audio thread", &e);
                }
                return Err(e);
            }
            start = end;
        }
        Ok(())
    }

    fn process_block(&mut self, input: &[Sample], output: &mut [Sample]) -> ConvolutionResult<()> {
        let underrun = match self.background.as_mut() {
            Some(background) => {
                background.input.write(input)?;
                background.pull(
                    output,
                    self.underrun_timeout,
                    &self.stats,
                    self.listener.as_ref(),
                )?
            }
            None => {
                output.fill(0.0);
                false
            }
        };

        for section in &mut self.direct {
            section.process_add(input, output);
        }
        for section in &mut self.inline {
            section.process_add(input, output)?;
        }
        self.stats.record_block(input.len());

        // Notifications at block boundaries only
        if underrun {
            if !self.in_underrun {
                self.in_underrun = true;
                log::warn!(
                    "Convolution underrun: background output late (total {})",
                    self.underrun_count()
                );
            }
        } else if self.in_underrun || self.ready_pending {
            if self.in_underrun {
                log::info!("Convolution background output back in time");
            }
            self.in_underrun = false;
            self.ready_pending = false;
            self.listener.on_ready();
        }
        Ok(())
    }

    /// Close channels and join every background thread. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(background) = self.background.as_mut() {
            background.shutdown();
        }
        log::debug!("Convolution engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn underrun_count(&self) -> u64 {
        self.stats.underruns.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters for a monitoring thread.
    pub fn stats_handle(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn section_stats(&self) -> Vec<SectionStatsSnapshot> {
        self.background
            .as_ref()
            .map(|b| {
                b.section_stats
                    .iter()
                    .map(|(index, size, stats)| stats.snapshot(*index, *size))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Output latency in samples: always zero.
    pub fn latency(&self) -> usize {
        self.plan.latency()
    }

    /// Background worker threads (the assembly thread not included).
    pub fn thread_count(&self) -> usize {
        self.background
            .as_ref()
            .map_or(0, |b| b.workers.thread_count())
    }

    pub fn underrun_timeout(&self) -> Duration {
        self.underrun_timeout
    }

    pub fn set_underrun_timeout(&mut self, timeout: Duration) {
        self.underrun_timeout = timeout;
    }

    /// Diagnostics: stop workers from picking up new blocks.
    pub fn suspend_workers(&self) {
        if let Some(background) = &self.background {
            background.workers.suspend();
        }
    }

    pub fn resume_workers(&self) {
        if let Some(background) = &self.background {
            background.workers.resume();
        }
    }
}

impl Drop for ConvolutionEngine {
    fn drop(&mut self) {
        self.close();
    }
}
