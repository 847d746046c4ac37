//! Partition planning
//!
//! Splits an impulse response into a short direct head, FFT sections run
//! inline on the audio thread, and FFT sections of doubling size run by
//! worker threads. The threaded sections are then spread over a small pool
//! of threads.
//!
//! ```text
//! impulse:  |d| 64|128 |128|128| 256 | 256 |  512  |  512  | ...
//! offset:   0  64  128 256 384  512   768  1024    1536
//!           └─┘└──────┘└──────────────────────────────────────
//!          direct inline            threaded
//! ```
//!
//! The direct head is capped by a fixed budget of multiply-accumulates per
//! sample, whatever the block size. An inline section of size N needs an
//! offset of at least N: its block completes one sample before its output
//! is due. A threaded section of size N needs an offset of at least 2N and
//! N no smaller than the host block, which leaves one full period for the
//! worker. Together they keep the engine latency-free.

use serde::Serialize;

use crate::config::{DEFAULT_DIRECT_BUDGET, MIN_SECTION_SIZE};
use crate::{ConvolutionError, ConvolutionResult, EngineConfig};

/// Assumed sustained FFT throughput of one core, for load estimates only.
const ESTIMATED_FLOPS_PER_THREAD: f64 = 1.0e9;
/// A trailing inline section is zero-padded rather than shrunk below this.
const MIN_INLINE_SIZE: usize = 16;

// ============ Section Descriptor ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Time-domain, evaluated inline on the audio thread
    Direct,
    /// Overlap-save FFT, evaluated inline on the audio thread
    Inline,
    /// Overlap-save FFT, executed on a worker thread
    Threaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionDescriptor {
    pub kind: SectionKind,
    /// Direct taps, or FFT block length (power of two)
    pub size: usize,
    /// Impulse samples covered; below `size` only for a zero-padded last section
    pub taps: usize,
    /// Start of the covered range within the impulse
    pub impulse_offset: usize,
    /// Input samples that must exist before the first FFT window starts
    pub input_delay: usize,
    /// Delay of this section's contribution
    pub section_delay: usize,
    /// Worker thread, `None` unless threaded
    pub thread_id: Option<usize>,
}

impl SectionDescriptor {
    fn direct(taps: usize) -> Self {
        Self {
            kind: SectionKind::Direct,
            size: taps,
            taps,
            impulse_offset: 0,
            input_delay: 0,
            section_delay: 0,
            thread_id: None,
        }
    }

    fn inline(impulse_offset: usize, size: usize, taps: usize) -> Self {
        Self {
            kind: SectionKind::Inline,
            size,
            taps,
            impulse_offset,
            input_delay: impulse_offset - size,
            section_delay: impulse_offset,
            thread_id: None,
        }
    }

    fn threaded(impulse_offset: usize, size: usize, taps: usize) -> Self {
        Self {
            kind: SectionKind::Threaded,
            size,
            taps,
            impulse_offset,
            input_delay: impulse_offset - 2 * size,
            section_delay: impulse_offset,
            thread_id: None,
        }
    }

    /// End of the covered impulse range.
    #[inline]
    pub fn end(&self) -> usize {
        self.impulse_offset + self.taps
    }

    #[inline]
    pub fn is_fft(&self) -> bool {
        self.kind != SectionKind::Direct
    }

    #[inline]
    pub fn is_threaded(&self) -> bool {
        self.kind == SectionKind::Threaded
    }

    /// Input write count at which output block `block` can be computed.
    #[inline]
    pub fn trigger(&self, block: usize) -> usize {
        self.input_delay + (block + 1) * self.size
    }

    /// Estimated floating point operations per output sample.
    pub fn cost_per_sample(&self) -> f64 {
        match self.kind {
            SectionKind::Direct => 2.0 * self.taps as f64,
            SectionKind::Inline | SectionKind::Threaded => {
                // Forward + inverse real FFT of 2N, N+1 complex products, per N outputs
                let fft_len = 2.0 * self.size as f64;
                5.0 * fft_len.log2() + 6.0
            }
        }
    }
}

// ============ Plan ============

/// Sections hosted by one worker thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadPlan {
    pub thread_id: usize,
    /// 0 is the most urgent (smallest sections)
    pub priority_rank: usize,
    /// Indices into `PartitionPlan::sections`, smallest first
    pub sections: Vec<usize>,
    /// Estimated fraction of one core
    pub estimated_load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionPlan {
    pub impulse_len: usize,
    pub sample_rate: f64,
    pub max_block_size: usize,
    /// Direct taps allowed on the audio thread
    pub direct_budget: usize,
    /// Smallest threaded section size the plan may use
    pub min_threaded_size: usize,
    /// Ordered by offset (and therefore by section delay)
    pub sections: Vec<SectionDescriptor>,
    pub threads: Vec<ThreadPlan>,
}

impl PartitionPlan {
    pub fn direct_sections(&self) -> impl Iterator<Item = &SectionDescriptor> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Direct)
    }

    pub fn inline_sections(&self) -> impl Iterator<Item = &SectionDescriptor> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Inline)
    }

    pub fn threaded_sections(&self) -> impl Iterator<Item = (usize, &SectionDescriptor)> {
        self.sections.iter().enumerate().filter(|(_, s)| s.is_threaded())
    }

    /// True when the impulse fits the direct budget.
    pub fn is_direct_only(&self) -> bool {
        self.sections.iter().all(|s| s.kind == SectionKind::Direct)
    }

    /// True when some sections run on worker threads.
    pub fn needs_workers(&self) -> bool {
        !self.threads.is_empty()
    }

    pub fn largest_threaded_size(&self) -> usize {
        self.threaded_sections().map(|(_, s)| s.size).max().unwrap_or(0)
    }

    pub fn smallest_threaded_size(&self) -> usize {
        self.threaded_sections().map(|(_, s)| s.size).min().unwrap_or(0)
    }

    /// Direct multiply-accumulates per sample on the audio thread.
    pub fn direct_cost(&self) -> usize {
        self.direct_sections().map(|s| s.taps).sum()
    }

    /// Estimated FFT flops per sample spent inline on the audio thread.
    pub fn inline_cost(&self) -> f64 {
        self.inline_sections().map(SectionDescriptor::cost_per_sample).sum()
    }

    /// Total delay before the engine's output is valid: always zero.
    pub fn latency(&self) -> usize {
        0
    }
}

// ============ Planner ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    pub max_threads: usize,
    pub max_section_size: usize,
    /// Direct taps (multiply-accumulates per sample) allowed on the audio thread
    pub direct_budget: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self::from(&config)
    }
}

impl From<&EngineConfig> for PlannerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_threads: config.max_threads,
            max_section_size: config.max_section_size,
            direct_budget: config.direct_budget,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionPlanner {
    config: PlannerConfig,
}

impl PartitionPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Build the section layout for an impulse. Deterministic.
    pub fn plan(
        &self,
        impulse_len: usize,
        sample_rate: f64,
        max_block_size: usize,
    ) -> ConvolutionResult<PartitionPlan> {
        if impulse_len == 0 {
            return Err(ConvolutionError::InvalidImpulse(
                "impulse response is empty".into(),
            ));
        }
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(ConvolutionError::Configuration(format!(
                "invalid sample rate {sample_rate}"
            )));
        }
        if max_block_size == 0 {
            return Err(ConvolutionError::Configuration(
                "max block size must be non-zero".into(),
            ));
        }

        let budget = match self.config.direct_budget {
            0 => DEFAULT_DIRECT_BUDGET,
            taps => taps,
        };
        let min_threaded = MIN_SECTION_SIZE.max(max_block_size.next_power_of_two());
        let max_size = self.config.max_section_size.max(min_threaded);
        let head = budget.min(impulse_len);

        let mut sections = vec![SectionDescriptor::direct(head)];
        let mut offset = head;
        let mut previous: Option<usize> = None;

        while offset < impulse_len {
            let remaining = impulse_len - offset;
            let fit = remaining.next_power_of_two();
            let grow = previous.map_or(usize::MAX, |size| 2 * size);

            let threaded = prev_power_of_two(offset / 2).min(max_size);
            let section = if threaded >= min_threaded {
                let size = threaded.min(grow).min(fit).max(min_threaded);
                SectionDescriptor::threaded(offset, size, size.min(remaining))
            } else {
                let size = prev_power_of_two(offset)
                    .min(grow)
                    .min(fit.max(MIN_INLINE_SIZE));
                SectionDescriptor::inline(offset, size, size.min(remaining))
            };

            sections.push(section);
            previous = Some(section.size);
            offset += section.taps;
        }

        let threads = self.assign_threads(&mut sections, sample_rate);

        Ok(PartitionPlan {
            impulse_len,
            sample_rate,
            max_block_size,
            direct_budget: budget,
            min_threaded_size: min_threaded,
            sections,
            threads,
        })
    }

    /// Contiguous groups in size order, balanced by estimated cost.
    fn assign_threads(&self, sections: &mut [SectionDescriptor], sample_rate: f64) -> Vec<ThreadPlan> {
        let mut order: Vec<usize> = (0..sections.len()).filter(|&i| sections[i].is_threaded()).collect();
        if order.is_empty() {
            return Vec::new();
        }
        // Stable: equal sizes keep offset order
        order.sort_by_key(|&i| sections[i].size);

        let count = self.config.max_threads.max(1).min(order.len());
        let total: f64 = order.iter().map(|&i| sections[i].cost_per_sample()).sum();

        let mut threads: Vec<ThreadPlan> = (0..count)
            .map(|thread_id| ThreadPlan {
                thread_id,
                priority_rank: thread_id,
                sections: Vec::new(),
                estimated_load: 0.0,
            })
            .collect();

        let mut group = 0;
        let mut accumulated = 0.0;
        for (position, &index) in order.iter().enumerate() {
            let cost = sections[index].cost_per_sample();
            sections[index].thread_id = Some(group);
            threads[group].sections.push(index);
            threads[group].estimated_load += cost * sample_rate / ESTIMATED_FLOPS_PER_THREAD;
            accumulated += cost;

            let items_left = order.len() - position - 1;
            let groups_left = count - group - 1;
            let share_reached = accumulated >= total * (group + 1) as f64 / count as f64;
            if groups_left > 0 && (share_reached || items_left == groups_left) {
                group += 1;
            }
        }

        threads
    }
}

#[inline]
fn prev_power_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}
