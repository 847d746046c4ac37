//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConvolutionError, ConvolutionResult};

/// Smallest FFT section the planner will emit.
pub const MIN_SECTION_SIZE: usize = 64;
/// Default cap on FFT section size.
pub const DEFAULT_MAX_SECTION_SIZE: usize = 16384;
/// Upper bound on the per-call block size a host may declare.
pub const MAX_BLOCK_SIZE: usize = 8192;
/// Default multiply-accumulates per sample for the direct head.
pub const DEFAULT_DIRECT_BUDGET: usize = 64;
/// Accepted range for the direct head budget.
pub const MIN_DIRECT_BUDGET: usize = 16;
pub const MAX_DIRECT_BUDGET: usize = 1024;

/// How background threads are scheduled relative to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// SCHED_FIFO, priority descending from `base_priority` by thread rank.
    /// Failing to acquire it aborts construction.
    RealTime { base_priority: i32 },
    /// Niceness raised by thread rank. Works without privileges.
    #[default]
    Niced,
    /// Leave the spawned threads at the scheduler defaults.
    Inherit,
}

impl SchedulingPolicy {
    /// Real-time policy just below a typical audio callback priority (80).
    pub const fn realtime() -> Self {
        Self::RealTime { base_priority: 70 }
    }
}

/// Spin-then-block waiting used by every channel wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Spin/yield rounds before parking on the condition variable.
    pub spin_rounds: u32,
    /// Longest single park before re-checking the channel (microseconds).
    pub park_slice_us: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            spin_rounds: 12,
            park_slice_us: 1000,
        }
    }
}

impl WaitPolicy {
    #[inline]
    pub fn park_slice(&self) -> Duration {
        Duration::from_micros(self.park_slice_us.max(1))
    }
}

/// Convolution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Operating sample rate (impulse already resampled to it)
    pub sample_rate: f64,
    /// Largest frame count a single `tick` is expected to carry
    pub max_block_size: usize,
    /// Background thread scheduling
    pub scheduling: SchedulingPolicy,
    /// Upper bound on FFT worker threads
    pub max_threads: usize,
    /// Largest FFT section size (power of two)
    pub max_section_size: usize,
    /// Impulse taps evaluated directly on the audio thread (MACs per sample)
    pub direct_budget: usize,
    /// How long the audio thread may wait for late background output (ms)
    pub underrun_timeout_ms: u64,
    /// Channel waiting strategy
    pub wait: WaitPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            max_block_size: 256,
            scheduling: SchedulingPolicy::default(),
            max_threads: Self::default_threads(),
            max_section_size: DEFAULT_MAX_SECTION_SIZE,
            direct_budget: DEFAULT_DIRECT_BUDGET,
            underrun_timeout_ms: 500,
            wait: WaitPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(sample_rate: f64, max_block_size: usize) -> Self {
        Self {
            sample_rate,
            max_block_size,
            ..Self::default()
        }
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingPolicy) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_max_section_size(mut self, size: usize) -> Self {
        self.max_section_size = size;
        self
    }

    pub fn with_direct_budget(mut self, taps: usize) -> Self {
        self.direct_budget = taps;
        self
    }

    pub fn with_underrun_timeout(mut self, timeout: Duration) -> Self {
        self.underrun_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    #[inline]
    pub fn underrun_timeout(&self) -> Duration {
        Duration::from_millis(self.underrun_timeout_ms)
    }

    /// Worker count for this machine: leave room for the audio and
    /// assembly threads, never more than four.
    pub fn default_threads() -> usize {
        num_cpus::get().saturating_sub(2).clamp(1, 4)
    }

    pub fn validate(&self) -> ConvolutionResult<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(ConvolutionError::Configuration(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.max_block_size == 0 || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(ConvolutionError::Configuration(format!(
                "max block size must be in 1..={MAX_BLOCK_SIZE}, got {}",
                self.max_block_size
            )));
        }
        if self.max_threads == 0 {
            return Err(ConvolutionError::Configuration(
                "at least one worker thread is required".into(),
            ));
        }
        if !self.max_section_size.is_power_of_two() || self.max_section_size < MIN_SECTION_SIZE
        {
            return Err(ConvolutionError::Configuration(format!(
                "max section size must be a power of two >= {MIN_SECTION_SIZE}, got {}",
                self.max_section_size
            )));
        }
        if !(MIN_DIRECT_BUDGET..=MAX_DIRECT_BUDGET).contains(&self.direct_budget) {
            return Err(ConvolutionError::Configuration(format!(
                "direct budget must be in {MIN_DIRECT_BUDGET}..={MAX_DIRECT_BUDGET}, got {}",
                self.direct_budget
            )));
        }
        Ok(())
    }
}
