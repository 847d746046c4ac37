//! Engine notifications
//!
//! Called from the audio thread at block boundaries only, never per sample.
//! Implementations must be real-time safe: set a flag, bump a counter.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait ConvolutionListener: Send + Sync {
    /// Background pipeline is delivering in time: once after startup, then
    /// after every underrun streak ends.
    fn on_ready(&self);

    /// The audio thread needs background output that is not there yet.
    /// Called before the audio thread waits for it.
    fn on_underrun(&self);
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ConvolutionListener for NullListener {
    fn on_ready(&self) {}
    fn on_underrun(&self) {}
}

/// Listener that counts notifications. Handy for diagnostics and tests.
#[derive(Debug, Default)]
pub struct CountingListener {
    ready: AtomicU64,
    underruns: AtomicU64,
}

impl CountingListener {
    pub fn ready_count(&self) -> u64 {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl ConvolutionListener for CountingListener {
    fn on_ready(&self) {
        self.ready.fetch_add(1, Ordering::Relaxed);
    }

    fn on_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }
}
