//! Convolution error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvolutionError {
    #[error("Invalid impulse response: {0}")]
    InvalidImpulse(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Background thread startup failed: {0}")]
    Startup(String),

    #[error("Channel closed")]
    Closed,

    #[error("Synchronization lost: reader at {read}, writer at {written}, capacity {capacity}")]
    SynchronizationLost {
        read: usize,
        written: usize,
        capacity: usize,
    },

    #[error("Buffer overrun: {requested} samples requested, {free} free")]
    Overrun { requested: usize, free: usize },

    #[error("Buffer underrun")]
    Underrun,

    #[error("Timed out waiting for samples")]
    Timeout,

    #[error("FFT error: {0}")]
    Fft(String),
}

impl ConvolutionError {
    /// Errors after which the audio stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SynchronizationLost { .. } | Self::Overrun { .. } | Self::Fft(_)
        )
    }
}

pub type ConvolutionResult<T> = Result<T, ConvolutionError>;

/// Terminate the process after an unrecoverable background failure.
/// There is no partial recovery from a desynchronized stream.
pub(crate) fn fatal(context: &str, err: &ConvolutionError) -> ! {
    log::error!("{context}: {err} - aborting");
    std::process::abort()
}
