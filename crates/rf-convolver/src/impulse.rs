//! Impulse response container
//!
//! What the loader hands over: interleaved samples, already resampled to
//! the engine rate. The engine takes a private copy of one channel.

use crate::{ConvolutionError, ConvolutionResult, Sample};

#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    /// Interleaved time-domain samples
    pub samples: Vec<Sample>,
    pub sample_rate: f64,
    pub channels: u8,
}

impl ImpulseResponse {
    pub fn new(samples: Vec<Sample>, sample_rate: f64, channels: u8) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn mono(samples: Vec<Sample>, sample_rate: f64) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Length in samples (per channel)
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.sample_rate
    }

    /// De-interleave one channel.
    pub fn channel(&self, ch: u8) -> ConvolutionResult<Vec<Sample>> {
        if ch >= self.channels {
            return Err(ConvolutionError::InvalidImpulse(format!(
                "channel {ch} requested from a {}-channel impulse",
                self.channels
            )));
        }
        let stride = self.channels as usize;
        Ok(self
            .samples
            .iter()
            .skip(ch as usize)
            .step_by(stride)
            .take(self.len())
            .copied()
            .collect())
    }

    /// Reject impulses the engine cannot run.
    pub fn validate(&self) -> ConvolutionResult<()> {
        if self.channels == 0 {
            return Err(ConvolutionError::InvalidImpulse("zero channels".into()));
        }
        if self.samples.len() % self.channels as usize != 0 {
            return Err(ConvolutionError::InvalidImpulse(format!(
                "{} samples do not divide into {} channels",
                self.samples.len(),
                self.channels
            )));
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(ConvolutionError::InvalidImpulse(format!(
                "invalid sample rate {}",
                self.sample_rate
            )));
        }
        validate_samples(&self.samples)
    }
}

/// Non-empty and finite.
pub fn validate_samples(samples: &[Sample]) -> ConvolutionResult<()> {
    if samples.is_empty() {
        return Err(ConvolutionError::InvalidImpulse(
            "impulse response is empty".into(),
        ));
    }
    if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
        return Err(ConvolutionError::InvalidImpulse(format!(
            "non-finite sample at index {index}"
        )));
    }
    Ok(())
}
