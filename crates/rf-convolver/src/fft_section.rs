//! FFT convolution section (overlap-save)
//!
//! One partition of the impulse, `size` samples long, convolved in blocks of
//! `size` with an FFT of `2 * size`. Runs on a worker thread: the burst cost
//! is O(size log size) but it is paid once per `size` samples.

use rustfft::num_complex::Complex;

use crate::fft::StagedFft;
use crate::{ConvolutionError, ConvolutionResult, Sample};

pub struct FftSection {
    size: usize,
    impulse_offset: usize,
    fft: StagedFft,
    /// Spectrum of the zero-padded impulse segment
    impulse_spectrum: Vec<Complex<Sample>>,
    /// [previous block | current block]
    window: Vec<Sample>,
    /// New samples accumulated in the current block
    filled: usize,
    spectrum: Vec<Complex<Sample>>,
    time: Vec<Sample>,
}

impl FftSection {
    /// Section covering `impulse[impulse_offset..impulse_offset + size]`.
    /// A segment running past the end of `impulse` is zero-padded.
    pub fn new(size: usize, impulse_offset: usize, impulse: &[Sample]) -> ConvolutionResult<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(ConvolutionError::Configuration(format!(
                "FFT section size must be a power of two, got {size}"
            )));
        }
        if impulse_offset >= impulse.len() {
            return Err(ConvolutionError::Configuration(format!(
                "section offset {impulse_offset} outside impulse of {} samples",
                impulse.len()
            )));
        }

        let mut fft = StagedFft::new(2 * size)?;
        let end = (impulse_offset + size).min(impulse.len());
        let mut impulse_spectrum = fft.make_spectrum();
        fft.forward(&impulse[impulse_offset..end], &mut impulse_spectrum)?;

        Ok(Self {
            size,
            impulse_offset,
            spectrum: fft.make_spectrum(),
            fft,
            impulse_spectrum,
            window: vec![0.0; 2 * size],
            filled: 0,
            time: vec![0.0; 2 * size],
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn impulse_offset(&self) -> usize {
        self.impulse_offset
    }

    /// Samples still needed to complete the current block.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.filled
    }

    /// Append new input. When a block of `size` samples is complete, run the
    /// convolution and return the `size` output samples of that block.
    ///
    /// `input` must not run past the current block (`remaining()`); excess
    /// samples are ignored.
    pub fn execute(&mut self, input: &[Sample]) -> ConvolutionResult<Option<&[Sample]>> {
        debug_assert!(input.len() <= self.remaining());
        let take = input.len().min(self.remaining());
        let start = self.size + self.filled;
        self.window[start..start + take].copy_from_slice(&input[..take]);
        self.filled += take;

        if self.filled < self.size {
            return Ok(None);
        }
        self.filled = 0;

        self.fft.forward(&self.window, &mut self.spectrum)?;
        for (x, h) in self.spectrum.iter_mut().zip(&self.impulse_spectrum) {
            *x *= *h;
        }
        self.fft.inverse(&mut self.spectrum, &mut self.time)?;

        // Current block becomes the overlap for the next one
        self.window.copy_within(self.size.., 0);

        // First half is circular wrap-around
        Ok(Some(&self.time[self.size..]))
    }

    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.filled = 0;
    }
}
