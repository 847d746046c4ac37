//! Real FFT adapter
//!
//! Wraps a forward/inverse `realfft` plan pair of one length together with
//! the scratch space they need, so processing never allocates.

use std::sync::Arc;

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use crate::{ConvolutionError, ConvolutionResult, Sample};

pub struct StagedFft {
    len: usize,
    forward: Arc<dyn RealToComplex<Sample>>,
    inverse: Arc<dyn ComplexToReal<Sample>>,
    /// Time-domain staging (realfft consumes its input)
    time: Vec<Sample>,
    scratch: Vec<Complex<Sample>>,
    scale: Sample,
}

impl StagedFft {
    /// Plan a real FFT of `len` points (even).
    pub fn new(len: usize) -> ConvolutionResult<Self> {
        if len < 2 || len % 2 != 0 {
            return Err(ConvolutionError::Fft(format!(
                "FFT length must be even and >= 2, got {len}"
            )));
        }

        let mut planner = RealFftPlanner::<Sample>::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        let scratch_len = forward
            .get_scratch_len()
            .max(inverse.get_scratch_len());

        Ok(Self {
            len,
            forward,
            inverse,
            time: vec![0.0; len],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            scale: 1.0 / len as Sample,
        })
    }

    /// FFT length in points.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of complex bins (`len / 2 + 1`).
    #[inline]
    pub fn bins(&self) -> usize {
        self.len / 2 + 1
    }

    pub fn make_spectrum(&self) -> Vec<Complex<Sample>> {
        vec![Complex::new(0.0, 0.0); self.bins()]
    }

    /// Forward transform. `input` shorter than the FFT length is zero-padded.
    pub fn forward(
        &mut self,
        input: &[Sample],
        spectrum: &mut [Complex<Sample>],
    ) -> ConvolutionResult<()> {
        let n = input.len().min(self.len);
        self.time[..n].copy_from_slice(&input[..n]);
        self.time[n..].fill(0.0);

        self.forward
            .process_with_scratch(&mut self.time, spectrum, &mut self.scratch)
            .map_err(|e| ConvolutionError::Fft(e.to_string()))
    }

    /// Normalized inverse transform. Consumes `spectrum` as scratch.
    pub fn inverse(
        &mut self,
        spectrum: &mut [Complex<Sample>],
        output: &mut [Sample],
    ) -> ConvolutionResult<()> {
        // Real signals: DC and Nyquist bins carry no imaginary part
        spectrum[0].im = 0.0;
        if let Some(last) = spectrum.last_mut() {
            last.im = 0.0;
        }

        self.inverse
            .process_with_scratch(spectrum, output, &mut self.scratch)
            .map_err(|e| ConvolutionError::Fft(e.to_string()))?;

        for sample in output.iter_mut() {
            *sample *= self.scale;
        }
        Ok(())
    }
}
