//! FFT section evaluated on the audio thread
//!
//! Covers the part of the impulse between the direct head and the first
//! offset a worker can meet. Input is fed sample-accurately inside `tick`;
//! each completed block is transformed immediately and its output parked in
//! a ring indexed by stream position until the stream reaches it.

use crate::fft_section::FftSection;
use crate::planner::SectionDescriptor;
use crate::{ConvolutionError, ConvolutionResult, Sample};

pub struct InlineSection {
    fft: FftSection,
    /// Pending output, indexed by stream position
    pending: Vec<Sample>,
    mask: usize,
    section_delay: usize,
    /// Stream index of the next input sample
    position: usize,
}

impl InlineSection {
    pub fn new(descriptor: &SectionDescriptor, impulse: &[Sample]) -> ConvolutionResult<Self> {
        if descriptor.section_delay < descriptor.size {
            return Err(ConvolutionError::Configuration(format!(
                "inline section of {} samples needs a delay of at least its size, got {}",
                descriptor.size, descriptor.section_delay
            )));
        }
        let fft = FftSection::new(descriptor.size, descriptor.impulse_offset, impulse)?;
        let capacity = (descriptor.section_delay + descriptor.size).next_power_of_two();

        Ok(Self {
            fft,
            pending: vec![0.0; capacity],
            mask: capacity - 1,
            section_delay: descriptor.section_delay,
            position: 0,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.fft.size()
    }

    /// Accumulate this section's output for a block into `output`.
    pub fn process_add(&mut self, input: &[Sample], output: &mut [Sample]) -> ConvolutionResult<()> {
        let size = self.fft.size();
        let mut done = 0;
        while done < input.len() {
            let take = (input.len() - done).min(self.fft.remaining());

            // Output for these positions was parked by earlier blocks
            for (k, y) in output[done..done + take].iter_mut().enumerate() {
                let slot = (self.position + k) & self.mask;
                *y += self.pending[slot];
                self.pending[slot] = 0.0;
            }

            if let Some(block) = self.fft.execute(&input[done..done + take])? {
                // The block just completed ends at position + take; its output
                // starts `section_delay` after the block's first input
                let start = self.position + take - size + self.section_delay;
                for (k, y) in block.iter().enumerate() {
                    self.pending[(start + k) & self.mask] = *y;
                }
            }

            self.position += take;
            done += take;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.fft.reset();
        self.pending.fill(0.0);
        self.position = 0;
    }
}
