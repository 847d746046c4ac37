//! Direct (time-domain) convolution section
//!
//! Runs inline on the audio thread: zero latency, O(len) per sample.
//! Covers the head of the impulse response, up to the planner's direct
//! budget.

use crate::Sample;

/// Direct convolution over the first `len` impulse taps.
///
/// The delay line is written twice (at `pos` and `pos + len`) so the window
/// of the last `len` inputs is always one contiguous slice, and the
/// coefficients are stored reversed so the inner loop is a straight dot
/// product.
pub struct DirectSection {
    /// Impulse head, reversed (oldest input first)
    coefficients: Vec<Sample>,
    /// Double-length delay line
    delay_line: Vec<Sample>,
    /// Current write position (0..len)
    position: usize,
}

impl DirectSection {
    pub fn new(head: &[Sample]) -> Self {
        let coefficients: Vec<Sample> = head.iter().rev().copied().collect();
        let len = coefficients.len().max(1);

        Self {
            coefficients,
            delay_line: vec![0.0; 2 * len],
            position: 0,
        }
    }

    /// Process one input sample, returning this section's contribution to
    /// the current output sample.
    #[inline(always)]
    pub fn tick(&mut self, input: Sample) -> Sample {
        let len = self.delay_line.len() / 2;
        let pos = self.position;
        self.delay_line[pos] = input;
        self.delay_line[pos + len] = input;
        self.position = if pos + 1 == len { 0 } else { pos + 1 };

        // window holds the last `len` inputs, oldest first
        let window = &self.delay_line[pos + 1..pos + 1 + self.coefficients.len()];
        self.coefficients
            .iter()
            .zip(window)
            .map(|(c, x)| c * x)
            .sum()
    }

    /// Accumulate this section's output for a block into `output`.
    pub fn process_add(&mut self, input: &[Sample], output: &mut [Sample]) {
        for (x, y) in input.iter().zip(output.iter_mut()) {
            *y += self.tick(*x);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Samples held in the delay line.
    pub fn delay_line_len(&self) -> usize {
        self.delay_line.len()
    }

    /// Always zero: direct sections run in the audio callback.
    pub fn latency(&self) -> usize {
        0
    }

    pub fn reset(&mut self) {
        self.delay_line.fill(0.0);
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference(impulse: &[Sample], input: &[Sample]) -> Vec<Sample> {
        (0..input.len())
            .map(|n| {
                (0..impulse.len())
                    .filter(|&k| k <= n)
                    .map(|k| impulse[k] * input[n - k])
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_direct_identity() {
        let mut section = DirectSection::new(&[1.0]);
        for x in [0.5, -0.25, 1.0] {
            assert_eq!(section.tick(x), x);
        }
        assert_eq!(section.latency(), 0);
    }

    #[test]
    fn test_direct_impulse_reproduces_head() {
        let head = [0.5, 0.25, -0.125, 1.0];
        let mut section = DirectSection::new(&head);

        let out: Vec<Sample> = (0..8)
            .map(|n| section.tick(if n == 0 { 1.0 } else { 0.0 }))
            .collect();
        assert_eq!(&out[..4], &head);
        assert!(out[4..].iter().all(|&y| y == 0.0));
    }

    #[test]
    fn test_direct_matches_reference() {
        let impulse: Vec<Sample> = (0..40).map(|k| ((k * 7) % 11) as Sample - 5.0).collect();
        let input: Vec<Sample> = (0..200).map(|n| ((n * 13) % 17) as Sample / 17.0 - 0.5).collect();

        let mut section = DirectSection::new(&impulse);
        let mut out = vec![0.0; input.len()];
        section.process_add(&input, &mut out);

        let expected = reference(&impulse, &input);
        for (a, b) in out.iter().zip(&expected) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_delay_line_sized_to_taps() {
        let section = DirectSection::new(&[0.25; 64]);
        assert_eq!(section.len(), 64);
        assert_eq!(section.delay_line_len(), 128);
    }

    #[test]
    fn test_direct_reset() {
        let mut section = DirectSection::new(&[1.0, 1.0, 1.0]);
        section.tick(1.0);
        section.tick(1.0);
        section.reset();

        let out: Vec<Sample> = (0..3).map(|_| section.tick(0.0)).collect();
        assert_eq!(out, vec![0.0; 3]);
    }
}
