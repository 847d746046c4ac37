//! Assembly stage
//!
//! Merges the output channels of all threaded sections, in partition order, into
//! one gap-free stream for the audio thread:
//!
//! ```text
//! WaitForAllSections ──▶ MergeInOrder ──▶ PublishToAssemblyQueue ──┐
//!        ▲                                                         │
//!        └─────────────────────────────────────────────────────────┘
//!                  (any upstream channel closed ──▶ Closed)
//! ```
//!
//! Section `i` contributes from stream index `offset_i` onwards; before that
//! its share is silence, so nothing is pre-filled with zeros.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::fatal;
use crate::ring_channel::{ChannelHandle, RingChannel, RingReader, RingWriter};
use crate::thread_priority::apply_thread_priority;
use crate::worker::StartupLatch;
use crate::{ConvolutionError, ConvolutionResult, Sample, SchedulingPolicy, WaitPolicy};

/// Smallest assembly queue, in samples.
pub const MIN_QUEUE_CAPACITY: usize = 256;
/// Largest chunk the audio thread pulls per call, and the assembly merge size.
pub const READ_CHUNK: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// ASSEMBLY QUEUE (audio thread side)
// ═══════════════════════════════════════════════════════════════════════════════

/// Audio-thread end of the assembled stream.
///
/// Samples that were replaced by silence during an underrun are recorded as
/// debt and dropped when they finally arrive, so later output stays aligned.
pub struct AssemblyQueue {
    reader: RingReader,
    debt: usize,
}

impl AssemblyQueue {
    /// Queue capacity for a host block size.
    pub fn capacity_for(max_block_size: usize) -> usize {
        MIN_QUEUE_CAPACITY.max((2 * max_block_size).next_power_of_two())
    }

    /// Writer for the assembly thread, queue for the audio thread.
    pub fn channel(max_block_size: usize, wait: WaitPolicy) -> (RingWriter, Self) {
        let (writer, reader) = RingChannel::spsc(Self::capacity_for(max_block_size), wait);
        (writer, Self { reader, debt: 0 })
    }

    /// Copy whatever is ready into `out` without blocking. Pays off debt
    /// first; returns the number of samples filled.
    pub fn try_fill(&mut self, out: &mut [Sample]) -> ConvolutionResult<usize> {
        if self.debt > 0 {
            self.debt -= self.reader.skip(self.debt)?;
            if self.debt > 0 {
                return Ok(0);
            }
        }

        let mut filled = 0;
        for chunk in out.chunks_mut(READ_CHUNK) {
            let n = self.reader.try_read(chunk)?;
            filled += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(filled)
    }

    /// Park until `wanted` fresh samples (beyond any debt) are queued, or the
    /// queue is full while debt is still outstanding.
    pub fn wait(&self, wanted: usize, deadline: Option<Instant>) -> ConvolutionResult<()> {
        let needed = (self.debt + wanted).min(self.reader.capacity());
        self.reader.wait_available(needed, deadline)
    }

    /// Record samples that were substituted with silence.
    pub fn add_debt(&mut self, samples: usize) {
        self.debt += samples;
    }

    pub fn debt(&self) -> usize {
        self.debt
    }

    /// Stream samples consumed so far (including discarded ones).
    pub fn position(&self) -> usize {
        self.reader.position()
    }

    pub fn handle(&self) -> ChannelHandle {
        self.reader.handle()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASSEMBLY STAGE (background thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// One threaded section's output channel and where it lands in the stream.
pub struct AssemblyInput {
    pub offset: usize,
    pub reader: RingReader,
}

pub struct AssemblyStage {
    handle: Option<JoinHandle<()>>,
}

impl AssemblyStage {
    /// Spawn the assembly thread. `inputs` must be in partition order.
    pub fn spawn(
        inputs: Vec<AssemblyInput>,
        queue: RingWriter,
        chunk: usize,
        scheduling: SchedulingPolicy,
        latch: Arc<StartupLatch>,
    ) -> Self {
        let thread_latch = Arc::clone(&latch);
        let spawned = thread::Builder::new()
            .name("rf-conv-assembly".into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_assembly(inputs, queue, chunk, scheduling, &thread_latch)
                }));
                if outcome.is_err() {
                    log::error!("Convolution assembly thread panicked - aborting");
                    std::process::abort();
                }
            });

        match spawned {
            Ok(handle) => Self {
                handle: Some(handle),
            },
            Err(e) => {
                latch.report(Err(ConvolutionError::Startup(format!(
                    "failed to spawn assembly thread: {e}"
                ))));
                Self { handle: None }
            }
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Convolution assembly thread terminated abnormally");
            }
        }
    }
}

fn run_assembly(
    mut inputs: Vec<AssemblyInput>,
    mut queue: RingWriter,
    chunk: usize,
    scheduling: SchedulingPolicy,
    latch: &StartupLatch,
) {
    // Shares the top rank with the smallest sections
    if let Err(e) = apply_thread_priority(scheduling, 0) {
        log::error!("Assembly thread failed to start: {e}");
        latch.report(Err(e));
        return;
    }
    latch.report(Ok(()));
    log::debug!(
        "Assembly thread started ({} sections, chunk {chunk})",
        inputs.len()
    );

    let result = assemble(&mut inputs, &mut queue, chunk);
    queue.close();

    match result {
        Ok(()) | Err(ConvolutionError::Closed) => log::debug!("Assembly thread stopped"),
        Err(e) => fatal("Convolution assembly", &e),
    }
}

fn assemble(
    inputs: &mut [AssemblyInput],
    queue: &mut RingWriter,
    chunk: usize,
) -> ConvolutionResult<()> {
    let mut mix = vec![0.0; chunk];
    let mut scratch = vec![0.0; chunk];
    let mut position = 0usize;

    loop {
        let end = position + chunk;
        mix.fill(0.0);

        // WaitForAllSections + MergeInOrder
        for input in inputs.iter_mut() {
            if end <= input.offset {
                // Offsets ascend, nothing later contributes yet
                break;
            }
            let start = position.max(input.offset);
            let len = end - start;
            input.reader.read(&mut scratch[..len])?;
            for (m, s) in mix[start - position..].iter_mut().zip(&scratch[..len]) {
                *m += *s;
            }
        }

        // PublishToAssemblyQueue
        queue.write_blocking(&mix)?;
        position = end;
    }
}
