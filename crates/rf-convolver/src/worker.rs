//! Worker threads for FFT sections
//!
//! Each thread of the plan hosts one or more sections and loops:
//!
//! ```text
//! Idle ──▶ WaitForInput ──▶ Execute ──▶ PublishOutput ──▶ Idle
//!              │                 │
//!              │                 └── input lapped ──▶ Resync (publish silence)
//!              └── input channel closed ──▶ Closed
//! ```
//!
//! Threads build their own FFT sections, apply their scheduling priority,
//! and then report to a [`StartupLatch`] the constructing thread waits on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::fatal;
use crate::planner::{PartitionPlan, SectionDescriptor, ThreadPlan};
use crate::ring_channel::{ChannelHandle, RingReader, RingWriter};
use crate::thread_priority::apply_thread_priority;
use crate::threaded_section::{SectionStats, ThreadedSection};
use crate::{ConvolutionError, ConvolutionResult, Sample, SchedulingPolicy, WaitPolicy};

// ═══════════════════════════════════════════════════════════════════════════════
// STARTUP LATCH
// ═══════════════════════════════════════════════════════════════════════════════

struct LatchState {
    started: usize,
    failure: Option<ConvolutionError>,
}

/// Counts background threads in; the first failure wins.
pub struct StartupLatch {
    expected: usize,
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl StartupLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            state: Mutex::new(LatchState {
                started: 0,
                failure: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn report(&self, result: ConvolutionResult<()>) {
        let mut state = self.state.lock();
        match result {
            Ok(()) => state.started += 1,
            Err(e) => {
                if state.failure.is_none() {
                    state.failure = Some(e);
                }
            }
        }
        self.changed.notify_all();
    }

    /// Block until every thread started or one failed.
    pub fn wait(&self) -> ConvolutionResult<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(e) = &state.failure {
                return Err(e.clone());
            }
            if state.started >= self.expected {
                return Ok(());
            }
            self.changed.wait(&mut state);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER GATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Diagnostic suspend/resume switch shared by all workers.
#[derive(Default)]
pub struct WorkerGate {
    suspended: AtomicBool,
    closed: AtomicBool,
    lock: Mutex<()>,
    changed: Condvar,
}

impl WorkerGate {
    /// Returns immediately unless suspended; `Closed` once closed.
    pub fn pass(&self) -> ConvolutionResult<()> {
        if !self.suspended.load(Ordering::Acquire) {
            return self.check_closed();
        }
        let mut guard = self.lock.lock();
        while self.suspended.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire) {
            self.changed.wait(&mut guard);
        }
        self.check_closed()
    }

    fn check_closed(&self) -> ConvolutionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ConvolutionError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        let _guard = self.lock.lock();
        self.suspended.store(false, Ordering::Release);
        self.changed.notify_all();
    }

    pub fn close(&self) {
        let _guard = self.lock.lock();
        self.closed.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER THREAD GROUP
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a worker needs to build one section on its own thread.
pub struct SectionSeed {
    pub index: usize,
    pub descriptor: SectionDescriptor,
    pub input: RingReader,
    pub output: RingWriter,
    pub stats: Arc<SectionStats>,
}

/// Shared context for all workers of one engine.
#[derive(Clone)]
pub struct WorkerContext {
    pub impulse: Arc<[Sample]>,
    pub input: ChannelHandle,
    /// Largest host block the audio thread writes at once
    pub max_block: usize,
    pub scheduling: SchedulingPolicy,
    pub wait: WaitPolicy,
    pub latch: Arc<StartupLatch>,
}

pub struct WorkerThreadGroup {
    handles: Vec<JoinHandle<()>>,
    gate: Arc<WorkerGate>,
}

impl WorkerThreadGroup {
    /// Spawn one thread per `ThreadPlan`. Spawn failures are reported
    /// through the latch rather than returned, so every started thread stays
    /// joinable.
    pub fn spawn(
        plan: &PartitionPlan,
        mut seeds: Vec<SectionSeed>,
        context: WorkerContext,
    ) -> Self {
        let gate = Arc::new(WorkerGate::default());
        let mut handles = Vec::with_capacity(plan.threads.len());

        for thread_plan in &plan.threads {
            let (mine, rest): (Vec<_>, Vec<_>) = seeds
                .into_iter()
                .partition(|seed| thread_plan.sections.contains(&seed.index));
            seeds = rest;

            let context = context.clone();
            let gate = Arc::clone(&gate);
            let thread_plan = thread_plan.clone();
            let latch = Arc::clone(&context.latch);

            let spawned = thread::Builder::new()
                .name(format!("rf-conv-worker-{}", thread_plan.thread_id))
                .spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        run_worker(thread_plan, mine, context, gate)
                    }));
                    if outcome.is_err() {
                        log::error!("Convolution worker panicked - aborting");
                        std::process::abort();
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    latch.report(Err(ConvolutionError::Startup(format!(
                        "failed to spawn worker thread: {e}"
                    ))));
                    break;
                }
            }
        }

        Self { handles, gate }
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub fn suspend(&self) {
        self.gate.suspend();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.gate.is_suspended()
    }

    /// Release suspended workers for shutdown. Channels must be closed too.
    pub fn close(&self) {
        self.gate.close();
    }

    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Convolution worker thread terminated abnormally");
            }
        }
    }
}

fn run_worker(
    thread_plan: ThreadPlan,
    seeds: Vec<SectionSeed>,
    context: WorkerContext,
    gate: Arc<WorkerGate>,
) {
    let setup = apply_thread_priority(context.scheduling, thread_plan.priority_rank).and_then(|()| {
        let mut sections = seeds
            .into_iter()
            .map(|seed| {
                ThreadedSection::new(
                    seed.index,
                    seed.descriptor,
                    &context.impulse,
                    seed.input,
                    seed.output,
                    seed.stats,
                    context.max_block,
                )
            })
            .collect::<ConvolutionResult<Vec<_>>>()?;
        // Tightest deadlines first
        sections.sort_by_key(|s| (s.descriptor().size, s.descriptor().impulse_offset));
        Ok(sections)
    });

    let mut sections = match setup {
        Ok(sections) => {
            context.latch.report(Ok(()));
            sections
        }
        Err(e) => {
            log::error!("Worker {} failed to start: {e}", thread_plan.thread_id);
            context.latch.report(Err(e));
            return;
        }
    };

    log::debug!(
        "Worker {} started with {} sections (rank {}, est. load {:.3})",
        thread_plan.thread_id,
        sections.len(),
        thread_plan.priority_rank,
        thread_plan.estimated_load
    );

    let result = worker_loop(&mut sections, &context, &gate);
    for section in &sections {
        section.close();
    }

    match result {
        Ok(()) | Err(ConvolutionError::Closed) => {
            log::debug!("Worker {} stopped", thread_plan.thread_id);
        }
        Err(e) => fatal("Convolution worker", &e),
    }
}

fn worker_loop(
    sections: &mut [ThreadedSection],
    context: &WorkerContext,
    gate: &WorkerGate,
) -> ConvolutionResult<()> {
    loop {
        gate.pass()?;

        // Execute
        let written = context.input.write_count();
        let mut executed = false;
        for section in sections.iter_mut() {
            while section.is_ready(written) {
                section.execute()?;
                executed = true;
            }
        }
        if executed {
            continue;
        }

        // Work pending but the assembly stage has not drained the output yet
        if let Some(blocked) = sections.iter().find(|s| s.has_work(written)) {
            let deadline = Instant::now() + context.wait.park_slice();
            match blocked.wait_for_output_space(Some(deadline)) {
                Ok(()) | Err(ConvolutionError::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }

        // WaitForInput
        let target = sections
            .iter()
            .map(ThreadedSection::next_trigger)
            .min()
            .unwrap_or(usize::MAX);
        context.input.wait_for_write_count(target, None)?;
    }
}
