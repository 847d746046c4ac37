//! Background Thread Priority
//!
//! Worker and assembly threads are ranked by urgency: rank 0 hosts the
//! smallest FFT sections (shortest deadline), the highest rank the largest.
//!
//! # Platform Support
//!
//! - **Unix**: `RealTime` maps to SCHED_FIFO via `pthread_setschedparam`
//!   (requires CAP_SYS_NICE, rtprio limits or root on Linux)
//! - **Linux**: `Niced` raises the per-thread nice value by rank
//! - **Other**: `RealTime` is reported as a startup failure, `Niced` is a no-op
//!
//! Call `apply_thread_priority()` once at the start of each background thread.

use crate::{ConvolutionError, ConvolutionResult, SchedulingPolicy};

/// Lowest SCHED_FIFO priority handed out.
const MIN_REALTIME_PRIORITY: i32 = 1;
/// Nice ceiling on Linux.
const MAX_NICE: i32 = 19;

/// Apply `policy` to the calling thread at urgency `rank`.
pub fn apply_thread_priority(policy: SchedulingPolicy, rank: usize) -> ConvolutionResult<()> {
    match policy {
        SchedulingPolicy::Inherit => Ok(()),
        SchedulingPolicy::RealTime { base_priority } => {
            let priority = base_priority
                .saturating_sub(rank as i32)
                .max(MIN_REALTIME_PRIORITY);
            platform_set_realtime(priority)?;
            log::debug!("Thread rank {rank} running SCHED_FIFO priority {priority}");
            Ok(())
        }
        SchedulingPolicy::Niced => {
            // Reduced-privilege mode: failures only cost ordering
            if let Err(e) = platform_set_nice(rank) {
                log::debug!("Nice adjustment for rank {rank} skipped: {e}");
            }
            Ok(())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unix Implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(unix)]
fn platform_set_realtime(priority: i32) -> ConvolutionResult<()> {
    let min = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if priority < min || priority > max {
        return Err(ConvolutionError::Startup(format!(
            "SCHED_FIFO priority {priority} outside {min}..={max}"
        )));
    }

    // sched_param carries platform padding on macOS
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;

    let thread = unsafe { libc::pthread_self() };
    let result = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };

    if result == 0 {
        Ok(())
    } else {
        Err(ConvolutionError::Startup(format!(
            "SCHED_FIFO priority {priority} refused (errno {result})"
        )))
    }
}

#[cfg(target_os = "linux")]
fn platform_set_nice(rank: usize) -> ConvolutionResult<()> {
    if rank == 0 {
        return Ok(());
    }

    // PRIO_PROCESS with a thread id targets just that thread on Linux
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    let current = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid) };
    let target = current.saturating_add(rank as i32).min(MAX_NICE);

    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, target) };
    if result == 0 {
        Ok(())
    } else {
        Err(ConvolutionError::Startup(format!(
            "setpriority({target}) failed: {}",
            std::io::Error::last_os_error()
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unsupported Platforms
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(not(unix))]
fn platform_set_realtime(priority: i32) -> ConvolutionResult<()> {
    Err(ConvolutionError::Startup(format!(
        "real-time priority {priority} not supported on this platform"
    )))
}

#[cfg(not(target_os = "linux"))]
fn platform_set_nice(_rank: usize) -> ConvolutionResult<()> {
    Err(ConvolutionError::Startup(
        "per-thread nice values not supported on this platform".into(),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
