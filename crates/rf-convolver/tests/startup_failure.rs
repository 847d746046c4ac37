//! Background Startup Failure
//!
//! Kept in its own test binary so that no other engine's threads are alive
//! while the thread list is inspected.

use std::time::{Duration, Instant};

use rf_convolver::{ConvolutionEngine, ConvolutionError, EngineConfig, Sample, SchedulingPolicy};

/// Live threads of this process whose name starts with `prefix`.
#[cfg(target_os = "linux")]
fn threads_named(prefix: &str) -> usize {
    let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
        return 0;
    };
    tasks
        .filter_map(Result::ok)
        .filter_map(|task| std::fs::read_to_string(task.path().join("comm")).ok())
        .filter(|name| name.starts_with(prefix))
        .count()
}

#[test]
fn test_priority_failure_fails_construction_and_joins_threads() {
    let _ = env_logger::builder().is_test(true).try_init();

    let impulse: Vec<Sample> = (0..20000).map(|k| 1.0 / (1.0 + k as Sample)).collect();
    // No SCHED_FIFO implementation accepts this priority
    let config = EngineConfig::new(48000.0, 128)
        .with_max_threads(3)
        .with_scheduling(SchedulingPolicy::RealTime {
            base_priority: 10_000,
        });

    let started = Instant::now();
    let result = ConvolutionEngine::with_config(&impulse, config);
    assert!(matches!(result, Err(ConvolutionError::Startup(_))));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Joined threads may linger in /proc for a moment after join returns
    #[cfg(target_os = "linux")]
    {
        let deadline = Instant::now() + Duration::from_secs(1);
        while threads_named("rf-conv") > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(threads_named("rf-conv"), 0);
    }

    // Nothing is left behind that would stop the next engine from starting
    let config = EngineConfig::new(48000.0, 128).with_scheduling(SchedulingPolicy::Inherit);
    let mut engine = ConvolutionEngine::with_config(&impulse, config).unwrap();
    let mut input = [0.0; 128];
    input[0] = 1.0;
    let mut output = [0.0; 128];
    engine.tick(&input, &mut output).unwrap();
    assert!((output[0] - 1.0).abs() < 1e-9);
    assert!((output[1] - 0.5).abs() < 1e-9);
}
