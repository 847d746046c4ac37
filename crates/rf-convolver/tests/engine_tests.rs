//! Convolution Engine Integration Tests
//!
//! Runs the full pipeline (audio thread, workers, assembly) and checks:
//! - Sample-exact output against a direct reference convolution
//! - Zero latency for every host block pattern
//! - Plan layout through the public API
//! - Lifecycle (close, drop, tick after close)
//! - Underrun handling and realignment after workers fall behind, including
//!   stalls longer than the input feed holds
//! - Engine hot-swap

use std::sync::Arc;
use std::time::{Duration, Instant};

use rf_convolver::{
    ConvolutionEngine, ConvolutionError, CountingListener, EngineConfig, ImpulseResponse,
    Sample, SchedulingPolicy, SectionKind, swap_channel,
};

const SAMPLE_RATE: f64 = 48000.0;
const BLOCK_SIZE: usize = 128;
const TOLERANCE: f64 = 1e-9;

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Deterministic pseudo-random signal in [-1, 1)
fn generate_noise(samples: usize, seed: u64) -> Vec<Sample> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..samples)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
        })
        .collect()
}

/// Exponentially decaying noise, like a room response
fn generate_impulse(len: usize, seed: u64) -> Vec<Sample> {
    generate_noise(len, seed)
        .into_iter()
        .enumerate()
        .map(|(k, x)| x * (-3.0 * k as f64 / len as f64).exp())
        .collect()
}

/// Direct-form reference, skipping zero taps
fn reference(impulse: &[Sample], input: &[Sample]) -> Vec<Sample> {
    let taps: Vec<(usize, Sample)> = impulse
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, h)| *h != 0.0)
        .collect();

    (0..input.len())
        .map(|n| {
            taps.iter()
                .take_while(|(k, _)| *k <= n)
                .map(|(k, h)| h * input[n - k])
                .sum()
        })
        .collect()
}

/// `RUST_LOG=rf_convolver=debug cargo test` shows plans and underruns
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config(max_block_size: usize) -> EngineConfig {
    init_logging();
    EngineConfig::new(SAMPLE_RATE, max_block_size)
        .with_scheduling(SchedulingPolicy::Inherit)
        .with_underrun_timeout(Duration::from_secs(10))
}

/// Run `input` through `engine` in blocks of the given sizes (cycled)
fn run(engine: &mut ConvolutionEngine, input: &[Sample], blocks: &[usize]) -> Vec<Sample> {
    let mut output = vec![0.0; input.len()];
    let mut start = 0;
    for &block in blocks.iter().cycle() {
        if start >= input.len() {
            break;
        }
        let end = (start + block).min(input.len());
        engine
            .tick(&input[start..end], &mut output[start..end])
            .unwrap();
        start = end;
    }
    output
}

fn assert_matches(actual: &[Sample], expected: &[Sample], tolerance: f64) {
    assert_eq!(actual.len(), expected.len());
    for (n, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "sample {n}: got {a}, expected {e}"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIDELITY
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_unit_impulse_passes_input_through() {
    let mut impulse = vec![0.0; 5000];
    impulse[0] = 1.0;
    let input = generate_noise(12000, 1);

    let mut engine = ConvolutionEngine::with_config(&impulse, test_config(256)).unwrap();
    assert!(engine.thread_count() > 0);

    let output = run(&mut engine, &input, &[256]);
    assert_matches(&output, &input, TOLERANCE);
}

#[test]
fn test_delayed_tap_in_fft_region() {
    let mut impulse = vec![0.0; 6000];
    impulse[4321] = 0.75;
    let input = generate_noise(16000, 2);

    let mut engine = ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE)).unwrap();
    let output = run(&mut engine, &input, &[BLOCK_SIZE]);

    assert!(output[..4321].iter().all(|y| y.abs() <= TOLERANCE));
    for n in 4321..input.len() {
        assert!((output[n] - 0.75 * input[n - 4321]).abs() <= TOLERANCE);
    }
}

#[test]
fn test_step_response_sparse_impulse() {
    let mut impulse = vec![0.0; 8192];
    impulse[0] = 1.0;
    impulse[1] = 0.5;
    impulse[8191] = 0.25;
    let input = vec![1.0; 20000];

    let mut engine = ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE)).unwrap();
    let output = run(&mut engine, &input, &[BLOCK_SIZE]);

    assert_matches(&output, &reference(&impulse, &input), 1e-4);
    assert!((output[0] - 1.0).abs() < 1e-4);
    assert!((output[100] - 1.5).abs() < 1e-4);
    assert!((output[19999] - 1.75).abs() < 1e-4);
}

#[test]
fn test_dense_impulse_matches_reference() {
    let impulse = generate_impulse(3000, 3);
    let input = generate_noise(9000, 4);

    let mut engine = ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE)).unwrap();
    let output = run(&mut engine, &input, &[BLOCK_SIZE]);

    assert_matches(&output, &reference(&impulse, &input), 1e-8);
}

#[test]
fn test_varying_block_sizes_keep_zero_latency() {
    let impulse = generate_impulse(2500, 5);
    let input = generate_noise(8000, 6);
    let expected = reference(&impulse, &input);

    let mut engine = ConvolutionEngine::with_config(&impulse, test_config(256)).unwrap();
    assert_eq!(engine.latency(), 0);

    let output = run(&mut engine, &input, &[1, 17, 256, 64, 100, 3, 255, 128]);
    assert_matches(&output, &expected, 1e-8);
}

#[test]
fn test_linearity() {
    let impulse = generate_impulse(2000, 7);
    let x = generate_noise(6000, 8);
    let y = generate_noise(6000, 9);
    let mixed: Vec<Sample> = x.iter().zip(&y).map(|(a, b)| 2.0 * a - 0.5 * b).collect();

    let convolve = |signal: &[Sample]| {
        let mut engine =
            ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE)).unwrap();
        run(&mut engine, signal, &[BLOCK_SIZE])
    };
    let out_x = convolve(&x);
    let out_y = convolve(&y);
    let out_mixed = convolve(&mixed);

    for n in 0..mixed.len() {
        let combined = 2.0 * out_x[n] - 0.5 * out_y[n];
        assert!((out_mixed[n] - combined).abs() <= 1e-8);
    }
}

#[test]
fn test_short_impulse_runs_without_threads() {
    let input = generate_noise(1000, 11);

    for len in [40, 200] {
        let impulse = generate_impulse(len, 10);
        let mut engine =
            ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE)).unwrap();
        assert_eq!(engine.thread_count(), 0);
        assert!(engine.section_stats().is_empty());
        assert_eq!(engine.plan().is_direct_only(), len <= 64);

        let output = run(&mut engine, &input, &[BLOCK_SIZE]);
        assert_matches(&output, &reference(&impulse, &input), 1e-10);
    }
}

#[test]
fn test_large_blocks_stay_within_direct_budget() {
    let impulse = generate_impulse(10000, 27);
    let input = generate_noise(12000, 28);

    let config = test_config(2048).with_direct_budget(32);
    let mut engine = ConvolutionEngine::with_config(&impulse, config).unwrap();
    assert_eq!(engine.plan().direct_cost(), 32);
    assert!(engine.plan().inline_sections().count() > 0);
    assert!(engine.thread_count() > 0);

    let output = run(&mut engine, &input, &[2048, 1000, 7, 2048]);
    assert_matches(&output, &reference(&impulse, &input), 1e-8);
}

#[test]
fn test_from_multichannel_impulse() {
    let left = generate_impulse(1500, 12);
    let right = generate_impulse(1500, 13);
    let interleaved: Vec<Sample> = left
        .iter()
        .zip(&right)
        .flat_map(|(l, r)| [*l, *r])
        .collect();
    let ir = ImpulseResponse::new(interleaved, SAMPLE_RATE, 2);
    let input = generate_noise(4000, 14);

    let mut engine = ConvolutionEngine::from_impulse(&ir, 1, test_config(BLOCK_SIZE)).unwrap();
    let output = run(&mut engine, &input, &[BLOCK_SIZE]);
    assert_matches(&output, &reference(&right, &input), 1e-8);

    let mismatched = ImpulseResponse::mono(left, 44100.0);
    assert!(matches!(
        ConvolutionEngine::from_impulse(&mismatched, 0, test_config(BLOCK_SIZE)),
        Err(ConvolutionError::Configuration(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAN
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_plan_covers_impulse() {
    let impulse = generate_impulse(50000, 15);
    let engine =
        ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE).with_max_threads(3))
            .unwrap();
    let plan = engine.plan();

    let mut offset = 0;
    let mut previous_delay = None;
    for section in &plan.sections {
        assert_eq!(section.impulse_offset, offset);
        match section.kind {
            SectionKind::Threaded => {
                assert!(section.size.is_power_of_two());
                assert!(section.size >= plan.min_threaded_size);
                assert_eq!(section.section_delay, section.input_delay + 2 * section.size);
                assert!(section.thread_id.is_some());
            }
            SectionKind::Inline => {
                assert!(section.size <= section.section_delay);
                assert!(section.thread_id.is_none());
            }
            SectionKind::Direct => {
                assert!(section.taps <= plan.direct_budget);
                assert!(section.thread_id.is_none());
            }
        }
        if let Some(delay) = previous_delay {
            assert!(section.section_delay > delay);
        }
        previous_delay = Some(section.section_delay);
        offset = section.end();
    }
    assert_eq!(offset, 50000);

    assert!(!plan.threads.is_empty() && plan.threads.len() <= 3);
    assert_eq!(engine.thread_count(), plan.threads.len());
    for thread in &plan.threads {
        assert!(!thread.sections.is_empty());
    }
}

#[test]
fn test_invalid_input_rejected() {
    assert!(matches!(
        ConvolutionEngine::with_config(&[1.0, Sample::NAN], test_config(BLOCK_SIZE)),
        Err(ConvolutionError::InvalidImpulse(_))
    ));
    assert!(matches!(
        ConvolutionEngine::with_config(&[1.0; 100], test_config(0)),
        Err(ConvolutionError::Configuration(_))
    ));
    assert!(matches!(
        ConvolutionEngine::new(&[1.0; 100], -1.0, 64, SchedulingPolicy::Inherit),
        Err(ConvolutionError::Configuration(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_close_is_idempotent() {
    let mut engine =
        ConvolutionEngine::with_config(&generate_impulse(10000, 16), test_config(BLOCK_SIZE))
            .unwrap();
    let input = generate_noise(2048, 17);
    run(&mut engine, &input, &[BLOCK_SIZE]);

    engine.close();
    engine.close();
    assert!(engine.is_closed());

    let mut output = vec![0.0; BLOCK_SIZE];
    assert_eq!(
        engine.tick(&input[..BLOCK_SIZE], &mut output),
        Err(ConvolutionError::Closed)
    );
}

#[test]
fn test_drop_right_after_construction() {
    let started = Instant::now();
    for seed in 0..5 {
        let engine =
            ConvolutionEngine::with_config(&generate_impulse(30000, seed), test_config(64))
                .unwrap();
        drop(engine);
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_section_stats_count_blocks() {
    let impulse = generate_impulse(4000, 18);
    let mut engine = ConvolutionEngine::with_config(&impulse, test_config(BLOCK_SIZE)).unwrap();
    run(&mut engine, &generate_noise(16384, 19), &[BLOCK_SIZE]);

    let stats = engine.section_stats();
    assert_eq!(stats.len(), engine.plan().threaded_sections().count());
    // The smallest section runs from the first blocks on
    assert!(stats[0].blocks > 0);

    let totals = engine.stats();
    assert_eq!(totals.samples, 16384);
    assert_eq!(totals.blocks, 16384 / BLOCK_SIZE as u64);
    assert_eq!(totals.substituted_samples, 0);
    assert!(stats.iter().all(|s| s.resyncs == 0));
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNDERRUN
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_suspended_workers_cause_bounded_underruns() {
    let listener = Arc::new(CountingListener::default());
    let config = test_config(BLOCK_SIZE).with_underrun_timeout(Duration::from_millis(5));
    let mut engine =
        ConvolutionEngine::with_listener(&generate_impulse(4096, 20), config, listener.clone())
            .unwrap();
    engine.suspend_workers();

    let input = generate_noise(BLOCK_SIZE, 21);
    let mut output = vec![0.0; BLOCK_SIZE];
    for _ in 0..10 {
        let started = Instant::now();
        engine.tick(&input, &mut output).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(output.iter().all(|y| y.is_finite()));
    }

    assert!(engine.underrun_count() >= 1);
    assert_eq!(listener.underrun_count(), engine.underrun_count());
    assert!(engine.stats().substituted_samples > 0);

    engine.resume_workers();
    engine.close();
}

#[test]
fn test_output_realigns_after_resume() {
    let impulse = generate_impulse(4096, 22);
    let input = generate_noise(12800, 23);
    let expected = reference(&impulse, &input);

    let listener = Arc::new(CountingListener::default());
    let config = test_config(BLOCK_SIZE).with_underrun_timeout(Duration::from_millis(2));
    let mut engine = ConvolutionEngine::with_listener(&impulse, config, listener.clone()).unwrap();
    engine.suspend_workers();

    let mut output = vec![0.0; input.len()];
    let stalled = 10 * BLOCK_SIZE;
    for (x, y) in input[..stalled]
        .chunks(BLOCK_SIZE)
        .zip(output[..stalled].chunks_mut(BLOCK_SIZE))
    {
        engine.tick(x, y).unwrap();
    }
    assert!(engine.underrun_count() >= 1);

    engine.resume_workers();
    engine.set_underrun_timeout(Duration::from_secs(10));
    for (x, y) in input[stalled..]
        .chunks(BLOCK_SIZE)
        .zip(output[stalled..].chunks_mut(BLOCK_SIZE))
    {
        engine.tick(x, y).unwrap();
    }

    // Everything after the stall is exact again
    assert_matches(&output[stalled..], &expected[stalled..], 1e-8);
    // Reported again once the streak ended
    assert!(listener.ready_count() >= 1);
    assert!(listener.underrun_count() >= 1);
}

#[test]
fn test_stall_longer_than_input_feed_recovers() {
    let impulse = generate_impulse(4096, 29);
    // The input feed holds 16384 samples for this plan; stall for 25600
    let stalled = 200 * BLOCK_SIZE;
    let input = generate_noise(stalled + 60 * BLOCK_SIZE, 30);
    let expected = reference(&impulse, &input);

    let listener = Arc::new(CountingListener::default());
    let config = test_config(BLOCK_SIZE).with_underrun_timeout(Duration::from_millis(1));
    let mut engine = ConvolutionEngine::with_listener(&impulse, config, listener.clone()).unwrap();
    engine.suspend_workers();

    let mut output = vec![0.0; input.len()];
    for (x, y) in input[..stalled]
        .chunks(BLOCK_SIZE)
        .zip(output[..stalled].chunks_mut(BLOCK_SIZE))
    {
        engine.tick(x, y).unwrap();
    }
    assert!(engine.stats().substituted_samples >= (stalled / 2) as u64);

    engine.resume_workers();
    engine.set_underrun_timeout(Duration::from_secs(10));
    for (x, y) in input[stalled..]
        .chunks(BLOCK_SIZE)
        .zip(output[stalled..].chunks_mut(BLOCK_SIZE))
    {
        engine.tick(x, y).unwrap();
    }

    // Lapped sections skipped ahead; output right after the stall is exact
    assert!(engine.section_stats().iter().any(|s| s.resyncs > 0));
    assert_matches(&output[stalled..], &expected[stalled..], 1e-8);
    assert!(listener.ready_count() >= 1);

    // And the engine keeps running normally afterwards
    let more = generate_noise(4 * BLOCK_SIZE, 31);
    let mut tail = vec![0.0; more.len()];
    for (x, y) in more.chunks(BLOCK_SIZE).zip(tail.chunks_mut(BLOCK_SIZE)) {
        engine.tick(x, y).unwrap();
    }
    assert!(tail.iter().all(|y| y.is_finite()));
    engine.close();
}

// ═══════════════════════════════════════════════════════════════════════════════
// HOT SWAP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_swap_between_engines() {
    let first = generate_impulse(3000, 24);
    let second = generate_impulse(3000, 25);
    let input = generate_noise(4 * BLOCK_SIZE, 26);

    let (mut controller, mut slot) = swap_channel(2);
    assert!(
        controller
            .install(ConvolutionEngine::with_config(&first, test_config(BLOCK_SIZE)).unwrap())
            .is_ok()
    );

    let mut output = vec![0.0; input.len()];
    for (x, y) in input.chunks(BLOCK_SIZE).zip(output.chunks_mut(BLOCK_SIZE)) {
        slot.tick(x, y).unwrap();
    }
    assert_matches(&output, &reference(&first, &input), 1e-8);

    // Fresh engine starts from silence
    assert!(
        controller
            .install(ConvolutionEngine::with_config(&second, test_config(BLOCK_SIZE)).unwrap())
            .is_ok()
    );
    for (x, y) in input.chunks(BLOCK_SIZE).zip(output.chunks_mut(BLOCK_SIZE)) {
        slot.tick(x, y).unwrap();
    }
    assert_matches(&output, &reference(&second, &input), 1e-8);

    assert_eq!(controller.collect_retired(), 1);
    assert_eq!(slot.swap_count(), 2);
}
