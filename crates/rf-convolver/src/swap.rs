//! Engine hot-swap
//!
//! Engines are built and torn down off the audio thread (construction plans,
//! allocates and spawns threads; closing joins them). The audio thread only
//! exchanges boxed engines through two lock-free queues:
//!
//! ```text
//! SwapController ──pending──▶ EngineSlot (audio thread)
//!        ▲                          │
//!        └──────────retired─────────┘
//! ```

use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::engine::ConvolutionEngine;
use crate::{ConvolutionResult, Sample};

/// Create a controller/slot pair holding up to `capacity` engines in flight
/// each way.
pub fn swap_channel(capacity: usize) -> (SwapController, EngineSlot) {
    let capacity = capacity.max(1);
    let (pending_tx, pending_rx) = RingBuffer::new(capacity);
    let (retired_tx, retired_rx) = RingBuffer::new(capacity);
    (
        SwapController {
            pending: pending_tx,
            retired: retired_rx,
        },
        EngineSlot {
            current: None,
            pending: pending_rx,
            retired: retired_tx,
            swaps: 0,
        },
    )
}

/// Non-real-time side: installs new engines, closes retired ones.
pub struct SwapController {
    pending: Producer<Box<ConvolutionEngine>>,
    retired: Consumer<Box<ConvolutionEngine>>,
}

impl SwapController {
    /// Queue `engine` for the audio thread. Hands it back if the queue is
    /// full.
    pub fn install(&mut self, engine: ConvolutionEngine) -> Result<(), ConvolutionEngine> {
        self.collect_retired();
        match self.pending.push(Box::new(engine)) {
            Ok(()) => Ok(()),
            Err(PushError::Full(engine)) => Err(*engine),
        }
    }

    /// Close and drop engines the audio thread has let go of.
    pub fn collect_retired(&mut self) -> usize {
        let mut collected = 0;
        while let Ok(mut engine) = self.retired.pop() {
            engine.close();
            collected += 1;
        }
        if collected > 0 {
            log::debug!("Collected {collected} retired convolution engine(s)");
        }
        collected
    }

    /// Engines queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.pending.buffer().capacity() - self.pending.slots()
    }
}

/// Audio-thread side: owns the active engine.
pub struct EngineSlot {
    current: Option<Box<ConvolutionEngine>>,
    pending: Consumer<Box<ConvolutionEngine>>,
    retired: Producer<Box<ConvolutionEngine>>,
    swaps: u64,
}

impl EngineSlot {
    /// Pick up a queued engine (if any) at this block boundary, then convolve.
    /// Outputs silence while no engine is installed.
    pub fn tick(&mut self, input: &[Sample], output: &mut [Sample]) -> ConvolutionResult<()> {
        // Only swap when the old engine can be handed back without dropping it here
        if self.retired.slots() > 0 {
            if let Ok(next) = self.pending.pop() {
                if let Some(old) = self.current.replace(next) {
                    // Free slot checked above
                    let _ = self.retired.push(old);
                }
                self.swaps += 1;
            }
        }

        match self.current.as_mut() {
            Some(engine) => engine.tick(input, output),
            None => {
                output.fill(0.0);
                Ok(())
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn engine(&self) -> Option<&ConvolutionEngine> {
        self.current.as_deref()
    }

    /// Engines picked up so far.
    pub fn swap_count(&self) -> u64 {
        self.swaps
    }
}
