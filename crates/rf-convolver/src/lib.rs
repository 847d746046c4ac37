//! rf-convolver: Zero-latency partitioned convolution
//!
//! Convolves a real-time stream with a long impulse response. A short head
//! of the impulse (a fixed multiply-accumulate budget) is evaluated directly
//! on the audio thread, followed by a few small FFT sections that also run
//! inline; the rest is split into non-uniform FFT sections that run on
//! background worker threads and are merged back, in order, by an assembly
//! thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   input feed    ┌─────────────┐  section    ┌────────────┐
//! │ audio thread │────────────────▶│  workers    │────────────▶│  assembly  │
//! │              │  (broadcast)    │             │  channels   │            │
//! │ - tick()     │                 │ - FFT       │  (SPSC)     │ - merge in │
//! │ - direct     │                 │   sections  │             │   order    │
//! │   head       │                 │             │             │            │
//! │ - inline FFT │◀────────────────┴─────────────┴─────────────│            │
//! └──────────────┘          AssemblyQueue (SPSC)               └────────────┘
//! ```
//!
//! Output is sample-exact with zero added latency as long as the workers keep
//! up; otherwise the audio thread waits, then substitutes silence and stays
//! aligned afterwards.

mod assembly;
mod config;
mod direct;
mod engine;
mod error;
mod fft;
mod fft_section;
mod impulse;
mod inline_section;
mod listener;
mod planner;
mod ring_channel;
mod swap;
mod thread_priority;
mod threaded_section;
mod worker;

pub use assembly::*;
pub use config::*;
pub use direct::*;
pub use engine::*;
pub use error::*;
pub use fft::*;
pub use fft_section::*;
pub use impulse::*;
pub use inline_section::*;
pub use listener::*;
pub use planner::*;
pub use ring_channel::*;
pub use swap::*;
pub use thread_priority::*;
pub use threaded_section::*;
pub use worker::*;

/// Sample type used throughout the engine.
pub type Sample = f64;
