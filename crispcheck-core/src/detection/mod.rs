//! Per-target detection: markers, the passive signal observer, and the staged
//! engine that races active probes against it.

mod engine;
pub mod markers;
mod signal;

pub use engine::*;
pub use signal::*;
