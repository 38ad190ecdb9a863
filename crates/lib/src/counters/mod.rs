//! Build telemetry counters.
//!
//! Counters accumulate concurrently and are flushed to a [`CounterSink`]. A
//! flush captures and resets in one step, so no event is lost or reported
//! twice across flush boundaries.

mod registry;
mod types;

pub use registry::{
  CounterRegistry, CounterSink, MIN_FLUSH_INTERVAL, PeriodicFlush, TracingCounterSink, spawn_periodic_flush,
};
pub use types::{Counter, CounterInfo, CounterSnapshot, CounterValue, IntegerCounter, SamplingCounter};
