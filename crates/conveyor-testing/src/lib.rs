//! Testing utilities for the Conveyor job queue.
//!
//! Provides [`MemoryStateStore`], a complete in-memory [`StateStore`] for
//! tests and examples, deterministic handler doubles, and a [`TestHarness`]
//! that wires an engine over in-memory backends with millisecond pacing.

mod handlers;
mod harness;
mod store;

pub use handlers::{CountingHandler, FailNTimesHandler, FailingHandler, NeverFinishHandler, SucceedingHandler};
pub use harness::{fast_config, TestHarness, TestHarnessBuilder};
pub use store::MemoryStateStore;
