//! Durable fan-out/fan-in orchestration.
//!
//! A supervisor run executes turns through an [`engine::ExecutionEngine`].
//! When a turn requests worker jobs the run suspends on a barrier; workers
//! pull those jobs from the leased queue, and whichever report completes
//! the barrier resumes the run exactly once with every result injected.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod process;
pub mod server;
pub mod store;
pub mod worker;
