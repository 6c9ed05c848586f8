//! Water flow simulation
//!
//! - **step**: the per-cell transfer rule
//! - **engine**: sharded parallel execution of one generation
//! - **params**: tunables and the concurrency model selection

pub mod engine;
pub mod params;
pub mod step;

pub use engine::{partition, FlowEngine, GenerationStats, ShardFailure};
pub use params::{ConcurrencyModel, FlowParams};
pub use step::{flow_step, plan_transfer, surface, Transfer};
