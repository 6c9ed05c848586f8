//! Water flow simulation library
//!
//! Re-exports modules for use by binaries and tools.

pub mod error;
pub mod flow;
pub mod render;
pub mod simulation;
pub mod terrain;
pub mod tilemap;
pub mod viewer;
pub mod water;

pub use error::{FlowError, Result};
pub use flow::{ConcurrencyModel, FlowEngine, FlowParams};
pub use simulation::{Simulation, SimulationController};
pub use terrain::HeightField;
pub use water::WaterField;
