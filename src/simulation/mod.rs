//! Simulation driver
//!
//! Owns the terrain, the water field and the flow engine, and advances them
//! one generation at a time.
//!
//! # Module Structure
//!
//! - `types`: Tick counter, run state, reports and events
//! - `simulation`: Single-owner state and the step/reset/inject operations
//! - `controller`: Threaded play/pause loop with subscriber notifications
//!
//! # Usage
//!
//! ```ignore
//! use waterflow::simulation::{Simulation, SimulationController};
//!
//! let mut sim = Simulation::new(terrain, FlowParams::default())?;
//! sim.inject_source(64, 64)?;
//! let mut ctrl = SimulationController::new(sim);
//! ctrl.play()?;
//! ```

pub mod controller;
pub mod simulation;
pub mod types;

pub use controller::SimulationController;
pub use simulation::Simulation;
pub use types::{GenerationReport, RunState, SimTick, TickEvent};
