//! Core types for the simulation driver

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flow::GenerationStats;

/// Number of completed generations since the last reset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    pub fn next(&self) -> SimTick {
        SimTick(self.0 + 1)
    }
}

impl fmt::Display for SimTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time: {}", self.0)
    }
}

/// Whether the play loop is ticking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
        }
    }
}

/// Outcome of one completed generation
#[derive(Clone, Debug, Serialize)]
pub struct GenerationReport {
    /// Tick reached by this generation
    pub tick: SimTick,
    pub stats: GenerationStats,
}

/// Notifications delivered to subscribers (renderers, time displays)
#[derive(Clone, Debug)]
pub enum TickEvent {
    /// A generation crossed its barrier; the water field is stable to read.
    GenerationComplete(GenerationReport),
    /// Water and tick counter were cleared.
    Reset,
    /// A source was added to the water field.
    SourceInjected { x: usize, y: usize, tick: SimTick },
    /// The play loop stopped after finishing its last generation.
    Paused { tick: SimTick },
    /// The play loop gave up on an unrecoverable error.
    Halted { reason: String },
}
