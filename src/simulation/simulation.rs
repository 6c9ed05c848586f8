//! Main simulation state and tick loop

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::flow::{FlowEngine, FlowParams};
use crate::simulation::types::{GenerationReport, SimTick};
use crate::terrain::HeightField;
use crate::water::WaterField;

/// Terrain, water, engine and tick counter owned by a single driver.
///
/// [`Simulation::step`] takes `&mut self`, so nothing can read the water field
/// while a generation is running.
pub struct Simulation {
    terrain: Arc<HeightField>,
    water: WaterField,
    engine: FlowEngine,
    params: FlowParams,
    tick: SimTick,
    last_report: Option<GenerationReport>,
}

impl Simulation {
    pub fn new(terrain: HeightField, params: FlowParams) -> Result<Self> {
        Self::with_shared_terrain(Arc::new(terrain), params)
    }

    pub fn with_shared_terrain(terrain: Arc<HeightField>, params: FlowParams) -> Result<Self> {
        let engine = FlowEngine::new(&params)?;
        let water = match params.seed {
            Some(seed) => WaterField::with_seed(terrain.width(), terrain.height(), seed),
            None => WaterField::new(terrain.width(), terrain.height()),
        };
        info!(
            "Simulation ready: {}x{} grid, {} workers, {} model",
            terrain.width(),
            terrain.height(),
            engine.workers(),
            engine.model()
        );
        Ok(Self {
            terrain,
            water,
            engine,
            params,
            tick: SimTick::default(),
            last_report: None,
        })
    }

    pub fn terrain(&self) -> &HeightField {
        &self.terrain
    }

    /// Handle to the read-only terrain, for readers that outlive a borrow.
    pub fn shared_terrain(&self) -> Arc<HeightField> {
        Arc::clone(&self.terrain)
    }

    pub fn water(&self) -> &WaterField {
        &self.water
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    pub fn tick(&self) -> SimTick {
        self.tick
    }

    pub fn width(&self) -> usize {
        self.terrain.width()
    }

    pub fn height(&self) -> usize {
        self.terrain.height()
    }

    pub fn height_at(&self, x: usize, y: usize) -> Result<f32> {
        self.terrain.height_at(x, y)
    }

    pub fn depth_at(&self, x: usize, y: usize) -> Result<u32> {
        self.water.depth_at(x, y)
    }

    pub fn total_depth(&self) -> u64 {
        self.water.total_depth()
    }

    pub fn last_report(&self) -> Option<&GenerationReport> {
        self.last_report.as_ref()
    }

    /// Run one generation and advance the tick counter.
    ///
    /// Shard failures do not abort the generation; they are listed in the
    /// returned report's stats.
    pub fn step(&mut self) -> Result<GenerationReport> {
        let stats = self.engine.run_generation(&mut self.water, &self.terrain)?;
        self.tick = self.tick.next();
        if !stats.is_clean() {
            warn!("Generation {} finished with {} failed shards", self.tick.0, stats.failures.len());
        }
        debug!("Generation {} complete, {} units on the grid", self.tick.0, stats.total_depth);
        let report = GenerationReport { tick: self.tick, stats };
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Run `generations` consecutive generations.
    pub fn run(&mut self, generations: usize) -> Result<Vec<GenerationReport>> {
        (0..generations).map(|_| self.step()).collect()
    }

    /// Zero the tick counter and the water field, drawing a new visit order.
    pub fn reset(&mut self) {
        self.water.reset();
        self.tick = SimTick::default();
        self.last_report = None;
        info!("Simulation reset");
    }

    /// Add a source centred at `(x, y)`. The centre must be on the grid;
    /// window cells hanging off the edge are skipped.
    pub fn inject_source(&mut self, x: usize, y: usize) -> Result<u64> {
        if x >= self.width() || y >= self.height() {
            return Err(FlowError::out_of_bounds(x as i64, y as i64, self.width(), self.height()));
        }
        Ok(self.water.inject_source_with(
            x as i64,
            y as i64,
            self.params.source_radius,
            self.params.source_amount,
        ))
    }
}

impl GenerationReport {
    /// Turn the first shard failure, if any, into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.stats.failures.first() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(self),
        }
    }
}
