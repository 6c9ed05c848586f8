//! Play/pause driver for a [`Simulation`].
//!
//! The play loop runs on its own thread and issues one generation at a time.
//! A generation, the queued source injections before it and the tick
//! increment after it all happen under a single lock on the simulation, so
//! readers going through [`SimulationController::with_state`] only ever see
//! the water field between generations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, trace, warn};

use crate::error::{FlowError, Result};
use crate::simulation::simulation::Simulation;
use crate::simulation::types::{GenerationReport, RunState, SimTick, TickEvent};
use crate::terrain::HeightField;
use crate::tilemap::Tilemap;

struct Shared {
    sim: Mutex<Simulation>,
    stop: AtomicBool,
    in_progress: AtomicBool,
    tick: AtomicU64,
    pending: Mutex<Vec<(usize, usize)>>,
    subscribers: Mutex<Vec<Sender<TickEvent>>>,
    tick_delay: Duration,
}

impl Shared {
    fn lock_sim(&self) -> Result<MutexGuard<'_, Simulation>> {
        self.sim
            .lock()
            .map_err(|_| FlowError::ControlLoop("simulation lock poisoned".into()))
    }

    fn publish(&self, event: TickEvent) {
        match self.subscribers.lock() {
            Ok(mut subs) => subs.retain(|tx| tx.send(event.clone()).is_ok()),
            Err(_) => warn!("Subscriber list poisoned, dropping {:?}", event),
        }
    }

    fn apply_pending(&self, sim: &mut Simulation) -> Result<()> {
        let queued = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| FlowError::ControlLoop("source queue poisoned".into()))?;
            std::mem::take(&mut *pending)
        };
        for (x, y) in queued {
            sim.inject_source(x, y)?;
            trace!("Applied queued source at ({}, {})", x, y);
            self.publish(TickEvent::SourceInjected { x, y, tick: sim.tick() });
        }
        Ok(())
    }

    /// Run one generation. Only one may be in flight at a time.
    fn advance(&self) -> Result<GenerationReport> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FlowError::InvalidStateTransition {
                from: "a generation is in progress",
                action: "start a generation",
            });
        }

        let result = self.lock_sim().and_then(|mut sim| {
            self.apply_pending(&mut sim)?;
            let report = sim.step()?;
            self.tick.store(report.tick.0, Ordering::Release);
            Ok(report)
        });
        self.in_progress.store(false, Ordering::Release);

        if let Ok(report) = &result {
            self.publish(TickEvent::GenerationComplete(report.clone()));
        }
        result
    }
}

fn run_loop(shared: Arc<Shared>) {
    info!("Play loop started at {}", SimTick(shared.tick.load(Ordering::Acquire)));
    while !shared.stop.load(Ordering::Acquire) {
        if let Err(e) = shared.advance() {
            error!("Play loop halted: {}", e);
            shared.publish(TickEvent::Halted { reason: e.to_string() });
            break;
        }
        if shared.tick_delay.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(shared.tick_delay);
        }
    }
}

/// Owns the play loop thread and the shared simulation.
pub struct SimulationController {
    shared: Arc<Shared>,
    terrain: Arc<HeightField>,
    worker: Option<JoinHandle<()>>,
    stopped: bool,
}

impl SimulationController {
    pub fn new(sim: Simulation) -> Self {
        let terrain = sim.shared_terrain();
        let tick = sim.tick().0;
        let tick_delay = Duration::from_millis(sim.params().tick_delay_ms);
        Self {
            shared: Arc::new(Shared {
                sim: Mutex::new(sim),
                stop: AtomicBool::new(true),
                in_progress: AtomicBool::new(false),
                tick: AtomicU64::new(tick),
                pending: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                tick_delay,
            }),
            terrain,
            worker: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> RunState {
        if self.stopped {
            RunState::Stopped
        } else if self.worker.as_ref().is_some_and(|h| !h.is_finished()) {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// True while a generation's workers are active.
    pub fn is_generation_in_progress(&self) -> bool {
        self.shared.in_progress.load(Ordering::Acquire)
    }

    /// Read-only terrain; safe to read at any time.
    pub fn terrain(&self) -> &Arc<HeightField> {
        &self.terrain
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.terrain.width(), self.terrain.height())
    }

    /// Tick of the last completed generation, without taking the lock.
    pub fn tick(&self) -> SimTick {
        SimTick(self.shared.tick.load(Ordering::Acquire))
    }

    /// Receive generation, reset, injection and pause notifications.
    pub fn subscribe(&self) -> Receiver<TickEvent> {
        let (tx, rx) = mpsc::channel();
        match self.shared.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(_) => warn!("Subscriber list poisoned, new subscriber will not hear events"),
        }
        rx
    }

    /// Start ticking. Does nothing if already running.
    pub fn play(&mut self) -> Result<()> {
        match self.state() {
            RunState::Running => return Ok(()),
            RunState::Stopped => {
                return Err(FlowError::InvalidStateTransition { from: "stopped", action: "play" })
            }
            RunState::Idle => {}
        }
        // A loop that halted on its own still needs joining.
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Previous play loop had panicked");
            }
        }

        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("flow-ctrl".into())
            .spawn(move || run_loop(shared))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop ticking. The generation in flight finishes first; this call
    /// returns once the loop has exited.
    pub fn pause(&mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| FlowError::ControlLoop("play loop panicked".into()))?;

        // Sources queued during the final generation.
        {
            let mut sim = self.shared.lock_sim()?;
            self.shared.apply_pending(&mut sim)?;
        }
        let tick = self.tick();
        info!("Paused at {}", tick);
        self.shared.publish(TickEvent::Paused { tick });
        Ok(())
    }

    /// Clear the water and tick counter. Only legal while paused.
    pub fn reset(&mut self) -> Result<()> {
        self.require_idle("reset")?;
        {
            let mut sim = self.shared.lock_sim()?;
            if let Ok(mut pending) = self.shared.pending.lock() {
                pending.clear();
            }
            sim.reset();
            self.shared.tick.store(0, Ordering::Release);
        }
        self.shared.publish(TickEvent::Reset);
        Ok(())
    }

    /// Add a source centred at `(x, y)`. While running the source is queued
    /// and applied at the next generation boundary.
    pub fn inject_source(&self, x: usize, y: usize) -> Result<()> {
        let (width, height) = self.dimensions();
        if x >= width || y >= height {
            return Err(FlowError::out_of_bounds(x as i64, y as i64, width, height));
        }
        if self.stopped {
            return Err(FlowError::InvalidStateTransition { from: "stopped", action: "inject a source" });
        }

        if self.is_running() {
            self.shared
                .pending
                .lock()
                .map_err(|_| FlowError::ControlLoop("source queue poisoned".into()))?
                .push((x, y));
            trace!("Queued source at ({}, {})", x, y);
        } else {
            let tick = {
                let mut sim = self.shared.lock_sim()?;
                sim.inject_source(x, y)?;
                sim.tick()
            };
            self.shared.publish(TickEvent::SourceInjected { x, y, tick });
        }
        Ok(())
    }

    /// Run a single generation while paused.
    pub fn step(&mut self) -> Result<GenerationReport> {
        self.require_idle("step")?;
        self.shared.advance()
    }

    /// Run exactly `generations` generations on the calling thread.
    pub fn run_for(&mut self, generations: usize) -> Result<Vec<GenerationReport>> {
        self.require_idle("run generations")?;
        (0..generations).map(|_| self.shared.advance()).collect()
    }

    /// Read the simulation between generations.
    pub fn with_state<R>(&self, f: impl FnOnce(&Simulation) -> R) -> Result<R> {
        let sim = self.shared.lock_sim()?;
        Ok(f(&sim))
    }

    /// Tick and depths of the last completed generation, read together.
    pub fn snapshot(&self) -> Result<(SimTick, Tilemap<u32>)> {
        self.with_state(|sim| (sim.tick(), sim.water().snapshot()))
    }

    /// Pause for good. The controller stays readable but rejects every
    /// command that would change the simulation. Returns the final tick.
    pub fn end(&mut self) -> Result<SimTick> {
        if !self.stopped {
            self.pause()?;
            self.stopped = true;
            info!("Simulation ended at {}", self.tick());
        }
        Ok(self.tick())
    }

    fn require_idle(&self, action: &'static str) -> Result<()> {
        match self.state() {
            RunState::Idle => Ok(()),
            other => Err(FlowError::InvalidStateTransition { from: other.as_str(), action }),
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ConcurrencyModel, FlowParams};
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn params() -> FlowParams {
        FlowParams {
            model: ConcurrencyModel::Snapshot,
            seed: Some(3),
            tick_delay_ms: 1,
            ..Default::default()
        }
    }

    fn valley() -> HeightField {
        HeightField::from_fn(16, 16, |x, y| {
            let dx = x as f32 - 6.0;
            let dy = y as f32 - 9.0;
            0.03 * (dx * dx + dy * dy).sqrt()
        })
        .unwrap()
    }

    /// High plateau with a sunken 9x9 basin; water injected inside never leaves.
    fn basin() -> HeightField {
        HeightField::from_fn(20, 20, |x, y| {
            if (6..15).contains(&x) && (6..15).contains(&y) { 0.0 } else { 10.0 }
        })
        .unwrap()
    }

    fn controller(terrain: HeightField) -> SimulationController {
        SimulationController::new(Simulation::new(terrain, params()).unwrap())
    }

    fn wait_for_generations(rx: &Receiver<TickEvent>, count: usize) {
        let mut seen = 0;
        while seen < count {
            match rx.recv_timeout(WAIT).expect("no generation event") {
                TickEvent::GenerationComplete(_) => seen += 1,
                _ => {}
            }
        }
    }

    #[test]
    fn test_play_and_pause() {
        let mut ctrl = controller(valley());
        let rx = ctrl.subscribe();
        ctrl.inject_source(6, 9).unwrap();
        assert_eq!(ctrl.state(), RunState::Idle);

        ctrl.play().unwrap();
        assert_eq!(ctrl.state(), RunState::Running);
        ctrl.play().unwrap();
        wait_for_generations(&rx, 3);
        ctrl.pause().unwrap();

        assert_eq!(ctrl.state(), RunState::Idle);
        assert!(!ctrl.is_generation_in_progress());
        let tick = ctrl.tick();
        assert!(tick.0 >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ctrl.tick(), tick);
        assert_eq!(ctrl.with_state(|sim| sim.tick()).unwrap(), tick);
        assert!(rx.try_iter().any(|e| matches!(e, TickEvent::Paused { .. })));
    }

    #[test]
    fn test_reset_requires_pause() {
        let mut ctrl = controller(valley());
        let rx = ctrl.subscribe();
        ctrl.inject_source(6, 9).unwrap();
        ctrl.play().unwrap();
        assert!(matches!(
            ctrl.reset(),
            Err(FlowError::InvalidStateTransition { from: "running", action: "reset" })
        ));
        assert!(matches!(ctrl.step(), Err(FlowError::InvalidStateTransition { .. })));
        ctrl.pause().unwrap();

        ctrl.reset().unwrap();
        assert_eq!(ctrl.tick(), SimTick(0));
        assert_eq!(ctrl.with_state(|sim| sim.total_depth()).unwrap(), 0);
        assert!(rx.try_iter().any(|e| matches!(e, TickEvent::Reset)));
    }

    #[test]
    fn test_inject_while_running_is_applied_at_boundary() {
        let mut ctrl = controller(basin());
        let rx = ctrl.subscribe();
        ctrl.play().unwrap();
        wait_for_generations(&rx, 1);
        ctrl.inject_source(10, 10).unwrap();
        let deadline = Instant::now() + WAIT;
        let mut applied = false;
        while !applied && Instant::now() < deadline {
            if let Ok(TickEvent::SourceInjected { x: 10, y: 10, .. }) = rx.recv_timeout(WAIT) {
                applied = true;
            }
        }
        ctrl.pause().unwrap();
        assert!(applied);
        assert_eq!(ctrl.with_state(|sim| sim.total_depth()).unwrap(), 147);
    }

    #[test]
    fn test_inject_queued_in_last_generation_survives_pause() {
        let mut ctrl = controller(basin());
        ctrl.play().unwrap();
        ctrl.inject_source(9, 9).unwrap();
        ctrl.pause().unwrap();
        assert_eq!(ctrl.with_state(|sim| sim.total_depth()).unwrap(), 147);
    }

    #[test]
    fn test_inject_out_of_bounds() {
        let ctrl = controller(valley());
        assert!(matches!(ctrl.inject_source(16, 0), Err(FlowError::OutOfBounds { .. })));
    }

    #[test]
    fn test_run_for_is_synchronous() {
        let mut ctrl = controller(valley());
        let rx = ctrl.subscribe();
        ctrl.inject_source(6, 9).unwrap();
        let reports = ctrl.run_for(5).unwrap();
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[4].tick, SimTick(5));
        assert_eq!(ctrl.tick(), SimTick(5));
        let completed = rx
            .try_iter()
            .filter(|e| matches!(e, TickEvent::GenerationComplete(_)))
            .count();
        assert_eq!(completed, 5);
        assert_eq!(ctrl.step().unwrap().tick, SimTick(6));
    }

    #[test]
    fn test_end_is_terminal() {
        let mut ctrl = controller(valley());
        ctrl.play().unwrap();
        ctrl.pause().unwrap();
        ctrl.inject_source(3, 3).unwrap();
        let tick = ctrl.tick();
        assert_eq!(ctrl.end().unwrap(), tick);
        assert_eq!(ctrl.state(), RunState::Stopped);

        assert!(matches!(
            ctrl.play(),
            Err(FlowError::InvalidStateTransition { from: "stopped", action: "play" })
        ));
        assert!(matches!(ctrl.inject_source(3, 3), Err(FlowError::InvalidStateTransition { .. })));
        assert!(matches!(ctrl.reset(), Err(FlowError::InvalidStateTransition { from: "stopped", .. })));
        assert!(matches!(ctrl.step(), Err(FlowError::InvalidStateTransition { .. })));
        assert!(matches!(ctrl.run_for(2), Err(FlowError::InvalidStateTransition { .. })));

        let (snap_tick, depths) = ctrl.snapshot().unwrap();
        assert_eq!(snap_tick, tick);
        assert_eq!(depths.sum(), ctrl.with_state(|sim| sim.total_depth()).unwrap());
        assert_eq!(ctrl.end().unwrap(), tick);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut ctrl = controller(valley());
        drop(ctrl.subscribe());
        let rx = ctrl.subscribe();
        ctrl.run_for(2).unwrap();
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(ctrl.shared.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_readers_only_see_completed_generations() {
        let terrain = valley();
        let mut sim = Simulation::new(terrain.clone(), params()).unwrap();
        sim.inject_source(6, 9).unwrap();
        sim.inject_source(11, 4).unwrap();
        let mut ctrl = SimulationController::new(sim);

        // Snapshot-model results do not depend on visit order or workers.
        let reference_params = FlowParams { workers: 1, seed: Some(99), ..params() };
        let mut reference = Simulation::new(terrain, reference_params).unwrap();
        reference.inject_source(6, 9).unwrap();
        reference.inject_source(11, 4).unwrap();

        ctrl.play().unwrap();
        let mut observed = Vec::new();
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            let (tick, depths) = ctrl.snapshot().unwrap();
            let done = tick.0 >= 25;
            observed.push((tick, depths));
            if done {
                break;
            }
        }
        ctrl.pause().unwrap();

        let last = observed.iter().map(|(t, _)| t.0).max().unwrap();
        assert!(last >= 25);
        let mut expected = vec![reference.water().snapshot()];
        for _ in 0..last {
            reference.step().unwrap();
            expected.push(reference.water().snapshot());
        }
        for (tick, depths) in &observed {
            assert_eq!(depths, &expected[tick.0 as usize], "mixed state observed at {}", tick);
        }
    }
}
