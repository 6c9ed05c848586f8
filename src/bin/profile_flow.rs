//! Profiling tool comparing worker counts and concurrency models

use std::time::{Duration, Instant};

use waterflow::flow::{ConcurrencyModel, FlowParams};
use waterflow::simulation::Simulation;
use waterflow::terrain::HeightField;

const GENERATIONS: usize = 200;
const WORKER_COUNTS: [usize; 4] = [1, 2, 4, 8];

/// Rolling hills tilted towards one corner so water keeps moving.
fn synthetic_terrain(width: usize, height: usize) -> waterflow::Result<HeightField> {
    HeightField::from_fn(width, height, |x, y| {
        let fx = x as f32 / width as f32;
        let fy = y as f32 / height as f32;
        let hills = (fx * 12.0).sin() * (fy * 9.0).cos() * 0.05;
        0.4 * fx + 0.3 * fy + hills
    })
}

fn profile(terrain: &HeightField, workers: usize, model: ConcurrencyModel) -> waterflow::Result<(Duration, u64, u64)> {
    let params = FlowParams { workers, model, seed: Some(1337), ..Default::default() };
    let mut sim = Simulation::new(terrain.clone(), params)?;
    let (w, h) = (terrain.width(), terrain.height());
    for cx in (w / 8..w).step_by((w / 4).max(1)) {
        for cy in (h / 8..h).step_by((h / 4).max(1)) {
            sim.inject_source(cx, cy)?;
        }
    }

    let start = Instant::now();
    let reports = sim.run(GENERATIONS)?;
    let elapsed = start.elapsed();
    let transfers = reports.iter().map(|r| r.stats.transfers).sum();
    Ok((elapsed, transfers, sim.total_depth()))
}

fn main() -> waterflow::Result<()> {
    let width = 512;
    let height = 512;

    println!("=== Flow Profiling ===");
    println!("Map size: {}x{} ({} cells), {} generations", width, height, width * height, GENERATIONS);
    println!();

    let terrain = synthetic_terrain(width, height)?;

    for &model in ConcurrencyModel::all() {
        println!("{} model: {}", model, model.description());
        let mut baseline = None;
        for workers in WORKER_COUNTS {
            let (elapsed, transfers, remaining) = profile(&terrain, workers, model)?;
            let base = *baseline.get_or_insert(elapsed);
            println!(
                "  {:>2} workers: {:>10.2?} ({:>5.2}x)  {:>9} transfers  {:>7} units left",
                workers,
                elapsed,
                base.as_secs_f64() / elapsed.as_secs_f64(),
                transfers,
                remaining
            );
        }
        println!();
    }
    Ok(())
}
