use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};
use serde::Serialize;

use waterflow::error::Result;
use waterflow::flow::{ConcurrencyModel, FlowParams};
use waterflow::simulation::{GenerationReport, SimTick, Simulation, SimulationController};
use waterflow::terrain::HeightField;
use waterflow::{render, viewer};

#[derive(Parser, Debug)]
#[command(name = "waterflow")]
#[command(about = "Simulate water spreading over a height field")]
struct Args {
    /// Height file: width, height, then width*height values (outer loop over x)
    height_file: PathBuf,

    /// Number of worker threads per generation
    #[arg(short, long)]
    workers: Option<usize>,

    /// Concurrency model: snapshot (deterministic) or atomic (legacy in-place updates)
    #[arg(short, long)]
    model: Option<ConcurrencyModel>,

    /// Seed for the cell visit order (random if not specified)
    #[arg(short, long)]
    seed: Option<u64>,

    /// JSON file with simulation parameters; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run without a window
    #[arg(long)]
    headless: bool,

    /// Generations to run in headless mode
    #[arg(short, long, default_value = "100")]
    ticks: usize,

    /// Water source centre as X,Y (repeatable)
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<(usize, usize)>,

    /// Save the final view as a PNG (headless mode)
    #[arg(long)]
    export: Option<PathBuf>,

    /// Write per-generation statistics as JSON (headless mode)
    #[arg(long)]
    report: Option<PathBuf>,
}

fn parse_source(s: &str) -> std::result::Result<(usize, usize), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{}'", s))?;
    let x = x.trim().parse().map_err(|e| format!("bad X in '{}': {}", s, e))?;
    let y = y.trim().parse().map_err(|e| format!("bad Y in '{}': {}", s, e))?;
    Ok((x, y))
}

#[derive(Serialize)]
struct RunReport<'a> {
    width: usize,
    height: usize,
    workers: usize,
    model: ConcurrencyModel,
    final_tick: SimTick,
    total_depth: u64,
    generations: &'a [GenerationReport],
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut params = match &args.config {
        Some(path) => FlowParams::from_json_file(path)?,
        None => FlowParams::default(),
    };
    if let Some(workers) = args.workers {
        params.workers = workers;
    }
    if let Some(model) = args.model {
        params.model = model;
    }
    if args.seed.is_some() {
        params.seed = args.seed;
    }
    params.validate()?;

    let terrain = HeightField::load(&args.height_file)?;
    let (min_h, max_h) = terrain.range();
    println!(
        "Loaded {}x{} height field, heights {:.3} to {:.3}",
        terrain.width(),
        terrain.height(),
        min_h,
        max_h
    );

    let mut sim = Simulation::new(terrain, params)?;
    for &(x, y) in &args.sources {
        let added = sim.inject_source(x, y)?;
        info!("Added {} units at ({}, {})", added, x, y);
    }

    let controller = SimulationController::new(sim);
    if args.headless {
        run_headless(controller, &args)
    } else {
        viewer::run_viewer(controller)?;
        Ok(())
    }
}

fn run_headless(mut controller: SimulationController, args: &Args) -> Result<()> {
    println!("Running {} generations...", args.ticks);
    let reports = controller.run_for(args.ticks)?;

    let transfers: u64 = reports.iter().map(|r| r.stats.transfers).sum();
    let drained: u64 = reports.iter().map(|r| r.stats.drained).sum();
    let failures: usize = reports.iter().map(|r| r.stats.failures.len()).sum();
    let (tick, depths) = controller.snapshot()?;
    println!("Done! {}", tick);
    println!("  Transfers: {}", transfers);
    println!("  Drained at edges: {}", drained);
    println!("  Water remaining: {}", depths.sum());
    if failures > 0 {
        println!("  Failed shards: {}", failures);
    }

    if let Some(path) = &args.export {
        render::export_png(controller.terrain(), &depths, path)?;
        println!("Exported view to {}", path.display());
    }

    if let Some(path) = &args.report {
        let (workers, model) = controller.with_state(|sim| (sim.params().workers, sim.params().model))?;
        let report = RunReport {
            width: depths.width,
            height: depths.height,
            workers,
            model,
            final_tick: tick,
            total_depth: depths.sum(),
            generations: &reports,
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &report)?;
        println!("Wrote report to {}", path.display());
    }

    controller.end()?;
    Ok(())
}
