//! Parallel execution of one generation.
//!
//! The permutation is cut into `workers` contiguous index ranges (shards) and
//! each shard walks its range in increasing order on its own pool thread.
//! Shards are slices of the visit order, not spatial regions, so two shards
//! routinely touch neighbouring or identical cells. The configured
//! [`ConcurrencyModel`] decides how that sharing is made safe.
//!
//! `run_generation` returns only after every shard has finished: the parallel
//! collect is the barrier. A shard that errors or panics is recorded in the
//! stats and the remaining shards still complete.

use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;

use crate::error::{FlowError, Result};
use crate::flow::params::{ConcurrencyModel, FlowParams};
use crate::flow::step::{check_dimensions, flow_step, plan_transfer, Transfer};
use crate::terrain::HeightField;
use crate::water::WaterField;

/// A shard that did not complete its range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    pub shard: usize,
    pub reason: String,
}

impl ShardFailure {
    fn new(shard: usize, err: &FlowError) -> Self {
        let reason = match err {
            FlowError::WorkerFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Self { shard, reason }
    }

    pub fn to_error(&self) -> FlowError {
        FlowError::WorkerFailed { shard: self.shard, reason: self.reason.clone() }
    }
}

/// Statistics from one generation
#[derive(Clone, Debug, Default, Serialize)]
pub struct GenerationStats {
    /// Units moved between interior cells and their neighbours
    pub transfers: u64,
    /// Units removed at the grid border
    pub drained: u64,
    /// Total depth after the barrier
    pub total_depth: u64,
    /// Shards that failed; their work is reported here instead of aborting
    pub failures: Vec<ShardFailure>,
    /// Wall time from shard launch to the end of the merge
    pub elapsed: Duration,
}

impl GenerationStats {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-shard accumulation for the snapshot model.
struct ShardDelta {
    delta: Vec<i32>,
    drains: Vec<usize>,
    transfers: u64,
}

/// Split `len` permutation slots into `shards` contiguous ranges of equal
/// size; the last range absorbs the remainder.
pub fn partition(len: usize, shards: usize) -> Vec<Range<usize>> {
    let shards = shards.max(1);
    let size = len / shards;
    (0..shards)
        .map(|s| {
            let start = s * size;
            let end = if s + 1 == shards { len } else { start + size };
            start..end
        })
        .collect()
}

/// Runs generations on a dedicated worker pool.
pub struct FlowEngine {
    pool: ThreadPool,
    workers: usize,
    model: ConcurrencyModel,
    depth_scale: f32,
}

impl FlowEngine {
    pub fn new(params: &FlowParams) -> Result<Self> {
        params.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(params.workers)
            .thread_name(|i| format!("flow-worker-{}", i))
            .build()
            .map_err(|e| FlowError::Config(format!("failed to start worker pool: {}", e)))?;
        Ok(Self {
            pool,
            workers: params.workers,
            model: params.model,
            depth_scale: params.depth_scale,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn model(&self) -> ConcurrencyModel {
        self.model
    }

    /// Apply the flow rule once to every cell, sharded across the pool.
    pub fn run_generation(&self, water: &mut WaterField, terrain: &HeightField) -> Result<GenerationStats> {
        check_dimensions(terrain, water)?;
        let ranges = partition(water.dim(), self.workers);
        Ok(self.run_shards(water, terrain, &ranges))
    }

    pub(crate) fn run_shards(
        &self,
        water: &mut WaterField,
        terrain: &HeightField,
        ranges: &[Range<usize>],
    ) -> GenerationStats {
        let start = Instant::now();
        let mut stats = match self.model {
            ConcurrencyModel::Snapshot => self.run_snapshot(water, terrain, ranges),
            ConcurrencyModel::Atomic => self.run_atomic(water, terrain, ranges),
        };
        stats.total_depth = water.total_depth();
        stats.elapsed = start.elapsed();

        for failure in &stats.failures {
            warn!("Shard {} failed: {}", failure.shard, failure.reason);
        }
        debug!(
            "Generation ({} model, {} shards): {} moved, {} drained, {} remaining in {:?}",
            self.model,
            ranges.len(),
            stats.transfers,
            stats.drained,
            stats.total_depth,
            stats.elapsed
        );
        stats
    }

    fn run_atomic(&self, water: &WaterField, terrain: &HeightField, ranges: &[Range<usize>]) -> GenerationStats {
        let scale = self.depth_scale;
        // Counted as transfers are applied, so a shard that fails part-way
        // still reports the work it already committed.
        let transfers = AtomicU64::new(0);
        let drained = AtomicU64::new(0);

        let results: Vec<Result<()>> = self.pool.install(|| {
            ranges
                .par_iter()
                .with_max_len(1)
                .enumerate()
                .map(|(shard, range)| {
                    guard_shard(shard, || {
                        for i in range.clone() {
                            let (x, y) = water.permuted_coordinate(i)?;
                            match flow_step(terrain, water, x, y, scale)? {
                                Transfer::None => {}
                                Transfer::Drain { units, .. } => {
                                    drained.fetch_add(units as u64, Ordering::Relaxed);
                                }
                                Transfer::Flow { .. } => {
                                    transfers.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Ok(())
                    })
                })
                .collect()
        });

        let mut stats = GenerationStats {
            transfers: transfers.load(Ordering::Relaxed),
            drained: drained.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (shard, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                stats.failures.push(ShardFailure::new(shard, &e));
            }
        }
        stats
    }

    fn run_snapshot(&self, water: &mut WaterField, terrain: &HeightField, ranges: &[Range<usize>]) -> GenerationStats {
        let scale = self.depth_scale;
        let frozen: Vec<u32> = water.cells().iter().map(|c| c.load(Ordering::Acquire)).collect();
        let n = frozen.len();

        let results: Vec<Result<ShardDelta>> = {
            let water: &WaterField = water;
            let frozen = &frozen;
            self.pool.install(|| {
                ranges
                    .par_iter()
                    .with_max_len(1)
                    .enumerate()
                    .map(|(shard, range)| {
                        guard_shard(shard, || {
                            let mut out = ShardDelta { delta: vec![0; n], drains: Vec::new(), transfers: 0 };
                            for i in range.clone() {
                                let (x, y) = water.permuted_coordinate(i)?;
                                match plan_transfer(terrain, |c| frozen[c], x, y, scale)? {
                                    Transfer::None => {}
                                    Transfer::Drain { cell, .. } => out.drains.push(cell),
                                    Transfer::Flow { from, to } => {
                                        out.delta[from] -= 1;
                                        out.delta[to] += 1;
                                        out.transfers += 1;
                                    }
                                }
                            }
                            Ok(out)
                        })
                    })
                    .collect()
            })
        };

        // Barrier crossed: merge the surviving shards.
        let mut stats = GenerationStats::default();
        let mut merged = vec![0i64; n];
        let mut drains = Vec::new();
        for (shard, result) in results.into_iter().enumerate() {
            match result {
                Ok(out) => {
                    for (acc, d) in merged.iter_mut().zip(&out.delta) {
                        *acc += *d as i64;
                    }
                    drains.extend(out.drains);
                    stats.transfers += out.transfers;
                }
                Err(e) => stats.failures.push(ShardFailure::new(shard, &e)),
            }
        }

        let cells = water.cells_mut();
        for ((cell, &before), &d) in cells.iter_mut().zip(&frozen).zip(&merged) {
            // A cell only ever loses units on its own visit, one at most.
            let after = before as i64 + d;
            debug_assert!(after >= 0);
            *cell.get_mut() = after.max(0) as u32;
        }
        // Drained border cells also lose whatever flowed into them this generation.
        for idx in drains {
            stats.drained += std::mem::take(cells[idx].get_mut()) as u64;
        }
        stats
    }
}

fn guard_shard<T>(shard: usize, work: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(payload) => Err(FlowError::WorkerFailed { shard, reason: panic_message(payload.as_ref()) }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::step::surface;
    use crate::tilemap::Tilemap;
    use proptest::prelude::*;

    fn engine(workers: usize, model: ConcurrencyModel) -> FlowEngine {
        FlowEngine::new(&FlowParams { workers, model, ..Default::default() }).unwrap()
    }

    /// Gently tilted terrain with a dip near the middle.
    fn valley(width: usize, height: usize) -> HeightField {
        HeightField::from_fn(width, height, |x, y| {
            let dx = x as f32 - width as f32 * 0.4;
            let dy = y as f32 - height as f32 * 0.6;
            0.02 * (dx * dx + dy * dy).sqrt() + 0.005 * x as f32
        })
        .unwrap()
    }

    fn flooded(width: usize, height: usize, seed: u64) -> WaterField {
        let mut water = WaterField::with_seed(width, height, seed);
        water.inject_source(width / 2, height / 2);
        water.inject_source(width / 3, height / 4);
        water.inject_source(width - 2, height - 2);
        water
    }

    fn full(width: usize, height: usize, depth: u32, permutation: Vec<usize>) -> WaterField {
        let mut water = WaterField::with_permutation(width, height, permutation).unwrap();
        for x in 0..width {
            for y in 0..height {
                water.set_depth(x, y, depth).unwrap();
            }
        }
        water
    }

    #[test]
    fn test_partition_last_shard_absorbs_remainder() {
        assert_eq!(partition(10, 4), vec![0..2, 2..4, 4..6, 6..10]);
        assert_eq!(partition(8, 4), vec![0..2, 2..4, 4..6, 6..8]);
        assert_eq!(partition(3, 5), vec![0..0, 0..0, 0..0, 0..0, 0..3]);
        assert_eq!(partition(7, 1), vec![0..7]);
        let total: usize = partition(1001, 6).iter().map(|r| r.len()).sum();
        assert_eq!(total, 1001);
    }

    #[test]
    fn test_stillwater_is_noop() {
        let terrain = valley(12, 9);
        for model in ConcurrencyModel::all() {
            let eng = engine(4, *model);
            let mut water = WaterField::with_seed(12, 9, 5);
            let stats = eng.run_generation(&mut water, &terrain).unwrap();
            assert_eq!(water.total_depth(), 0);
            assert_eq!(stats.transfers, 0);
            assert_eq!(stats.drained, 0);
            assert!(stats.is_clean());
        }
    }

    #[test]
    fn test_conservation_minus_drains() {
        let terrain = valley(20, 16);
        for model in ConcurrencyModel::all() {
            let eng = engine(4, *model);
            let mut water = flooded(20, 16, 11);
            for _ in 0..40 {
                let before = water.total_depth();
                let stats = eng.run_generation(&mut water, &terrain).unwrap();
                assert_eq!(water.total_depth(), before - stats.drained, "model {}", model);
                assert_eq!(stats.total_depth, water.total_depth());
            }
        }
    }

    #[test]
    fn test_snapshot_is_independent_of_workers_and_order() {
        let terrain = valley(17, 13);
        let mut reference = flooded(17, 13, 1);
        engine(1, ConcurrencyModel::Snapshot).run_generation(&mut reference, &terrain).unwrap();
        engine(1, ConcurrencyModel::Snapshot).run_generation(&mut reference, &terrain).unwrap();
        let expected = reference.snapshot();

        for (workers, seed) in [(2, 2), (3, 3), (4, 4), (7, 5), (64, 6)] {
            let eng = engine(workers, ConcurrencyModel::Snapshot);
            let mut water = flooded(17, 13, seed);
            eng.run_generation(&mut water, &terrain).unwrap();
            eng.run_generation(&mut water, &terrain).unwrap();
            assert_eq!(water.snapshot(), expected, "workers {}", workers);
        }
    }

    #[test]
    fn test_snapshot_edge_drain_empties_wet_border() {
        let terrain = valley(10, 10);
        let mut water = WaterField::with_seed(10, 10, 8);
        water.inject_source(1, 1);
        water.inject_source(8, 5);
        let before = water.snapshot();
        engine(4, ConcurrencyModel::Snapshot).run_generation(&mut water, &terrain).unwrap();
        for (x, y, &d) in before.iter() {
            if before.is_border(x, y) && d > 0 {
                assert_eq!(water.depth_at(x, y).unwrap(), 0, "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_flat_pool_scenario_snapshot() {
        let terrain = HeightField::flat(5, 5, 0.0).unwrap();
        let mut water = WaterField::with_seed(5, 5, 0);
        water.inject_source(2, 2);
        let stats = engine(4, ConcurrencyModel::Snapshot).run_generation(&mut water, &terrain).unwrap();
        for x in 0..5 {
            for y in 0..5 {
                let expected = if water.is_border(x, y) { 0 } else { 3 };
                assert_eq!(water.depth_at(x, y).unwrap(), expected);
            }
        }
        assert_eq!(stats.transfers, 0);
        assert_eq!(stats.drained, 16 * 3);
    }

    fn border_first_order(width: usize, height: usize) -> Vec<usize> {
        let probe: Tilemap<u8> = Tilemap::new(width, height);
        let (mut border, mut interior): (Vec<usize>, Vec<usize>) =
            (0..width * height).partition(|&i| {
                let (x, y) = probe.coord(i);
                probe.is_border(x, y)
            });
        border.append(&mut interior);
        border
    }

    #[test]
    fn test_atomic_interior_first_matches_snapshot() {
        let terrain = HeightField::flat(5, 5, 0.0).unwrap();
        let mut order = border_first_order(5, 5);
        order.rotate_left(16);
        let mut water = full(5, 5, 3, order);
        engine(1, ConcurrencyModel::Atomic).run_generation(&mut water, &terrain).unwrap();
        assert_eq!(water.depth_at(1, 1).unwrap(), 3);
        assert_eq!(water.depth_at(2, 2).unwrap(), 3);
        assert_eq!(water.depth_at(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_atomic_sees_same_generation_drains() {
        // Border cells drained early lower the surface seen by interior cells
        // visited later in the same generation; the snapshot model never does this.
        let terrain = HeightField::flat(5, 5, 0.0).unwrap();
        let mut atomic = full(5, 5, 3, border_first_order(5, 5));
        let stats = engine(1, ConcurrencyModel::Atomic).run_generation(&mut atomic, &terrain).unwrap();
        assert_eq!(atomic.depth_at(1, 1).unwrap(), 2);
        assert_eq!(atomic.depth_at(0, 0).unwrap(), 1);
        assert_eq!(atomic.total_depth(), 75 - stats.drained);

        let mut snapshot = full(5, 5, 3, border_first_order(5, 5));
        engine(1, ConcurrencyModel::Snapshot).run_generation(&mut snapshot, &terrain).unwrap();
        assert_eq!(snapshot.depth_at(1, 1).unwrap(), 3);
        assert_eq!(snapshot.depth_at(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_failed_shard_is_isolated() {
        let terrain = valley(6, 6);
        for model in ConcurrencyModel::all() {
            let eng = engine(2, *model);
            let mut water = flooded(6, 6, 3);
            let before = water.total_depth();
            // second range runs past the end of the permutation
            let stats = eng.run_shards(&mut water, &terrain, &[0..18, 18..40]);
            assert_eq!(stats.failures.len(), 1, "model {}", model);
            assert_eq!(stats.failures[0].shard, 1);
            assert!(matches!(stats.failures[0].to_error(), FlowError::WorkerFailed { shard: 1, .. }));
            assert_eq!(water.total_depth(), before - stats.drained);
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let terrain = valley(6, 6);
        let mut water = WaterField::with_seed(6, 5, 0);
        let err = engine(2, ConcurrencyModel::Snapshot).run_generation(&mut water, &terrain).unwrap_err();
        assert!(matches!(err, FlowError::MalformedInput { .. }));
    }

    #[test]
    fn test_panic_message_extraction() {
        let err = guard_shard::<()>(3, || panic!("boom")).unwrap_err();
        match err {
            FlowError::WorkerFailed { shard, reason } => {
                assert_eq!(shard, 3);
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn grid_strategy() -> impl Strategy<Value = (usize, usize, Vec<f32>, Vec<u32>)> {
        (3usize..9, 3usize..9).prop_flat_map(|(w, h)| {
            (
                Just(w),
                Just(h),
                prop::collection::vec(0.0f32..0.2, w * h),
                prop::collection::vec(0u32..8, w * h),
            )
        })
    }

    fn build(w: usize, h: usize, heights: &[f32], depths: &[u32], seed: u64) -> (HeightField, WaterField) {
        let terrain = HeightField::from_tilemap(Tilemap::from_vec(w, h, heights.to_vec()).unwrap()).unwrap();
        let mut water = WaterField::with_seed(w, h, seed);
        for (i, &d) in depths.iter().enumerate() {
            water.set_depth(i / h, i % h, d).unwrap();
        }
        (terrain, water)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_total_only_drops_by_drained(
            (w, h, heights, depths) in grid_strategy(),
            workers in 1usize..6,
            atomic in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let model = if atomic { ConcurrencyModel::Atomic } else { ConcurrencyModel::Snapshot };
            let (terrain, mut water) = build(w, h, &heights, &depths, seed);
            let eng = engine(workers, model);
            for _ in 0..3 {
                let before = water.total_depth();
                let stats = eng.run_generation(&mut water, &terrain).unwrap();
                prop_assert!(stats.is_clean());
                prop_assert_eq!(water.total_depth() + stats.drained, before);
            }
        }

        #[test]
        fn prop_snapshot_moves_only_downhill(
            (w, h, heights, depths) in grid_strategy(),
            workers in 1usize..6,
            seed in any::<u64>(),
        ) {
            let (terrain, mut water) = build(w, h, &heights, &depths, seed);
            let before = water.snapshot();
            engine(workers, ConcurrencyModel::Snapshot).run_generation(&mut water, &terrain).unwrap();
            let after = water.snapshot();

            // Recompute each interior cell's planned outflow from the frozen state.
            let mut expected: Vec<i64> = before.as_slice().iter().map(|&d| d as i64).collect();
            for (x, y, &d) in before.iter() {
                if d == 0 || before.is_border(x, y) {
                    continue;
                }
                let here = surface(d, *terrain.tilemap().get(x, y), 0.01);
                let neighbors = before.interior_neighbors(x, y).unwrap();
                let lowest = neighbors
                    .iter()
                    .map(|&(nx, ny)| surface(*before.get(nx, ny), *terrain.tilemap().get(nx, ny), 0.01))
                    .fold(f32::INFINITY, f32::min);
                if lowest < here {
                    expected[before.index(x, y)] -= 1;
                    let target = neighbors
                        .iter()
                        .find(|&&(nx, ny)| surface(*before.get(nx, ny), *terrain.tilemap().get(nx, ny), 0.01) == lowest)
                        .unwrap();
                    expected[before.index(target.0, target.1)] += 1;
                }
            }
            for (x, y, &d) in before.iter() {
                if before.is_border(x, y) && d > 0 {
                    expected[before.index(x, y)] = 0;
                }
            }
            let got: Vec<i64> = after.as_slice().iter().map(|&d| d as i64).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
