//! Water depth grid and its randomized traversal order.

use std::sync::atomic::{AtomicU32, Ordering};

use log::trace;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{FlowError, Result};
use crate::tilemap::Tilemap;

/// Half-width of the square a source injection covers (7x7 window).
pub const SOURCE_RADIUS: usize = 3;
/// Depth units added to every covered cell by a source injection.
pub const SOURCE_AMOUNT: u32 = 3;

/// Integer water depths over the terrain grid, plus the fixed permutation of
/// linear indices that sets the order cells are visited in a generation.
///
/// Depths are stored as atomics so workers can share the field during a
/// generation; every mutation outside a generation goes through `&mut self`.
pub struct WaterField {
    width: usize,
    height: usize,
    depth: Vec<AtomicU32>,
    permutation: Vec<usize>,
    rng: ChaCha8Rng,
}

impl WaterField {
    /// A dry field with a permutation drawn from OS entropy.
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_rng(width, height, ChaCha8Rng::from_entropy())
    }

    /// A dry field whose permutations come from a seeded generator.
    pub fn with_seed(width: usize, height: usize, seed: u64) -> Self {
        Self::with_rng(width, height, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(width: usize, height: usize, rng: ChaCha8Rng) -> Self {
        let mut field = Self {
            width,
            height,
            depth: (0..width * height).map(|_| AtomicU32::new(0)).collect(),
            permutation: Vec::new(),
            rng,
        };
        field.shuffle_permutation();
        field
    }

    /// A dry field with an explicit traversal order. The order must visit
    /// every linear index exactly once.
    pub fn with_permutation(width: usize, height: usize, permutation: Vec<usize>) -> Result<Self> {
        let n = width * height;
        if permutation.len() != n {
            return Err(FlowError::malformed(format!(
                "permutation has {} entries, grid has {} cells",
                permutation.len(),
                n
            )));
        }
        let mut seen = vec![false; n];
        for &idx in &permutation {
            if idx >= n || seen[idx] {
                return Err(FlowError::malformed(format!(
                    "permutation entry {} is out of range or repeated",
                    idx
                )));
            }
            seen[idx] = true;
        }
        let mut field = Self::with_seed(width, height, 0);
        field.permutation = permutation;
        Ok(field)
    }

    fn shuffle_permutation(&mut self) {
        self.permutation = (0..self.width * self.height).collect();
        self.permutation.shuffle(&mut self.rng);
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Total number of cells.
    pub fn dim(&self) -> usize {
        self.depth.len()
    }

    /// Zero every depth and draw a fresh traversal order.
    pub fn reset(&mut self) {
        for cell in &mut self.depth {
            *cell.get_mut() = 0;
        }
        self.shuffle_permutation();
    }

    fn check_bounds(&self, x: usize, y: usize) -> Result<usize> {
        if x < self.width && y < self.height {
            Ok(x * self.height + y)
        } else {
            Err(FlowError::out_of_bounds(x as i64, y as i64, self.width, self.height))
        }
    }

    pub fn depth_at(&self, x: usize, y: usize) -> Result<u32> {
        let idx = self.check_bounds(x, y)?;
        Ok(self.depth[idx].load(Ordering::Acquire))
    }

    /// Overwrite a cell's depth. Depths are unsigned, so a negative value is
    /// unrepresentable rather than clamped.
    pub fn set_depth(&mut self, x: usize, y: usize, d: u32) -> Result<()> {
        let idx = self.check_bounds(x, y)?;
        *self.depth[idx].get_mut() = d;
        Ok(())
    }

    /// Add [`SOURCE_AMOUNT`] units to every in-bounds cell of the 7x7 square
    /// centred at `(cx, cy)`. Returns the number of units added.
    pub fn inject_source(&mut self, cx: usize, cy: usize) -> u64 {
        self.inject_source_with(cx as i64, cy as i64, SOURCE_RADIUS, SOURCE_AMOUNT)
    }

    /// Source injection with an explicit window radius and per-cell amount.
    /// The window is clipped to the grid.
    pub fn inject_source_with(&mut self, cx: i64, cy: i64, radius: usize, amount: u32) -> u64 {
        let mut added = 0u64;
        if self.width == 0 || self.height == 0 {
            return added;
        }
        let r = i64::try_from(radius).unwrap_or(i64::MAX);
        let x_lo = cx.saturating_sub(r).max(0);
        let x_hi = cx.saturating_add(r).min(self.width as i64 - 1);
        let y_lo = cy.saturating_sub(r).max(0);
        let y_hi = cy.saturating_add(r).min(self.height as i64 - 1);
        for x in x_lo..=x_hi {
            for y in y_lo..=y_hi {
                let idx = x as usize * self.height + y as usize;
                let cell = self.depth[idx].get_mut();
                let before = *cell;
                *cell = before.saturating_add(amount);
                added += (*cell - before) as u64;
            }
        }
        trace!("Injected {} units around ({}, {})", added, cx, cy);
        added
    }

    /// Coordinate stored in permutation slot `i`.
    pub fn permuted_coordinate(&self, i: usize) -> Result<(usize, usize)> {
        let linear = *self.permutation.get(i).ok_or_else(|| {
            FlowError::out_of_bounds(i as i64, 0, self.permutation.len(), 1)
        })?;
        Ok((linear / self.height, linear % self.height))
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    pub fn is_border(&self, x: usize, y: usize) -> bool {
        x == 0 || y == 0 || x + 1 == self.width || y + 1 == self.height
    }

    /// Sum of all depths.
    pub fn total_depth(&self) -> u64 {
        self.depth.iter().map(|d| d.load(Ordering::Acquire) as u64).sum()
    }

    /// Copy of the current depths as a plain grid.
    pub fn snapshot(&self) -> Tilemap<u32> {
        Tilemap::from_fn(self.width, self.height, |x, y| {
            self.depth[x * self.height + y].load(Ordering::Acquire)
        })
    }

    pub(crate) fn cells(&self) -> &[AtomicU32] {
        &self.depth
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [AtomicU32] {
        &mut self.depth
    }
}

impl std::fmt::Debug for WaterField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaterField")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("total_depth", &self.total_depth())
            .finish()
    }
}
