//! The per-cell transfer rule.
//!
//! A visited cell holding water either drains (border cells lose everything)
//! or passes one unit to the neighbour with the strictly lowest water surface,
//! provided that surface is strictly below its own. Neighbours are scanned in
//! the order NW, N, NE, W, E, SW, S, SE and the first minimum wins ties. The
//! NW neighbour takes part in the scan like every other neighbour.

use std::sync::atomic::Ordering;

use crate::error::{FlowError, Result};
use crate::terrain::HeightField;
use crate::tilemap::NEIGHBOR_OFFSETS;
use crate::water::WaterField;

/// What the rule decided for one cell. Indices are linear (column-major).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// Dry cell, or no neighbour strictly lower.
    None,
    /// Border cell emptied.
    Drain { cell: usize, units: u32 },
    /// One unit moved downhill.
    Flow { from: usize, to: usize },
}

/// Water-top elevation of a cell.
#[inline]
pub fn surface(depth: u32, height: f32, depth_scale: f32) -> f32 {
    depth as f32 * depth_scale + height
}

/// Decide the transfer for `(x, y)` reading depths through `depth_of`.
///
/// `depth_of` is indexed by linear cell index; the caller chooses whether it
/// reads live or frozen depths.
pub fn plan_transfer<F>(
    terrain: &HeightField,
    depth_of: F,
    x: usize,
    y: usize,
    depth_scale: f32,
) -> Result<Transfer>
where
    F: Fn(usize) -> u32,
{
    let width = terrain.width();
    let height = terrain.height();
    if x >= width || y >= height {
        return Err(FlowError::out_of_bounds(x as i64, y as i64, width, height));
    }

    let cell = x * height + y;
    let depth = depth_of(cell);
    if depth == 0 {
        return Ok(Transfer::None);
    }

    if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
        return Ok(Transfer::Drain { cell, units: depth });
    }

    let current = surface(depth, terrain.height_of(cell), depth_scale);

    let mut lowest_idx = usize::MAX;
    let mut lowest = f32::INFINITY;
    for (dx, dy) in NEIGHBOR_OFFSETS {
        let n = (x as i64 + dx) as usize * height + (y as i64 + dy) as usize;
        let s = surface(depth_of(n), terrain.height_of(n), depth_scale);
        if lowest_idx == usize::MAX || s < lowest {
            lowest = s;
            lowest_idx = n;
        }
    }

    if lowest < current {
        Ok(Transfer::Flow { from: cell, to: lowest_idx })
    } else {
        Ok(Transfer::None)
    }
}

/// Fail unless the water grid has the terrain's dimensions.
pub(crate) fn check_dimensions(terrain: &HeightField, water: &WaterField) -> Result<()> {
    if water.width() != terrain.width() || water.height() != terrain.height() {
        return Err(FlowError::malformed(format!(
            "water grid {}x{} does not match terrain {}x{}",
            water.width(),
            water.height(),
            terrain.width(),
            terrain.height()
        )));
    }
    Ok(())
}

/// Apply the rule to `(x, y)` in place, so later visits in the same
/// generation see the result immediately. Returns what was actually applied.
pub fn flow_step(
    terrain: &HeightField,
    water: &WaterField,
    x: usize,
    y: usize,
    depth_scale: f32,
) -> Result<Transfer> {
    check_dimensions(terrain, water)?;
    let cells = water.cells();
    let planned = plan_transfer(terrain, |i| cells[i].load(Ordering::Acquire), x, y, depth_scale)?;
    match planned {
        Transfer::None => Ok(Transfer::None),
        Transfer::Drain { cell, .. } => {
            let units = cells[cell].swap(0, Ordering::AcqRel);
            Ok(Transfer::Drain { cell, units })
        }
        Transfer::Flow { from, to } => {
            let taken = cells[from]
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
                .is_ok();
            if taken {
                cells[to].fetch_add(1, Ordering::AcqRel);
                Ok(Transfer::Flow { from, to })
            } else {
                Ok(Transfer::None)
            }
        }
    }
}
