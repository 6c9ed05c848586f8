use crate::error::{FlowError, Result};

/// Neighbour offsets in the fixed enumeration order used by the flow rule:
/// NW, N, NE, W, E, SW, S, SE.
pub const NEIGHBOR_OFFSETS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// A bounded 2D grid stored column-major (x outer, y inner).
///
/// The linear index of `(x, y)` is `x * height + y`, which is the order values
/// appear in a height file and the order permutation slots decode to.
#[derive(Clone, Debug, PartialEq)]
pub struct Tilemap<T> {
    pub width: usize,
    pub height: usize,
    data: Vec<T>,
}

impl<T: Clone + Default> Tilemap<T> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![T::default(); width * height],
        }
    }
}

impl<T: Clone> Tilemap<T> {
    pub fn new_with(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }
}

impl<T> Tilemap<T> {
    /// Wrap an existing column-major buffer.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != width * height {
            return Err(FlowError::malformed(format!(
                "expected {} values for a {}x{} grid, got {}",
                width * height,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Build a map by evaluating `f` at every coordinate.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for x in 0..width {
            for y in 0..height {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Linear (column-major) index of an in-bounds coordinate.
    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        x * self.height + y
    }

    /// Inverse of [`Tilemap::index`].
    #[inline]
    pub fn coord(&self, idx: usize) -> (usize, usize) {
        (idx / self.height, idx % self.height)
    }

    /// True for cells in the outermost ring of the grid.
    pub fn is_border(&self, x: usize, y: usize) -> bool {
        x == 0 || y == 0 || x + 1 == self.width || y + 1 == self.height
    }

    pub fn check_bounds(&self, x: usize, y: usize) -> Result<()> {
        if x < self.width && y < self.height {
            Ok(())
        } else {
            Err(FlowError::out_of_bounds(x as i64, y as i64, self.width, self.height))
        }
    }

    pub fn get(&self, x: usize, y: usize) -> &T {
        &self.data[self.index(x, y)]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    /// Bounds-checked access.
    pub fn try_get(&self, x: usize, y: usize) -> Result<&T> {
        self.check_bounds(x, y)?;
        Ok(self.get(x, y))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The eight neighbours of an interior cell in [`NEIGHBOR_OFFSETS`] order.
    /// Returns `None` for border cells, which do not have a full neighbourhood.
    pub fn interior_neighbors(&self, x: usize, y: usize) -> Option<[(usize, usize); 8]> {
        if x >= self.width || y >= self.height || self.is_border(x, y) {
            return None;
        }
        let mut out = [(0, 0); 8];
        for (slot, (dx, dy)) in out.iter_mut().zip(NEIGHBOR_OFFSETS) {
            *slot = ((x as i64 + dx) as usize, (y as i64 + dy) as usize);
        }
        Some(out)
    }

    /// Iterate over all cells with their coordinates, in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        let height = self.height;
        self.data
            .iter()
            .enumerate()
            .map(move |(idx, val)| (idx / height, idx % height, val))
    }
}

impl Tilemap<f32> {
    /// Minimum and maximum values in the map.
    pub fn min_max(&self) -> (f32, f32) {
        let mut min_h = f32::MAX;
        let mut max_h = f32::MIN;
        for &h in &self.data {
            if h < min_h { min_h = h; }
            if h > max_h { max_h = h; }
        }
        (min_h, max_h)
    }
}

impl Tilemap<u32> {
    pub fn sum(&self) -> u64 {
        self.data.iter().map(|&d| d as u64).sum()
    }
}
