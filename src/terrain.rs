//! Static terrain elevations loaded once at startup.
//!
//! Height files are whitespace-separated ASCII: the integer width, the integer
//! height, then `width * height` floats in column-major order (outer loop over
//! x, inner loop over y).

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use log::{info, warn};

use crate::error::{FlowError, Result};
use crate::tilemap::Tilemap;

/// Immutable grid of terrain elevations.
#[derive(Clone, Debug)]
pub struct HeightField {
    map: Tilemap<f32>,
}

impl HeightField {
    /// Load a height file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => FlowError::NotFound { path: path.to_path_buf() },
            _ => FlowError::Io(e),
        })?;
        let field = Self::from_reader(BufReader::new(file))?;
        info!(
            "Loaded terrain {}: {}x{} cells",
            path.display(),
            field.width(),
            field.height()
        );
        Ok(field)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    /// Parse the textual height format. Nothing is returned unless every
    /// expected token parses.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace();

        let width = parse_dimension(tokens.next(), "width")?;
        let height = parse_dimension(tokens.next(), "height")?;
        let expected = width
            .checked_mul(height)
            .ok_or_else(|| FlowError::malformed(format!("grid {}x{} is too large", width, height)))?;

        let mut values = Vec::with_capacity(expected);
        for i in 0..expected {
            let token = tokens.next().ok_or_else(|| {
                FlowError::malformed(format!("expected {} height values, found {}", expected, i))
            })?;
            let h: f32 = token.parse().map_err(|_| {
                FlowError::malformed(format!("height value {} ({:?}) is not a number", i, token))
            })?;
            if !h.is_finite() {
                return Err(FlowError::malformed(format!(
                    "height value {} ({:?}) is not finite",
                    i, token
                )));
            }
            values.push(h);
        }

        let trailing = tokens.count();
        if trailing > 0 {
            warn!("Ignoring {} trailing tokens after height data", trailing);
        }

        Ok(Self { map: Tilemap::from_vec(width, height, values)? })
    }

    /// Wrap an already-built elevation map.
    pub fn from_tilemap(map: Tilemap<f32>) -> Result<Self> {
        if map.width == 0 || map.height == 0 {
            return Err(FlowError::malformed("terrain dimensions must be positive"));
        }
        Ok(Self { map })
    }

    /// Build terrain by evaluating `f` at every cell.
    pub fn from_fn(width: usize, height: usize, f: impl FnMut(usize, usize) -> f32) -> Result<Self> {
        Self::from_tilemap(Tilemap::from_fn(width, height, f))
    }

    /// Uniform-height terrain.
    pub fn flat(width: usize, height: usize, elevation: f32) -> Result<Self> {
        Self::from_tilemap(Tilemap::new_with(width, height, elevation))
    }

    pub fn width(&self) -> usize {
        self.map.width
    }

    pub fn height(&self) -> usize {
        self.map.height
    }

    /// Total number of cells.
    pub fn dim(&self) -> usize {
        self.map.len()
    }

    pub fn height_at(&self, x: usize, y: usize) -> Result<f32> {
        self.map.try_get(x, y).copied()
    }

    /// Elevation by linear index. The caller guarantees the index is in range.
    #[inline]
    pub(crate) fn height_of(&self, idx: usize) -> f32 {
        self.map.as_slice()[idx]
    }

    pub fn tilemap(&self) -> &Tilemap<f32> {
        &self.map
    }

    /// Lowest and highest elevation.
    pub fn range(&self) -> (f32, f32) {
        self.map.min_max()
    }
}

fn parse_dimension(token: Option<&str>, name: &str) -> Result<usize> {
    let token = token.ok_or_else(|| FlowError::malformed(format!("missing grid {}", name)))?;
    let value: usize = token
        .parse()
        .map_err(|_| FlowError::malformed(format!("grid {} {:?} is not an integer", name, token)))?;
    if value == 0 {
        return Err(FlowError::malformed(format!("grid {} must be positive", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_column_major() {
        let field = HeightField::parse("2 3\n0.0 0.1 0.2\n1.0 1.1 1.2\n").unwrap();
        assert_eq!(field.width(), 2);
        assert_eq!(field.height(), 3);
        assert_eq!(field.dim(), 6);
        assert_eq!(field.height_at(0, 2).unwrap(), 0.2);
        assert_eq!(field.height_at(1, 0).unwrap(), 1.0);
        assert_eq!(field.range(), (0.0, 1.2));
    }

    #[test]
    fn test_out_of_bounds_height() {
        let field = HeightField::flat(3, 3, 1.0).unwrap();
        assert!(matches!(field.height_at(3, 0), Err(FlowError::OutOfBounds { .. })));
        assert!(matches!(field.height_at(0, 7), Err(FlowError::OutOfBounds { .. })));
    }

    #[test]
    fn test_malformed_tokens() {
        for text in [
            "",
            "abc 2 0 0 0 0",
            "2 2.5 0 0 0 0",
            "0 4",
            "2 2 0.0 1.0 oops 3.0",
            "2 2 0.0 1.0 2.0",
            "1 1 NaN",
        ] {
            let err = HeightField::parse(text).unwrap_err();
            assert!(
                matches!(err, FlowError::MalformedInput { .. }),
                "{:?} gave {:?}",
                text,
                err
            );
        }
    }

    #[test]
    fn test_trailing_tokens_ignored() {
        let field = HeightField::parse("1 2 5 6 7").unwrap();
        assert_eq!(field.height_at(0, 1).unwrap(), 6.0);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let path = std::env::temp_dir().join("waterflow-no-such-terrain.txt");
        let _ = fs::remove_file(&path);
        assert!(matches!(HeightField::load(&path), Err(FlowError::NotFound { .. })));
    }

    #[test]
    fn test_load_from_disk() {
        let path = std::env::temp_dir().join(format!("waterflow-terrain-{}.txt", std::process::id()));
        fs::write(&path, "3 2\n0.5 0.25\n1 2\n-3 4\n").unwrap();
        let field = HeightField::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(field.height_at(2, 0).unwrap(), -3.0);
        assert_eq!(field.height_at(0, 1).unwrap(), 0.25);
    }

    #[test]
    fn test_from_reader() {
        let field = HeightField::from_reader("1 1 9.5".as_bytes()).unwrap();
        assert_eq!(field.height_at(0, 0).unwrap(), 9.5);
    }
}
