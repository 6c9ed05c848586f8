//! Error types shared by the terrain loader, the flow engine and the controller.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("height file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("coordinate ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: usize,
        height: usize,
    },

    #[error("cannot {action} while {from}")]
    InvalidStateTransition {
        from: &'static str,
        action: &'static str,
    },

    #[error("worker shard {shard} failed: {reason}")]
    WorkerFailed { shard: usize, reason: String },

    #[error("control loop failed: {0}")]
    ControlLoop(String),

    #[error("window error: {0}")]
    Window(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image export failed: {0}")]
    Image(#[from] image::ImageError),
}

impl FlowError {
    pub(crate) fn out_of_bounds(x: i64, y: i64, width: usize, height: usize) -> Self {
        FlowError::OutOfBounds { x, y, width, height }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        FlowError::MalformedInput { reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message_is_not_tied_to_height_files() {
        let err = FlowError::malformed("water grid 3x3 does not match terrain 5x5");
        assert_eq!(err.to_string(), "malformed input: water grid 3x3 does not match terrain 5x5");
    }
}
