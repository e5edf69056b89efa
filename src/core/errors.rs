//! Error type shared across the crate.

use std::io;
use thiserror::Error;

/// Everything that can go wrong while loading, fitting or writing.
#[derive(Error, Debug)]
pub enum ScFeatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Delimited file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Plot error: {0}")]
    Plot(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Input is not a count matrix: {0}")]
    NotCounts(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Matrix decomposition failed: {0}")]
    Decomposition(String),

    #[error("Parse error in {file} at line {line}: {msg}")]
    Parse {
        file: String,
        line: usize,
        msg: String,
    },
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ScFeatError>;

/// Returns `true` if the error originated from a broken pipe.
#[inline]
pub fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .map(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
        .or_else(|| {
            err.root_cause()
                .downcast_ref::<ScFeatError>()
                .map(|e| matches!(e, ScFeatError::Io(io_err) if io_err.kind() == io::ErrorKind::BrokenPipe))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_pipe_detection() {
        let err = anyhow::Error::from(ScFeatError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe",
        )));
        assert!(is_broken_pipe(&err));

        let err = anyhow::Error::from(ScFeatError::InsufficientData("none".into()));
        assert!(!is_broken_pipe(&err));
    }

    #[test]
    fn test_error_messages() {
        let err = ScFeatError::Parse {
            file: "counts.tsv".into(),
            line: 3,
            msg: "bad float".into(),
        };
        assert_eq!(
            err.to_string(),
            "Parse error in counts.tsv at line 3: bad float"
        );
    }
}
