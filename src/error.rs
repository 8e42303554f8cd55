use thiserror::Error;

pub type Result<T> = std::result::Result<T, DimRedError>;

/// Failures an embedding call can report back to the rendering layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DimRedError {
    /// Too few rows or columns for the chosen method. The engine refuses to run
    /// instead of producing NaN coordinates.
    #[error(
        "insufficient data for {method}: need at least {required_rows} rows and {required_cols} columns, got {rows}x{cols}"
    )]
    InsufficientData {
        method: &'static str,
        required_rows: usize,
        required_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("no rows are visible")]
    EmptySelection,

    #[error("embedding was cancelled")]
    Cancelled,
}

impl DimRedError {
    pub(crate) fn insufficient(
        method: &'static str,
        required_rows: usize,
        required_cols: usize,
        rows: usize,
        cols: usize,
    ) -> Self {
        DimRedError::InsufficientData {
            method,
            required_rows,
            required_cols,
            rows,
            cols,
        }
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, DimRedError::InsufficientData { .. })
    }
}
