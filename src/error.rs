use thiserror::Error;

/// Domain errors for the grading core. Handlers map these onto wire
/// error codes; everything recoverable (per-file, per-sheet) is handled
/// locally and never surfaces here.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The archive could not be opened or read at all.
    #[error("archive extraction failed: {0}")]
    ExtractionFailure(String),

    /// Illegal submission status change; the original state is preserved.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Score outside [0, max_points]; rejected, never clamped.
    #[error("score {score} out of range 0..={max}")]
    OutOfRangeScore { score: f64, max: f64 },

    /// The workbook could not be opened at all (partial per-sheet
    /// failures are reported inside the formula map instead).
    #[error("workbook parse error: {0}")]
    WorkbookParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wire error code for the IPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ExtractionFailure(_) => "extraction_failed",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::OutOfRangeScore { .. } => "out_of_range_score",
            CoreError::WorkbookParse(_) => "workbook_open_failed",
            CoreError::Io(_) => "io_error",
        }
    }
}
