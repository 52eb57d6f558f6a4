use std::path::PathBuf;

use thiserror::Error;

/// Batch-level failures. Any of these aborts the run before or between
/// phases; per-row issues are represented as `Outcome` values instead and
/// never surface here.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("input file not found: {0}")]
    NotFound(PathBuf),

    #[error("input file is empty: {0}")]
    EmptyFile(PathBuf),

    #[error("input file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("spreadsheet is not a valid archive container: {0}")]
    MalformedSpreadsheet(PathBuf),

    #[error("text input is neither UTF-8 nor Latin-1: {0}")]
    MalformedText(PathBuf),

    #[error("unsupported input format: {0:?}")]
    UnsupportedFormat(String),

    #[error("path contains parent directory references: {0}")]
    UnsafePath(PathBuf),

    #[error("required columns missing: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("signature required but none was provided")]
    SignatureMissing,

    #[error("signature required but no signature secret is configured")]
    SecretMissing,

    #[error("signature is not valid hex: {0}")]
    SignatureFormat(String),

    #[error("signature does not match the input file")]
    SignatureMismatch,

    #[error("failed to read spreadsheet: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("failed to parse table: {0}")]
    Table(#[from] csv::Error),

    #[error("failed to build worker pool: {0}")]
    Pool(String),

    #[error("failed to walk output tree: {0}")]
    Walk(String),

    #[error("failed to archive output: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
