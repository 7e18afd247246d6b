use thiserror::Error;

/// Structural problems with an uploaded file. These abort the operation and
/// never yield a partial result.
#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("missing required column '{0}'")]
    MissingColumn(String),
    #[error("no {0} columns found in the file")]
    NoValueColumns(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
}
