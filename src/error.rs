use thiserror::Error;

/// Main library error type.
#[derive(Error, Debug)]
pub enum SegNmtError {
    /// Invalid model or criterion configuration, fatal at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Shape or precondition violation at a call site.
    #[error("shape error: {0}")]
    Shape(String),

    /// Errors returned by the Torch bindings.
    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, SegNmtError>;
