use thiserror::Error;

mod patch;
pub use patch::*;
mod store;
pub use store::*;

#[derive(Debug, Error)]
pub enum AnnotatorError {
    #[error("reducer error on `{action}`: {reason}")]
    Reducer { action: String, reason: String },
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("index {index} out of bounds at {path} (len {len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
    #[error("cannot descend into non-container value at {0}")]
    NotAContainer(String),
    #[error("patch has an empty path but no replacement value")]
    EmptyPath,
}

pub type Result<T> = std::result::Result<T, AnnotatorError>;
