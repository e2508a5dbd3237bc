use thiserror::Error;

#[derive(Debug, Error)]
pub enum TnnError {
    #[error("Shape error: expected {expected}, got shape {shape:?}")]
    Shape {
        expected: &'static str,
        shape: Vec<usize>,
    },

    #[error("Allocation failed: cannot hold {elements} elements")]
    Allocation { elements: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(String),
}

impl From<bincode::error::EncodeError> for TnnError {
    fn from(err: bincode::error::EncodeError) -> Self {
        match err {
            bincode::error::EncodeError::Io { inner, .. } => TnnError::Io(inner),
            other => TnnError::Encode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TnnError>;
