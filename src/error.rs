use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QConvError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, QConvError>;
