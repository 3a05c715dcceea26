// Global error type for the shared data model.

#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("invalid block uid: {0}")]
    InvalidUid(String),

    #[error("invalid block range: [{start}, {end})")]
    InvalidRange { start: u32, end: u32 },

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, HiveError>;
