//! Run-level errors.
//!
//! Individual request failures never show up here; they are recorded as failed
//! [`RequestResult`](crate::RequestResult)s instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to construct HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("load test cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, LoadTestError>;
