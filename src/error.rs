// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::domain::{OrderId, OrderStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: String, available: String },
    #[error("insufficient position: need {needed}, free {free}")]
    InsufficientPosition { needed: u64, free: i64 },
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error("order {id} is {status:?}")]
    InvalidState { id: OrderId, status: OrderStatus },
    #[error("execution of order {id} aborted: {reason}")]
    Execution { id: OrderId, reason: String },
    #[error("ledger store: {0}")]
    Store(String),
}

impl EngineError {
    /// Stable machine-readable kind, used in API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::InsufficientFunds { .. } => "InsufficientFundsError",
            EngineError::InsufficientPosition { .. } => "InsufficientPositionError",
            EngineError::NotFound(_) => "NotFoundError",
            EngineError::InvalidState { .. } => "InvalidStateError",
            EngineError::Execution { .. } => "ExecutionError",
            EngineError::Store(_) => "StoreError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::InsufficientFunds { .. } | EngineError::InsufficientPosition { .. } => 422,
            EngineError::NotFound(_) => 404,
            EngineError::InvalidState { .. } => 409,
            EngineError::Execution { .. } => 503,
            EngineError::Store(_) => 500,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self { EngineError::Store(e.to_string()) }
}

pub type EngineResult<T> = Result<T, EngineError>;
