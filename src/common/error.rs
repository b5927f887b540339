use thiserror::Error;

use crate::common::error::BherdError::GenericError;

#[derive(Debug, Error)]
pub enum BherdError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Ledger of job list `{list}` is corrupted: {reason}")]
    CorruptLedger { list: String, reason: String },
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for BherdError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<String> for BherdError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

pub fn corrupt<T>(list: &str, reason: String) -> crate::Result<T> {
    Err(BherdError::CorruptLedger {
        list: list.to_string(),
        reason,
    })
}
