pub mod common;
pub mod ledger;
pub mod scheduler;
pub mod supervisor;

pub type Error = crate::common::error::BherdError;
pub type Result<T> = std::result::Result<T, Error>;

pub const BHERD_VERSION: &str = env!("CARGO_PKG_VERSION");
