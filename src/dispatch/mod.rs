//! Usage: Request execution (executor, retry contract, credential-aware dispatcher).

pub mod executor;
pub mod request;
pub mod retry;
pub mod service;
