//! Usage: Persistence (settings file, credential storage).

pub mod credential_storage;
pub mod settings;
