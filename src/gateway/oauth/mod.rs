//! Usage: OAuth2 token endpoint client and the credential-producing requests built on it.

pub mod access_requests;
pub mod client;
pub mod token_exchange;
