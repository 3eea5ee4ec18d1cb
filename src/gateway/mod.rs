//! Usage: Outbound HTTP (transport seam, bearer requests, OAuth2 token endpoint).

pub mod bearer_request;
pub mod oauth;
pub mod transport;
