//! Usage: Shared credential state and refresh coordination.
//!
//! - `store`: the single current grant and its generation.
//! - `registry`: in-flight authenticated requests, rebound on every grant replace.
//! - `refresh`: single-flight refresh and the per-request retry policy.

pub mod refresh;
pub mod registry;
pub mod store;
