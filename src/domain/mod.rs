//! Usage: Domain value types.

pub mod grant;
