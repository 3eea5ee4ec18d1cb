//! Usage: Cross-cutting helpers (errors, lock recovery, masking, time).

pub mod error;
pub(crate) mod mutex_ext;
pub mod security;
pub mod time;

use std::future::Future;
use std::pin::Pin;

/// Boxed `Send` future returned by the object-safe async trait methods of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
