//! Memoization of asynchronous computations.
//!
//! A [`MemoizingCache`] maps keys to lazily started, shared computations produced by a
//! [`Factory`]:
//!
//! - The first lookup of a key registers a computation. The factory runs once that lookup (or
//!   any other lookup sharing it) is polled.
//! - Concurrent lookups of the same key share the computation and its result.
//! - Successful results stay in the cache forever.
//! - A failed computation is reported to all of its waiters, and replaced by a fresh one on the
//!   next lookup of that key.

mod cache_error;
mod detached;
mod factory;
mod memoizing;

pub use cache_error::*;
pub use detached::*;
pub use factory::*;
pub use memoizing::{BatchLookup, Lookup, MemoizingCache};
