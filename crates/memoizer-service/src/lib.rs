//! Asynchronous memoization for expensive keyed computations.
//!
//! The central type is [`MemoizingCache`](caching::MemoizingCache), which deduplicates
//! concurrent creation requests per key, shares the result between all waiters and retries
//! failed computations on the next access.
//!
//! The [`statements`] module wires the cache up to a database session to memoize prepared
//! statements.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod statements;
