use std::fmt;
use std::future::Future;
use std::hash::Hash;

use futures::future::{BoxFuture, FutureExt};

/// The computation driving a [`MemoizingCache`](super::MemoizingCache).
///
/// A factory provides the actual, possibly expensive, computation whose results are being
/// memoized. It is invoked at most once per key and generation, and only when the corresponding
/// lookup is first polled.
pub trait Factory: Send + Sync + 'static {
    /// The key identifying a computation.
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    /// The value produced by a successful computation.
    ///
    /// Values are handed out to every waiter, so they need to be cheap to clone. Wrap them in an
    /// [`Arc`](std::sync::Arc) otherwise.
    type Value: Clone + Send + Sync + 'static;
    /// The error produced by a failed computation.
    ///
    /// Every waiter of a failed generation receives a clone of the same error.
    type Error: Clone + Send + Sync + 'static;

    /// Creates the value for `key`.
    ///
    /// This can be called concurrently for different keys. For the same key, it is called again
    /// after a previous invocation failed.
    fn create<'a>(&'a self, key: Self::Key) -> BoxFuture<'a, Result<Self::Value, Self::Error>>;
}

/// A [`Factory`] backed by a closure returning a future.
///
/// See [`MemoizingCache::from_fn`](super::MemoizingCache::from_fn).
pub struct FnFactory<K, F> {
    create: F,
    _key: std::marker::PhantomData<fn(K)>,
}

impl<K, F> FnFactory<K, F> {
    /// Wraps the given closure.
    pub fn new(create: F) -> Self {
        Self {
            create,
            _key: std::marker::PhantomData,
        }
    }
}

impl<K, F> fmt::Debug for FnFactory<K, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFactory").finish_non_exhaustive()
    }
}

impl<K, V, E, F, Fut> Factory for FnFactory<K, F>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    type Key = K;
    type Value = V;
    type Error = E;

    fn create<'a>(&'a self, key: K) -> BoxFuture<'a, Result<V, E>> {
        (self.create)(key).boxed()
    }
}
