use std::fmt;

use futures::future::{self, FutureExt};

use super::{BatchLookup, CacheError, Factory, Lookup, MemoizingCache};

/// A view of a [`MemoizingCache`] whose computations run on background tasks.
///
/// Lookups through this view behave exactly like lookups through the cache itself: they share
/// computations, results, and errors with all other lookups. The difference is where the work
/// happens. A computation touched through this view is immediately spawned onto the cache's
/// runtime, so it makes progress on a runtime worker even if the caller never polls its lookup.
///
/// Each computation is spawned at most once, no matter how many detached lookups share it.
pub struct Detached<'a, F: Factory> {
    cache: &'a MemoizingCache<F>,
}

impl<F: Factory> fmt::Debug for Detached<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Detached").field(self.cache).finish()
    }
}

impl<'a, F: Factory> Detached<'a, F> {
    pub(super) fn new(cache: &'a MemoizingCache<F>) -> Self {
        Self { cache }
    }

    /// Gets the value for `key`, computing it on a background task if necessary.
    ///
    /// See [`MemoizingCache::get_or_add`].
    pub fn get_or_add(&self, key: F::Key) -> Lookup<F::Value, F::Error> {
        let slot = self.cache.lookup(key);
        self.cache.drive(&slot);
        slot.into_lookup()
    }

    /// Gets the values for all `keys`, computing them on background tasks as necessary.
    ///
    /// See [`MemoizingCache::get_or_add_all`].
    pub fn get_or_add_all<I>(&self, keys: I) -> Result<BatchLookup<F::Value, F::Error>, CacheError>
    where
        I: IntoIterator<Item = F::Key>,
    {
        let slots = self.cache.lookup_all(keys)?;
        let lookups: Vec<Lookup<_, _>> = slots
            .into_iter()
            .map(|slot| {
                self.cache.drive(&slot);
                slot.into_lookup()
            })
            .collect();

        Ok(future::try_join_all(lookups).boxed())
    }
}
