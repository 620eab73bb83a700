use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;

use super::{CacheError, Detached, Factory, FnFactory};

type Computation<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;
type SlotMap<F> = FxHashMap<<F as Factory>::Key, Slot<<F as Factory>::Value, <F as Factory>::Error>>;

/// The future returned by a batch lookup, resolving to the values in key order.
pub type BatchLookup<V, E> = BoxFuture<'static, Result<Vec<V>, E>>;

/// One generation of the computation for a single key.
#[derive(Clone)]
pub(super) struct Slot<V, E> {
    generation: u64,
    computation: Computation<V, E>,
    /// Set once a background task has been spawned to poll `computation`.
    driven: Arc<AtomicBool>,
}

impl<V, E> Slot<V, E> {
    pub(super) fn into_lookup(self) -> Lookup<V, E> {
        Lookup {
            computation: self.computation,
        }
    }
}

impl<V: Clone, E: Clone> Slot<V, E> {
    fn has_failed(&self) -> bool {
        matches!(self.computation.peek(), Some(Err(_)))
    }
}

/// An in-memory cache memoizing asynchronous computations.
///
/// The cache deduplicates concurrent requests for the same key: all of them share a single
/// invocation of the [`Factory`], and all of them receive its result. The factory is only invoked
/// once the returned [`Lookup`] is first polled, never while the cache itself is being updated.
///
/// Successful results are kept for the lifetime of the cache. Failed results are handed to every
/// waiter of that computation, and are replaced by a fresh computation on the next access to the
/// same key. There is no eviction, expiration, or capacity limit.
pub struct MemoizingCache<F: Factory> {
    name: Arc<str>,
    factory: Arc<F>,
    slots: Arc<RwLock<SlotMap<F>>>,
    generations: Arc<AtomicU64>,
    runtime: Option<Handle>,
}

impl<F: Factory> Clone for MemoizingCache<F> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            name: Arc::clone(&self.name),
            factory: Arc::clone(&self.factory),
            slots: Arc::clone(&self.slots),
            generations: Arc::clone(&self.generations),
            runtime: self.runtime.clone(),
        }
    }
}

impl<F: Factory> fmt::Debug for MemoizingCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizingCache")
            .field("name", &self.name)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl<K, C> MemoizingCache<FnFactory<K, C>>
where
    FnFactory<K, C>: Factory,
{
    /// Creates a cache whose computations are produced by the `create` closure.
    pub fn from_fn<Fut>(name: impl Into<Arc<str>>, create: C) -> Self
    where
        C: Fn(K) -> Fut,
    {
        Self::new(name, FnFactory::new(create))
    }
}

impl<F: Factory> MemoizingCache<F> {
    /// Creates a new, empty cache.
    ///
    /// The `name` is used to tag logs and metrics.
    pub fn new(name: impl Into<Arc<str>>, factory: F) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            slots: Default::default(),
            generations: Default::default(),
            runtime: None,
        }
    }

    /// Spawns background computations onto the given runtime.
    ///
    /// Without an explicit runtime, the runtime of the calling context is used.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The factory computing new values.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The number of keys with a pending, successful, or failed computation.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` if no key has ever been looked up.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Returns the outcome of the current computation for `key`, if it has completed.
    ///
    /// This never starts a computation.
    pub fn peek(&self, key: &F::Key) -> Option<Result<F::Value, F::Error>> {
        self.slots.read().get(key)?.computation.peek().cloned()
    }

    /// Gets the value for `key`, computing it if necessary.
    ///
    /// If there is no computation for `key` yet, or the previous one failed, a new computation is
    /// registered. It starts running once the returned [`Lookup`] (or any other lookup sharing
    /// it) is polled. Otherwise the returned lookup shares the existing computation.
    pub fn get_or_add(&self, key: F::Key) -> Lookup<F::Value, F::Error> {
        self.lookup(key).into_lookup()
    }

    /// Gets the values for all `keys`, computing them as necessary.
    ///
    /// Every key is looked up as with [`get_or_add`](Self::get_or_add). The returned future
    /// resolves to the values in the order of `keys`.
    ///
    /// The batch fails as soon as one of its computations fails, with that computation's error.
    /// Once the batch has been polled, the remaining computations are driven to completion in the
    /// background regardless, so their results end up in the cache.
    ///
    /// Returns [`CacheError::NoKeys`] without touching the cache if `keys` is empty.
    pub fn get_or_add_all<I>(&self, keys: I) -> Result<BatchLookup<F::Value, F::Error>, CacheError>
    where
        I: IntoIterator<Item = F::Key>,
    {
        let slots = self.lookup_all(keys)?;
        let runtime = self.runtime.clone();
        let name = Arc::clone(&self.name);

        Ok(async move {
            for slot in &slots {
                drive(runtime.as_ref(), &name, slot);
            }
            future::try_join_all(slots.into_iter().map(|slot| slot.computation)).await
        }
        .boxed())
    }

    /// A view of this cache that runs computations on background tasks.
    ///
    /// See [`Detached`] for details.
    pub fn detached(&self) -> Detached<'_, F> {
        Detached::new(self)
    }

    /// Looks up the slot for `key`, registering a new generation if needed.
    pub(super) fn lookup(&self, key: F::Key) -> Slot<F::Value, F::Error> {
        let name = &self.name;

        if let Some(slot) = self.slots.read().get(&key) {
            if !slot.has_failed() {
                metric!(counter(&format!("caches.{name}.lookup.hit")) += 1);
                return slot.clone();
            }
        }

        let mut slots = self.slots.write();
        match slots.entry(key) {
            Entry::Occupied(mut entry) => {
                // Another lookup may have replaced the failed slot while no lock was held.
                if !entry.get().has_failed() {
                    metric!(counter(&format!("caches.{name}.lookup.hit")) += 1);
                    return entry.get().clone();
                }

                let slot = self.new_slot(entry.key().clone());
                tracing::debug!(
                    cache = %name,
                    failed_generation = entry.get().generation,
                    generation = slot.generation,
                    "retrying failed computation",
                );
                metric!(counter(&format!("caches.{name}.lookup.retry")) += 1);
                entry.insert(slot.clone());
                slot
            }
            Entry::Vacant(entry) => {
                let slot = self.new_slot(entry.key().clone());
                tracing::trace!(cache = %name, generation = slot.generation, "new computation");
                metric!(counter(&format!("caches.{name}.lookup.miss")) += 1);
                entry.insert(slot).clone()
            }
        }
    }

    /// Looks up the slots for all `keys`, in order.
    pub(super) fn lookup_all<I>(&self, keys: I) -> Result<Vec<Slot<F::Value, F::Error>>, CacheError>
    where
        I: IntoIterator<Item = F::Key>,
    {
        let slots: Vec<_> = keys.into_iter().map(|key| self.lookup(key)).collect();
        if slots.is_empty() {
            return Err(CacheError::NoKeys);
        }
        Ok(slots)
    }

    /// Spawns a background task polling the computation of `slot`, unless one exists already.
    pub(super) fn drive(&self, slot: &Slot<F::Value, F::Error>) {
        drive(self.runtime.as_ref(), &self.name, slot);
    }

    /// Creates a new generation for `key`.
    ///
    /// The factory is not invoked here, but on the first poll of the returned computation.
    fn new_slot(&self, key: F::Key) -> Slot<F::Value, F::Error> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let factory = Arc::clone(&self.factory);
        let name = Arc::clone(&self.name);

        let computation = async move {
            let start = Instant::now();
            let result = factory.create(key).await;

            let status = if result.is_ok() { "ok" } else { "error" };
            metric!(
                timer(&format!("caches.{name}.computation.duration")) = start.elapsed(),
                "status" => status,
            );
            if result.is_err() {
                tracing::debug!(cache = %name, generation, "computation failed");
                metric!(counter(&format!("caches.{name}.computation.failed")) += 1);
            }

            result
        }
        .boxed()
        .shared();

        Slot {
            generation,
            computation,
            driven: Default::default(),
        }
    }
}

fn drive<V, E>(runtime: Option<&Handle>, name: &str, slot: &Slot<V, E>)
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    if slot.computation.peek().is_some() || slot.driven.swap(true, Ordering::AcqRel) {
        return;
    }

    let runtime = match runtime.cloned().or_else(|| Handle::try_current().ok()) {
        Some(runtime) => runtime,
        None => {
            slot.driven.store(false, Ordering::Release);
            tracing::warn!(
                cache = %name,
                generation = slot.generation,
                "no runtime to drive computation, it only progresses while awaited",
            );
            return;
        }
    };

    runtime.spawn(slot.computation.clone().map(|_| ()));
}

/// A lookup in a [`MemoizingCache`], resolving to the value or the factory's error.
///
/// Lookups for the same key and generation share a single computation. Dropping a lookup does not
/// cancel the computation; the next lookup for the same key resumes it.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Lookup<V, E> {
    computation: Computation<V, E>,
}

impl<V, E> Clone for Lookup<V, E> {
    fn clone(&self) -> Self {
        Self {
            computation: self.computation.clone(),
        }
    }
}

impl<V, E> fmt::Debug for Lookup<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup").finish_non_exhaustive()
    }
}

impl<V: Clone, E: Clone> Future for Lookup<V, E> {
    type Output = Result<V, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.computation.poll_unpin(cx)
    }
}
