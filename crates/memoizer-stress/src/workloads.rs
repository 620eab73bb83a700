use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use futures::future::{BoxFuture, FutureExt};
use memoizer_service::caching::Factory;
use memoizer_service::metric;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A synthetic load pattern against a single cache.
#[derive(Clone, Debug, Deserialize)]
pub struct Workload {
    /// The number of lookups in flight at any time.
    pub concurrency: usize,
    /// The number of distinct keys, drawn uniformly.
    pub keys: usize,
    /// How long every factory invocation takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// The probability of a factory invocation failing.
    #[serde(default)]
    pub failure_rate: f64,
    /// The number of keys per lookup. Values above `1` use batch lookups.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Whether lookups go through the detached view of the cache.
    #[serde(default)]
    pub detached: bool,
}

fn default_batch_size() -> usize {
    1
}

impl WorkloadsConfig {
    pub fn get(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        Self::from_reader(file)
    }

    fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        ensure!(!config.workloads.is_empty(), "no workloads defined");
        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

impl Workload {
    fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be positive");
        ensure!(self.keys > 0, "keys must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "failure_rate must be between 0 and 1"
        );
        Ok(())
    }

    /// Draws the keys for a single lookup.
    pub fn draw_keys(&self) -> Vec<usize> {
        (0..self.batch_size)
            .map(|_| rand::random_range(0..self.keys))
            .collect()
    }
}

/// The error produced by a [`SyntheticFactory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("synthetic failure computing key {0}")]
pub struct SyntheticFailure(pub usize);

/// A factory that sleeps for a while and then fails at random.
#[derive(Debug)]
pub struct SyntheticFactory {
    latency: Duration,
    failure_rate: f64,
    calls: AtomicUsize,
}

impl SyntheticFactory {
    pub fn new(workload: &Workload) -> Self {
        Self {
            latency: workload.latency,
            failure_rate: workload.failure_rate,
            calls: AtomicUsize::new(0),
        }
    }

    /// The number of times a value has been created.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Factory for SyntheticFactory {
    type Key = usize;
    type Value = usize;
    type Error = SyntheticFailure;

    fn create<'a>(&'a self, key: usize) -> BoxFuture<'a, Result<usize, SyntheticFailure>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        metric!(counter("stress.factory.calls") += 1);
        let fails = rand::random_bool(self.failure_rate);

        async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if fails {
                return Err(SyntheticFailure(key));
            }
            Ok(key)
        }
        .boxed()
    }
}
