use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use memoizer_service::caching::MemoizingCache;
use memoizer_service::metric;
use parking_lot::Mutex;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{SyntheticFactory, Workload, WorkloadsConfig};

/// The outcome of running a single workload.
pub struct WorkloadReport {
    pub concurrency: usize,
    pub durations: DDSketch,
    pub errors: usize,
    pub entries: usize,
    pub factory_calls: usize,
}

pub async fn perform_stresstest(
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<Vec<WorkloadReport>> {
    let runtime = tokio::runtime::Handle::current();

    // every workload gets a cache of its own
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let factory = SyntheticFactory::new(&workload);
            let cache = MemoizingCache::new(format!("workload-{i}"), factory)
                .with_runtime(runtime.clone());
            (Arc::new(workload), cache)
        })
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, cache) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if !run_lookup(&cache, &workload).await {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }
                            task_durations.lock().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = std::mem::take(&mut *task_durations.lock());
            metric!(gauge("stress.cache.entries") = cache.len() as u64, "cache" => cache.name());

            WorkloadReport {
                concurrency,
                durations,
                errors: errors.load(Ordering::Relaxed),
                entries: cache.len(),
                factory_calls: cache.factory().calls(),
            }
        });
        tasks.push(task);
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in futures::future::join_all(tasks).await {
        reports.push(task?);
    }
    Ok(reports)
}

/// Performs one lookup as configured by `workload`, returning whether it succeeded.
async fn run_lookup(cache: &MemoizingCache<SyntheticFactory>, workload: &Workload) -> bool {
    let keys = workload.draw_keys();

    if keys.len() == 1 {
        let key = keys[0];
        let result = if workload.detached {
            cache.detached().get_or_add(key).await
        } else {
            cache.get_or_add(key).await
        };
        return result.is_ok();
    }

    let batch = if workload.detached {
        cache.detached().get_or_add_all(keys)
    } else {
        cache.get_or_add_all(keys)
    };
    match batch {
        Ok(batch) => batch.await.is_ok(),
        Err(error) => {
            tracing::error!(%error, "batch lookup rejected");
            false
        }
    }
}

/// Prints a summary of a finished workload.
pub fn print_report(i: usize, report: &WorkloadReport, duration: Duration) {
    let WorkloadReport {
        concurrency,
        durations,
        errors,
        entries,
        factory_calls,
    } = report;

    let ops = durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64();
    println!(
        "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
    );
    println!("  {entries} cache entries, {factory_calls} factory calls");

    let quantile = |q| {
        durations
            .quantile(q)
            .ok()
            .flatten()
            .map(Duration::from_secs_f64)
            .unwrap_or_default()
    };
    let avg = match durations.sum() {
        Some(sum) if ops > 0 => Duration::from_secs_f64(sum / ops as f64),
        _ => Duration::ZERO,
    };
    let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}
