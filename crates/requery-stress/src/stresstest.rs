use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use requery_service::config::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Outcome, WorkloadsConfig, prepare_workload, process_workload};

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    failures: usize,
    discarded: usize,
}

pub async fn perform_stresstest(
    service_config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads = workloads
        .workloads
        .iter()
        .map(|workload| {
            let prepared = prepare_workload(&service_config, workload)?;
            Ok((workload.concurrency, Arc::new(prepared)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_workload(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let fetches_before = workload.fetches.load(Ordering::Relaxed);
            let stats = Arc::new(Mutex::new(Stats::default()));
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
                        let workload = Arc::clone(&workload);
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = process_workload(&workload).await;

                            transaction.finish();

                            let mut stats = stats.lock().unwrap();
                            stats.durations.add(task_start.elapsed().as_secs_f64());
                            match outcome {
                                Outcome::Success => {}
                                Outcome::Failure => stats.failures += 1,
                                Outcome::Discarded => stats.discarded += 1,
                            }
                            drop(stats);

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let stats = std::mem::take(&mut *stats.lock().unwrap());
            let fetches = workload.fetches.load(Ordering::Relaxed) - fetches_before;
            (concurrency, stats, fetches)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, stats, fetches) = task.unwrap();
        let Stats {
            durations,
            failures,
            discarded,
        } = stats;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs() as f32;
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let fetch_ratio = fetches as f32 / ops as f32;
        println!(
            "  fetches: {fetches} ({fetch_ratio:.2} per operation); failed: {failures}; discarded: {discarded}"
        );

        let avg = Duration::from_secs_f64(durations.sum().unwrap() / ops as f64);
        let p50 = Duration::from_secs_f64(durations.quantile(0.5).unwrap().unwrap());
        let p90 = Duration::from_secs_f64(durations.quantile(0.9).unwrap().unwrap());
        let p99 = Duration::from_secs_f64(durations.quantile(0.99).unwrap().unwrap());
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
