//! Bounded worker pool for per-node jobs.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};

/// Runs `job` over `items` on at most `workers` blocking threads.
///
/// Results come back in input order. A failing item does not stop the
/// others; each slot carries its own result.
pub async fn run_bounded<I, T, F>(items: Vec<I>, workers: usize, job: F) -> Vec<Result<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Result<T> + Send + Sync + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let job = Arc::new(job);
    let mut set = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                set.abort_all();
                return (0..total).map(|_| Err(Error::Task(e.to_string()))).collect();
            }
        };
        let job = Arc::clone(&job);
        set.spawn_blocking(move || {
            let _permit = permit;
            (idx, job(item))
        });
    }

    let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result)) => {
                if let Some(slot) = slots.get_mut(idx) {
                    *slot = Some(result);
                }
            }
            Err(e) => tracing::error!(error = %e, "worker task failed"),
        }
    }
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(Error::Task("job did not complete".into()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn preserves_input_order() {
        let out = run_bounded((0..20u64).collect(), 4, |n| Ok(n * 2)).await;
        let values: Vec<u64> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..20u64).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_worker_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        run_bounded((0..16).collect::<Vec<u32>>(), 3, move |_| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(10));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn failures_stay_in_their_slot() {
        let out = run_bounded(vec![1, 2, 3], 0, |n| {
            if n == 2 { Err(Error::Config("two".into())) } else { Ok(n) }
        })
        .await;
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(Error::Config(_))));
        assert_eq!(*out[2].as_ref().unwrap(), 3);
    }
}
