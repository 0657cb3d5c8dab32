//! Bounded parallel executor shared by the rasterisation and inference stages.
//!
//! ## Why `spawn_blocking` + `buffered`?
//!
//! Page rendering and model inference are CPU-bound and call into C/C++
//! libraries that block. Running them on Tokio's blocking pool gives real
//! thread-level parallelism while the request task stays free to serve other
//! HTTP calls. `StreamExt::buffered` caps how many are in flight and yields
//! outcomes in **input order**, so callers index results by position
//! (page number) no matter which worker finished first.
//!
//! A worker error, panic or timeout becomes a [`UnitError`] for that slot
//! only. Every dispatched unit is awaited before [`run_parallel`] returns.
//!
//! [`run_parallel_async_with`] takes async workers instead. A unit that
//! exceeds its budget is dropped, so a worker that owns a child process
//! (spawned with `kill_on_drop`) takes the process down with it.

use crate::error::UnitError;
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::future::Future;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, warn};

/// Result of one unit of parallel work.
pub type Outcome<R> = Result<R, UnitError>;

/// Concurrency ceiling and per-unit timeout of one executor call.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Units in flight at once. Values below 1 are treated as 1.
    pub max_workers: usize,
    /// Budget per unit. `None` waits forever.
    pub unit_timeout: Option<Duration>,
}

impl ExecutorOptions {
    pub fn new(max_workers: usize, unit_timeout: Option<Duration>) -> Self {
        Self {
            max_workers: max_workers.max(1),
            unit_timeout,
        }
    }
}

/// Run `worker` over `items` on the blocking pool, at most
/// `opts.max_workers` at a time.
///
/// Returns one [`Outcome`] per item, aligned with the input.
pub async fn run_parallel<T, R, E, F>(items: Vec<T>, worker: F, opts: ExecutorOptions) -> Vec<Outcome<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Display + 'static,
    F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
{
    run_parallel_with(items, worker, opts, |_, _| {}).await
}

/// Like [`run_parallel`], calling `on_done(index, &outcome)` as each unit
/// finishes (completion order, not input order).
pub async fn run_parallel_with<T, R, E, F, H>(
    items: Vec<T>,
    worker: F,
    opts: ExecutorOptions,
    on_done: H,
) -> Vec<Outcome<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Display + 'static,
    F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    H: Fn(usize, &Outcome<R>),
{
    let worker = Arc::new(worker);
    run_parallel_async_with(
        items,
        move |item: T| {
            let worker = Arc::clone(&worker);
            // The blocking thread cannot be interrupted; on timeout it runs
            // to completion in the background and its result is dropped.
            let handle =
                tokio::task::spawn_blocking(move || worker(item).map_err(|e| UnitError::failed(e)));
            async move { join_outcome(handle.await) }
        },
        opts,
        on_done,
    )
    .await
}

/// Run the async `worker` over `items`, at most `opts.max_workers` at a time.
///
/// The unit budget starts when the unit is dispatched; a unit over budget is
/// dropped and reported as [`UnitError::Timeout`]. Outcomes are aligned with
/// the input; `on_done` fires in completion order.
pub async fn run_parallel_async_with<T, R, F, Fut, H>(
    items: Vec<T>,
    worker: F,
    opts: ExecutorOptions,
    on_done: H,
) -> Vec<Outcome<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Outcome<R>>,
    H: Fn(usize, &Outcome<R>),
{
    let limit = opts.max_workers.max(1);
    let worker = &worker;
    let on_done = &on_done;

    stream::iter(items.into_iter().enumerate().map(|(idx, item)| async move {
        let unit = worker(item);
        let outcome = match opts.unit_timeout {
            Some(budget) => match tokio::time::timeout(budget, unit).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(unit = idx, "unit exceeded {}s budget", budget.as_secs());
                    Err(UnitError::Timeout {
                        secs: budget.as_secs(),
                    })
                }
            },
            None => unit.await,
        };

        if let Err(ref e) = outcome {
            debug!(unit = idx, error = %e, "unit failed");
        }
        on_done(idx, &outcome);
        outcome
    }))
    .buffered(limit)
    .collect()
    .await
}

/// Turn a joined blocking task into an [`Outcome`], capturing panics.
pub(crate) fn join_outcome<R>(joined: Result<Outcome<R>, JoinError>) -> Outcome<R> {
    match joined {
        Ok(outcome) => outcome,
        Err(join_err) if join_err.is_panic() => Err(UnitError::Panicked {
            detail: panic_message(join_err.into_panic()),
        }),
        Err(join_err) => Err(UnitError::failed(join_err)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
