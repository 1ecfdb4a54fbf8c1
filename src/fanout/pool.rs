//! Worker-pool fan-out.
//!
//! Each sub-request gets its own blocking worker thread that parks on the
//! shared async client through [`Handle::block_on`]. Workers hold a permit
//! from a semaphore the caller shares across fan-outs, so concurrent requests
//! together never run more than its permit count. Results go through a
//! mutex-guarded [`ResultSet`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::echo::EchoSource;
use crate::error::FanoutError;
use crate::fanout::ResultSet;

/// Fan out `keys` over blocking workers, each holding one of `permits`.
///
/// Must be called from inside a multi-threaded tokio runtime (or a
/// current-thread runtime whose driver thread is awaiting this future).
/// The first failing worker aborts the rest and its error is returned.
pub async fn aggregate<S: EchoSource>(
    source: Arc<S>,
    keys: impl IntoIterator<Item = u32>,
    permits: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<ResultSet, FanoutError> {
    let handle = Handle::current();
    let results = Arc::new(Mutex::new(ResultSet::new()));

    // Cancelled when this future completes or is dropped, so blocking
    // workers never outlive the fan-out that started them.
    let token = cancel.child_token();
    let _stop_workers = token.clone().drop_guard();

    let mut set = JoinSet::new();
    let mut task_keys: HashMap<TaskId, u32> = HashMap::new();

    for key in keys {
        let handle = handle.clone();
        let permits = Arc::clone(&permits);
        let results = Arc::clone(&results);
        let source = Arc::clone(&source);
        let token = token.clone();

        let abort_handle = set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Err(FanoutError::Cancelled);
            };

            let worker = tokio::task::spawn_blocking(move || -> Result<(), FanoutError> {
                let value = handle.block_on(async {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => Err(FanoutError::Cancelled),
                        fetched = source.fetch(key) => fetched.map_err(FanoutError::from),
                    }
                })?;
                let fresh = results.blocking_lock().insert(value);
                tracing::debug!(key, fresh, "worker finished");
                Ok(())
            });

            match worker.await {
                Ok(done) => done,
                Err(e) if e.is_panic() => Err(FanoutError::WorkerPanicked { key }),
                Err(_) => Err(FanoutError::Cancelled),
            }
        });
        task_keys.insert(abort_handle.id(), key);
    }

    loop {
        let joined = tokio::select! {
            biased;
            () = token.cancelled() => return Err(FanoutError::Cancelled),
            joined = set.join_next() => joined,
        };

        match joined {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => {
                tracing::warn!(failed_key = ?e.failed_key(), "aborting pool fan-out: {e}");
                set.abort_all();
                return Err(e);
            }
            Some(Err(join_err)) if join_err.is_panic() => {
                set.abort_all();
                let key = task_keys.get(&join_err.id()).copied().unwrap_or_default();
                tracing::error!(key, "pool task panicked: {join_err}");
                return Err(FanoutError::WorkerPanicked { key });
            }
            Some(Err(_)) => return Err(FanoutError::Cancelled),
            None => break,
        }
    }

    let collected = std::mem::take(&mut *results.lock().await);
    Ok(collected)
}
