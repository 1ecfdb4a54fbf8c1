//! Fan-out / fan-in over the echo service.
//!
//! Both variants issue one sub-request per key, fold the returned values into
//! an insertion-ordered [`ResultSet`], and fail fast on the first error:
//!
//! - [`pool`] runs each sub-request on a blocking worker thread, bounded by a
//!   semaphore shared by every run of one [`Aggregator`], with the result set
//!   behind a mutex.
//! - [`reactive`] drives every sub-request from a single task over
//!   non-blocking I/O and folds completions without locking.
//!
//! Output order is completion order and is not stable across runs.

pub mod pool;
pub mod reactive;

use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::echo::EchoSource;
use crate::error::FanoutError;

/// Keys sent to the echo service, one sub-request each.
pub const KEYS: RangeInclusive<u32> = 1..=9;

/// Max concurrent sub-requests: per run for the reactive variant, across
/// all runs of one aggregator for the pool.
pub const DEFAULT_WIDTH: usize = 8;

/// Overall fan-out deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Scheduling model used by an [`Aggregator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Bounded pool of blocking workers.
    #[default]
    Pool,
    /// Single cooperative task, non-blocking I/O.
    Reactive,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Reactive => "reactive",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pool" => Ok(Self::Pool),
            "reactive" => Ok(Self::Reactive),
            other => Err(format!("unknown variant {other:?} (expected pool or reactive)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOptions {
    /// Concurrency bound. Values below 1 are treated as 1.
    pub width: usize,
    /// Deadline for the whole fan-out. `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            deadline: Some(DEFAULT_DEADLINE),
        }
    }
}

/// Values collected from sub-requests, deduplicated, in insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResultSet(IndexSet<String>);

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the value was already present (its position is kept).
    pub fn insert(&mut self, value: String) -> bool {
        self.0.insert(value)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Concatenate members in insertion order.
    pub fn join(&self) -> String {
        self.0.iter().map(String::as_str).collect()
    }
}

/// One fan-out over [`KEYS`] against a shared [`EchoSource`].
///
/// The pool variant draws worker permits from one semaphore owned by the
/// aggregator, so `width` caps blocking workers across all concurrent runs.
pub struct Aggregator<S> {
    source: Arc<S>,
    variant: Variant,
    options: FanoutOptions,
    workers: Arc<Semaphore>,
}

impl<S: EchoSource> Aggregator<S> {
    pub fn new(source: Arc<S>, variant: Variant, options: FanoutOptions) -> Self {
        Self {
            source,
            variant,
            options,
            workers: Arc::new(Semaphore::new(options.width.max(1))),
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn options(&self) -> FanoutOptions {
        self.options
    }

    /// Run the fan-out and collect the deduplicated result set.
    ///
    /// Cancelling `cancel` stops every in-flight sub-request.
    pub async fn collect(&self, cancel: &CancellationToken) -> Result<ResultSet, FanoutError> {
        let start = Instant::now();

        let result = match self.variant {
            Variant::Pool => {
                with_deadline(
                    self.options.deadline,
                    pool::aggregate(
                        Arc::clone(&self.source),
                        KEYS,
                        Arc::clone(&self.workers),
                        cancel,
                    ),
                )
                .await
            }
            Variant::Reactive => {
                with_deadline(
                    self.options.deadline,
                    reactive::aggregate(
                        Arc::clone(&self.source),
                        KEYS,
                        self.options.width.max(1),
                        cancel,
                    ),
                )
                .await
            }
        };

        let elapsed_ms = millis(start.elapsed());
        match &result {
            Ok(set) => tracing::info!(
                variant = %self.variant,
                results = set.len(),
                elapsed_ms,
                "fan-out complete"
            ),
            Err(e) => tracing::warn!(
                variant = %self.variant,
                failed_key = ?e.failed_key(),
                elapsed_ms,
                "fan-out failed: {e}"
            ),
        }
        result
    }

    /// Run the fan-out and join the results into one string.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<String, FanoutError> {
        self.collect(cancel).await.map(|set| set.join())
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T, FanoutError>>,
) -> Result<T, FanoutError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FanoutError::Timeout(millis(limit)))?,
        None => fut.await,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
