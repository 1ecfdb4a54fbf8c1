//! Cooperative fan-out.
//!
//! One task owns every in-flight sub-request through `buffer_unordered` and
//! folds completions straight into a plain [`ResultSet`]. Nothing else
//! touches the set, so there is no lock. Dropping the pipeline drops every
//! pending request.

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::echo::EchoSource;
use crate::error::FanoutError;
use crate::fanout::ResultSet;

/// Fan out `keys` with at most `width` requests in flight.
///
/// The first failure short-circuits the fold and is returned.
pub async fn aggregate<S: EchoSource>(
    source: Arc<S>,
    keys: impl IntoIterator<Item = u32>,
    width: usize,
    cancel: &CancellationToken,
) -> Result<ResultSet, FanoutError> {
    let pipeline = stream::iter(keys)
        .map(move |key| {
            let source = Arc::clone(&source);
            async move {
                source
                    .fetch(key)
                    .await
                    .map(|value| (key, value))
                    .map_err(FanoutError::from)
            }
        })
        .buffer_unordered(width.max(1))
        .try_fold(ResultSet::new(), |mut set, (key, value)| async move {
            let fresh = set.insert(value);
            tracing::debug!(key, fresh, "sub-request completed");
            Ok(set)
        });

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FanoutError::Cancelled),
        folded = pipeline => folded,
    }
}
