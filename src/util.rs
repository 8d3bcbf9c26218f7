//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::{Error, Result};

/// Await `fut` for at most `duration`.
///
/// The inner future is dropped when the deadline passes.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Await a spawned task, mapping panics and cancellation to `Error::TaskJoin`.
pub async fn join<T>(handle: JoinHandle<T>) -> Result<T> {
    handle.await.map_err(|e| Error::TaskJoin(e.to_string()))
}

/// Arithmetic mean, `None` for an empty input.
pub fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
