//! Shared helpers for running blocking adapters, external commands and
//! pacing retries.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run a blocking closure (process spawn, git2) off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Run `cmd` to completion within `duration`. On timeout the child is
/// killed along with the dropped future.
pub async fn output_with_timeout(mut cmd: Command, duration: Duration) -> Result<Output> {
    cmd.kill_on_drop(true);
    match timeout(duration, cmd.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Domain prefix of a domain-prefixed id: `gt-abc12` -> `gt`.
pub fn id_prefix(id: &str) -> &str {
    id.split_once('-').map(|(p, _)| p).unwrap_or(id)
}
