//! Admission control for batch dispatch.
//!
//! Before each item is handed a worker, the dispatcher waits until the
//! number of live sessions in the target pool is below `max_concurrent`.
//! The wait polls with exponential backoff and gives up after a ceiling.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::DispatchConfig;
use crate::session::SessionManager;
use crate::util::backoff_delay;
use crate::workers::WorkerPool;
use crate::{glog_debug, Error, Result};

use super::liveness::LivenessProber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// 0 means unlimited.
    pub max_concurrent: usize,
    pub poll: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl AdmissionPolicy {
    pub fn from_config(config: &DispatchConfig, max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            poll: config.admission_poll(),
            max_backoff: config.admission_max_backoff(),
            timeout: config.admission_timeout(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_concurrent == 0
    }

    /// Wait until `in_flight()` reports a count below the limit.
    ///
    /// Returns the last observed count. Errors from `in_flight` abort the
    /// wait; running past `timeout` yields `Error::Timeout`.
    pub async fn wait_for_slot<F, Fut>(&self, mut in_flight: F) -> Result<usize>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        if self.is_unlimited() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let count = in_flight().await?;
            if count < self.max_concurrent {
                return Ok(count);
            }
            if started.elapsed() >= self.timeout {
                return Err(Error::Timeout(self.timeout));
            }
            let delay = backoff_delay(self.poll, attempt, self.max_backoff);
            glog_debug!(
                "admission: {} in flight, limit {}, waiting {:?}",
                count,
                self.max_concurrent,
                delay
            );
            sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

/// Live sessions belonging to the workers of `pool`.
pub async fn pool_in_flight(
    pool: &str,
    workers: &dyn WorkerPool,
    sessions: &dyn SessionManager,
    prober: &LivenessProber,
) -> Result<usize> {
    let names: Vec<String> = workers
        .workers(pool)
        .await?
        .iter()
        .map(|w| sessions.session_name(&w.identity))
        .collect();
    Ok(prober.count_running(&names).await)
}
