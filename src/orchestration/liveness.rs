//! Bounded parallel liveness probing.

use futures::stream::{self, StreamExt};
use std::sync::Arc;

use crate::session::SessionManager;
use crate::{glog_trace, glog_warn, Result};

/// Result of probing one session.
#[derive(Debug)]
pub struct Probe {
    pub name: String,
    pub running: Result<bool>,
}

/// Runs `is_running` over many sessions with at most `parallelism` probes
/// in flight. Each probe owns its result slot; results come back in input
/// order once every probe has finished.
#[derive(Clone)]
pub struct LivenessProber {
    sessions: Arc<dyn SessionManager>,
    parallelism: usize,
}

impl LivenessProber {
    pub fn new(sessions: Arc<dyn SessionManager>, parallelism: usize) -> Self {
        Self {
            sessions,
            parallelism: parallelism.max(1),
        }
    }

    pub async fn probe(&self, names: &[String]) -> Vec<Probe> {
        glog_trace!(
            "probing {} sessions, parallelism={}",
            names.len(),
            self.parallelism
        );
        stream::iter(names.iter().cloned().map(|name| {
            let sessions = Arc::clone(&self.sessions);
            async move {
                let running = sessions.is_running(&name).await;
                Probe { name, running }
            }
        }))
        .buffered(self.parallelism)
        .collect()
        .await
    }

    /// Number of sessions confirmed running. Probe errors are skipped.
    pub async fn count_running(&self, names: &[String]) -> usize {
        self.probe(names)
            .await
            .into_iter()
            .filter(|p| match &p.running {
                Ok(running) => *running,
                Err(e) => {
                    glog_warn!("liveness probe of {} failed, not counted: {}", p.name, e);
                    false
                }
            })
            .count()
    }
}
