//! Session manager port.
//!
//! A worker runs inside a named terminal session. The engine only needs to
//! start one, ask whether it is still alive, and kill it during rollback.
//! Session names are derived from the worker identity, never stored.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::core::identity::AgentIdentity;
use crate::tmux::Tmux;
use crate::util::blocking;
use crate::{glog_debug, Error, Result};

/// What to run in a new session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSpec {
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Pure, deterministic derivation from the identity.
    fn session_name(&self, identity: &AgentIdentity) -> String;

    async fn start(&self, name: &str, spec: &SessionSpec) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Killing an absent session succeeds.
    async fn kill(&self, name: &str) -> Result<()>;
}

/// tmux-backed sessions.
#[derive(Debug, Clone)]
pub struct TmuxSessions {
    prefix: String,
}

impl TmuxSessions {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl SessionManager for TmuxSessions {
    fn session_name(&self, identity: &AgentIdentity) -> String {
        identity.session_name(&self.prefix)
    }

    async fn start(&self, name: &str, spec: &SessionSpec) -> Result<()> {
        let name = name.to_string();
        let spec = spec.clone();
        blocking(move || {
            if Tmux::is_alive(&name)? {
                return Err(Error::Session(format!("session {} is already running", name)));
            }
            // A dead pane left by remain-on-exit would block new-session.
            Tmux::kill_session(&name)?;
            Tmux::create_session(&name, &spec.workdir, &spec.command, &spec.env)
        })
        .await
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        blocking(move || Tmux::is_alive(&name)).await
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        blocking(move || Tmux::kill_session(&name)).await
    }
}

#[derive(Default)]
struct MemorySessionState {
    running: HashSet<String>,
    /// Remaining liveness probes before a session exits on its own.
    lifetimes: HashMap<String, u32>,
    default_lifetime: Option<u32>,
    started: Vec<String>,
    killed: Vec<String>,
    fail_start: HashSet<String>,
    /// 1-based index of a `start` call that fails regardless of name.
    fail_nth_start: Option<usize>,
    start_calls: usize,
    fail_probe: HashSet<String>,
    peak_running: usize,
}

/// In-process sessions for tests and dry embedding.
pub struct MemorySessions {
    prefix: String,
    state: Mutex<MemorySessionState>,
}

impl MemorySessions {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            state: Mutex::new(MemorySessionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemorySessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a session as running without going through `start`.
    pub fn set_running(&self, name: &str) {
        let mut state = self.lock();
        state.running.insert(name.to_string());
        state.peak_running = state.peak_running.max(state.running.len());
    }

    pub fn fail_start(&self, name: &str) {
        self.lock().fail_start.insert(name.to_string());
    }

    pub fn fail_nth_start(&self, n: usize) {
        self.lock().fail_nth_start = Some(n);
    }

    pub fn fail_probe(&self, name: &str) {
        self.lock().fail_probe.insert(name.to_string());
    }

    /// Sessions started from now on exit after being probed `probes` times.
    pub fn exit_after_probes(&self, probes: u32) {
        self.lock().default_lifetime = Some(probes);
    }

    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().running.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    /// Highest number of simultaneously running sessions observed.
    pub fn peak_running(&self) -> usize {
        self.lock().peak_running
    }
}

#[async_trait]
impl SessionManager for MemorySessions {
    fn session_name(&self, identity: &AgentIdentity) -> String {
        identity.session_name(&self.prefix)
    }

    async fn start(&self, name: &str, _spec: &SessionSpec) -> Result<()> {
        let mut state = self.lock();
        state.start_calls += 1;
        if state.fail_start.contains(name) || state.fail_nth_start == Some(state.start_calls) {
            return Err(Error::Session(format!("failed to start session {}", name)));
        }
        if state.running.contains(name) {
            return Err(Error::Session(format!("session {} is already running", name)));
        }
        state.running.insert(name.to_string());
        state.started.push(name.to_string());
        if let Some(lifetime) = state.default_lifetime {
            state.lifetimes.insert(name.to_string(), lifetime);
        }
        state.peak_running = state.peak_running.max(state.running.len());
        glog_debug!("memory session started: {}", name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        if state.fail_probe.contains(name) {
            return Err(Error::Session(format!("cannot reach session {}", name)));
        }
        if !state.running.contains(name) {
            return Ok(false);
        }
        match state.lifetimes.get(name).copied() {
            Some(0) => {
                state.lifetimes.remove(name);
                state.running.remove(name);
                Ok(false)
            }
            Some(n) => {
                state.lifetimes.insert(name.to_string(), n - 1);
                Ok(true)
            }
            None => Ok(true),
        }
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.running.remove(name);
        state.lifetimes.remove(name);
        state.killed.push(name.to_string());
        Ok(())
    }
}
