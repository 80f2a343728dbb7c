//! Notification channel port.
//!
//! Delivery is fire-and-forget from the engine's point of view: callers log
//! failures and carry on.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

use crate::util::output_with_timeout;
use crate::{glog, glog_debug, Error, Result};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, address: &str, subject: &str, _body: &str) -> Result<()> {
        glog!("notify to={} subject={:?}", address, subject);
        Ok(())
    }
}

/// Runs a configured command per notification, substituting `{address}`,
/// `{subject}` and `{body}` in each argument.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(template: Vec<String>) -> Result<Self> {
        if template.is_empty() {
            return Err(Error::Validation(
                "notify command cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            template,
            timeout: Duration::from_secs(30),
        })
    }

    fn render(&self, address: &str, subject: &str, body: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{address}", address)
                    .replace("{subject}", subject)
                    .replace("{body}", body)
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let argv = self.render(address, subject, body);
        glog_debug!("notify command: {}", argv.join(" "));
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        let output = output_with_timeout(cmd, self.timeout).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Notify(format!(
                "delivery to {} failed: {}",
                address,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// A delivered notification, as recorded by [`MemoryNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub address: String,
    pub subject: String,
    pub body: String,
}

/// Records notifications in memory; addresses in `failing` are rejected.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, address: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(address.to_string());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failing.iter().any(|a| a == address) {
            return Err(Error::Notify(format!("mailbox {} unavailable", address)));
        }
        drop(failing);
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Sent {
                address: address.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}
