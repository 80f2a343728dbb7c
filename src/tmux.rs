use std::path::Path;
use std::process::Command;

use crate::{glog_debug, glog_trace, glog_warn, Error, Result};

pub struct Tmux;

impl Tmux {
    /// Start a detached session running `cmd` in `cwd` with extra env vars.
    pub fn create_session(
        name: &str,
        cwd: &Path,
        cmd: &[String],
        env: &[(String, String)],
    ) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cmd_str = cmd
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        glog_debug!(
            "Tmux::create_session name={} cwd={} cmd={}",
            name,
            cwd.display(),
            cmd_str
        );

        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd.display().to_string(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(cmd_str);

        let output = Command::new("tmux").args(&args).output()?;
        if !output.status.success() {
            let err = format!(
                "Failed to create session '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            glog_warn!("tmux create_session failed: {}", err);
            return Err(Error::Tmux(err));
        }

        // Keep the pane around after the agent exits so its output can be read.
        let _ = Command::new("tmux")
            .args(["set-option", "-t", name, "remain-on-exit", "on"])
            .output();

        glog_debug!("Tmux session created: {}", name);
        Ok(())
    }

    pub fn kill_session(name: &str) -> Result<()> {
        glog_debug!("Tmux::kill_session name={}", name);
        let output = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_absent(&stderr) {
                glog_warn!("Failed to kill tmux session '{}': {}", name, stderr);
                return Err(Error::Tmux(format!(
                    "Failed to kill session '{}': {}",
                    name,
                    stderr.trim()
                )));
            }
            glog_debug!("Tmux session '{}' not found (already dead?)", name);
        }
        Ok(())
    }

    /// Whether the session exists and its pane has not exited.
    ///
    /// Unlike a bare `has-session`, an error talking to tmux is reported as
    /// an error rather than as "not running".
    pub fn is_alive(name: &str) -> Result<bool> {
        let output = Command::new("tmux")
            .args(["list-panes", "-t", name, "-F", "#{pane_dead}"])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_absent(&stderr) {
                return Ok(false);
            }
            return Err(Error::Tmux(format!(
                "Failed to query session '{}': {}",
                name,
                stderr.trim()
            )));
        }
        let panes = String::from_utf8_lossy(&output.stdout);
        glog_trace!("Tmux::is_alive name={} panes={:?}", name, panes.trim());
        Ok(panes.lines().any(|l| l.trim() == "0"))
    }

    pub fn is_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// tmux phrasing for "there is nothing by that name".
fn is_absent(stderr: &str) -> bool {
    stderr.contains("can't find session")
        || stderr.contains("session not found")
        || stderr.contains("no server running")
        || stderr.contains("error connecting")
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
