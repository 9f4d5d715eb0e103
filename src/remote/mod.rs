//! Remote device telemetry over ssh
//!
//! The device layer lives on a separate host that appends free-text lines
//! carrying a write-amplification figure to a rolling log. This module only
//! reads what the remote side already wrote. Every call is best effort: an
//! unreachable host or a log without a figure yields `Unavailable` or
//! `Failed`, never an error.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::common::BestEffort;
use crate::config::RemoteConfig;
use crate::host::{CommandRunner, CommandSpec};

/// ssh access to the telemetry host
#[derive(Clone)]
pub struct RemoteShell {
    runner: Arc<dyn CommandRunner>,
    config: RemoteConfig,
}

impl RemoteShell {
    pub fn new(runner: Arc<dyn CommandRunner>, config: RemoteConfig) -> Self {
        Self { runner, config }
    }

    /// Build the ssh invocation for a remote command
    pub fn ssh_command(&self, remote_cmd: &str) -> Option<CommandSpec> {
        let host = self.config.target_host()?;
        let target = match self.config.user {
            Some(ref user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        Some(
            CommandSpec::new(&self.config.ssh_program)
                .args([
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    format!("ConnectTimeout={}", self.config.connect_timeout_secs),
                    target,
                    remote_cmd.to_string(),
                ])
                .timeout(Duration::from_secs(self.config.command_timeout_secs)),
        )
    }

    /// Run a command on the remote host and return its stdout
    pub async fn exec(&self, remote_cmd: &str) -> BestEffort<String> {
        let Some(cmd) = self.ssh_command(remote_cmd) else {
            return BestEffort::Unavailable;
        };
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => BestEffort::Value(output.stdout),
            Ok(output) => BestEffort::failed(format!(
                "remote command exited with {:?}: {}",
                output.code,
                output.stderr.trim()
            )),
            Err(e) => BestEffort::failed(e.to_string()),
        }
    }

    /// Run the configured counter-reset hook
    pub async fn reset_counters(&self) -> BestEffort<()> {
        match self.config.reset_command.clone() {
            Some(cmd) => self.exec(&cmd).await.map(|_| ()),
            None => BestEffort::Unavailable,
        }
    }

    /// Run the configured snapshot hook (writes into the remote log)
    pub async fn snapshot_counters(&self) -> BestEffort<()> {
        match self.config.snapshot_command.clone() {
            Some(cmd) => self.exec(&cmd).await.map(|_| ()),
            None => BestEffort::Unavailable,
        }
    }

    /// Latest write-amplification figure in the remote log
    pub async fn write_amplification(&self) -> BestEffort<f64> {
        let cmd = format!(
            "tail -n {} {}",
            self.config.tail_lines, self.config.log_path
        );
        let result = self
            .exec(&cmd)
            .await
            .and_then(|text| parse_last_write_amplification(&text).into());
        debug!(result = %result, "Remote write amplification");
        result
    }
}

fn waf_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)(?:\bwaf\b|write[ _-]?amplification(?:[ _-]?factor)?)",
            r"\s*[:=]?\s*([0-9]+(?:\.[0-9]+)?)",
        ))
        .expect("static regex")
    })
}

/// Last write-amplification figure in free text
///
/// Recognises `WAF: 2.41`, `waf=2.41`, `write amplification 2.41` and
/// `write_amplification_factor=2.41`. Later lines win.
pub fn parse_last_write_amplification(text: &str) -> Option<f64> {
    waf_pattern()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .last()
}
