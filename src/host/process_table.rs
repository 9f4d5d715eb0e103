//! Long-running process control on the local host
//!
//! Dependent processes are launched through `setsid --fork` so that a
//! hang-up of the orchestrator's terminal never reaches them. The launcher
//! exits immediately, so the real pid is recovered afterwards by matching
//! the process table with `pgrep`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::common::{BenchError, BenchResult};

/// Signals used by the staged shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination (SIGTERM)
    Terminate,
    /// Forced termination (SIGKILL)
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Everything needed to launch one detached process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// stdout and stderr are appended here
    pub log_path: PathBuf,
}

/// Launches, finds and signals processes
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Start the process detached from the controlling session
    async fn launch_detached(&self, spec: &LaunchSpec) -> BenchResult<()>;

    /// Newest process whose command line matches `pattern`
    async fn find_pid(&self, pattern: &str) -> Option<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Send a signal; signalling a process that is already gone is not an error
    fn signal(&self, pid: u32, signal: Signal) -> BenchResult<()>;

    /// Processes holding a socket on `port`
    async fn pids_on_port(&self, port: u16) -> Vec<u32>;
}

/// `ProcessTable` for the local Linux host
#[derive(Debug, Default, Clone)]
pub struct HostProcessTable;

#[async_trait]
impl ProcessTable for HostProcessTable {
    async fn launch_detached(&self, spec: &LaunchSpec) -> BenchResult<()> {
        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let log_err = log.try_clone()?;

        let status = tokio::process::Command::new("setsid")
            .arg("--fork")
            .arg(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|e| BenchError::command("setsid", e.to_string()))?;

        if !status.success() {
            return Err(BenchError::command(
                format!("setsid --fork {}", spec.program),
                format!("launcher exited with {}", status),
            ));
        }
        debug!(
            program = %spec.program,
            log = %spec.log_path.display(),
            "Launched detached process"
        );
        Ok(())
    }

    async fn find_pid(&self, pattern: &str) -> Option<u32> {
        let output = tokio::process::Command::new("pgrep")
            .args(["-n", "-f", pattern])
            .output()
            .await
            .ok()?;
        let own = std::process::id();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .find(|pid| *pid != own)
    }

    fn is_alive(&self, pid: u32) -> bool {
        // SAFETY: signal 0 performs only the existence/permission check
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        let exists = rc == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        exists && !is_zombie(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> BenchResult<()> {
        // SAFETY: plain kill(2) on a pid we discovered; no memory is shared
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(BenchError::Io(err))
    }

    async fn pids_on_port(&self, port: u16) -> Vec<u32> {
        let output = match tokio::process::Command::new("lsof")
            .args(["-t", "-i", &format!(":{}", port)])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(port, error = %e, "lsof unavailable, skipping port cleanup");
                return Vec::new();
            }
        };
        parse_pid_lines(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse one pid per line, ignoring noise and duplicates
pub fn parse_pid_lines(text: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = text
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// A zombie still answers kill(0) but has already exited
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // State follows the parenthesised command name
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_lines() {
        assert_eq!(parse_pid_lines("123\n 45\nabc\n123\n"), vec![45, 123]);
        assert!(parse_pid_lines("").is_empty());
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(HostProcessTable.is_alive(std::process::id()));
    }

    #[test]
    fn test_signal_to_missing_process_is_ok() {
        // pid_max on Linux never reaches this value
        assert!(HostProcessTable.signal(u32::MAX / 2, Signal::Terminate).is_ok());
        assert!(!HostProcessTable.is_alive(u32::MAX / 2));
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(Signal::Terminate.as_raw(), libc::SIGTERM);
        assert_eq!(Signal::Kill.as_raw(), libc::SIGKILL);
    }
}
