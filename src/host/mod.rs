//! Host interfaces: external commands, HTTP and the process table
//!
//! Everything the orchestrator does to the outside world goes through one of
//! three traits so that provisioning, telemetry, the pipeline and the
//! supervisor can be driven by fakes in tests:
//! - `CommandRunner` runs a program to completion
//! - `HttpFetcher` performs a GET against a health or metrics endpoint
//! - `ProcessTable` launches, finds and signals long-running processes

pub mod process_table;

pub use process_table::{HostProcessTable, LaunchSpec, ProcessTable, Signal};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::common::{BenchError, BenchResult};

/// Maximum bytes of stderr carried into an error message
const STDERR_TAIL_BYTES: usize = 2048;

/// A program invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Space-joined command line for logs and fakes
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn stderr_tail(&self) -> &str {
        let s = self.stderr.trim_end();
        let mut start = s.len().saturating_sub(STDERR_TAIL_BYTES);
        while !s.is_char_boundary(start) {
            start += 1;
        }
        &s[start..]
    }
}

/// Runs external programs to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command. Only spawn failures and timeouts are errors;
    /// a non-zero exit is reported through `CommandOutput::code`.
    async fn run(&self, cmd: &CommandSpec) -> BenchResult<CommandOutput>;

    /// Run the command and treat a non-zero exit as an error
    async fn run_checked(&self, cmd: &CommandSpec) -> BenchResult<CommandOutput> {
        let output = self.run(cmd).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(BenchError::command(
                cmd.command_line(),
                format!(
                    "exit code {:?}: {}",
                    output.code,
                    output.stderr_tail()
                ),
            ))
        }
    }
}

/// `CommandRunner` backed by `tokio::process`
///
/// Child processes are killed when the future is dropped, so a cancelled
/// remote call does not leave an ssh client behind.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandSpec) -> BenchResult<CommandOutput> {
        debug!(command = %cmd.command_line(), "Running command");

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let fut = command.output();
        let output = match cmd.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                BenchError::command(
                    cmd.command_line(),
                    format!("timed out after {}s", limit.as_secs()),
                )
            })?,
            None => fut.await,
        }
        .map_err(|e| BenchError::command(cmd.program.clone(), e.to_string()))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Response of an HTTP GET
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs HTTP GET requests against dependent processes
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> BenchResult<HttpResponse>;
}

/// `HttpFetcher` backed by reqwest
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> BenchResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(timeout)
            .build()
            .map_err(|e| BenchError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> BenchResult<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BenchError::Http(format!("GET {}: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| BenchError::Http(format!("GET {}: {}", url, e)))?;
        Ok(HttpResponse { status, body })
    }
}

/// Bundle of host interfaces threaded through a trial
#[derive(Clone)]
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub processes: Arc<dyn ProcessTable>,
    pub http: Arc<dyn HttpFetcher>,
}

impl Host {
    /// The real host: local processes, local commands, reqwest
    pub fn system() -> BenchResult<Self> {
        Ok(Self {
            runner: Arc::new(SystemRunner),
            processes: Arc::new(HostProcessTable),
            http: Arc::new(ReqwestFetcher::new(Duration::from_secs(5))?),
        })
    }
}

/// Resolve a program the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let cmd = CommandSpec::new("mount")
            .arg("-o")
            .args(["fdp_log_n=8", "/dev/nvme1n1", "/mnt"])
            .env("LANG", "C")
            .timeout(Duration::from_secs(5));
        assert_eq!(cmd.command_line(), "mount -o fdp_log_n=8 /dev/nvme1n1 /mnt");
        assert_eq!(cmd.env, vec![("LANG".to_string(), "C".to_string())]);
        assert_eq!(cmd.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::ok("").success());
        assert!(!CommandOutput::failed(32, "not mounted").success());
        assert!(!CommandOutput::default().success());
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let out = CommandOutput::failed(1, "x".repeat(10_000));
        assert_eq!(out.stderr_tail().len(), STDERR_TAIL_BYTES);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let out = SystemRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_checked_reports_non_zero_exit() {
        let err = SystemRunner
            .run_checked(&CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 1"]))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code Some(1)"));
        assert!(msg.contains("broken"));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let err = SystemRunner
            .run(&CommandSpec::new("sleep").arg("5").timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_find_program() {
        assert!(find_program("sh").is_some());
        assert!(find_program("/definitely/not/here").is_none());
        assert!(find_program("no-such-program-placement-bench").is_none());
    }
}
