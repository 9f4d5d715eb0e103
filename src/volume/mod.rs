//! Volume provisioner
//!
//! Formats and mounts the block device with a given number of logical write
//! streams, and tears it down between trials.
//!
//! # Design Principles (KISS)
//! - `prepare` and `teardown` are idempotent: "not mounted" is success
//! - Counter `reset`/`snapshot` hooks are best effort and never fatal
//! - All commands go through `CommandRunner`

use std::sync::Arc;

use tracing::{info, warn};

use crate::common::{BenchError, BenchResult, BestEffort};
use crate::config::DeviceConfig;
use crate::host::{CommandRunner, CommandSpec};
use crate::remote::RemoteShell;

/// Stderr fragments meaning "there was nothing to unmount"
const NOT_MOUNTED_MARKERS: &[&str] = &[
    "not mounted",
    "no mount point specified",
    "not found",
    "no such file or directory",
];

/// True if an umount failure only says the target was not mounted
pub fn is_not_mounted(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    NOT_MOUNTED_MARKERS.iter().any(|m| lower.contains(m))
}

/// The capacity-constrained device under test
pub struct Volume {
    device: DeviceConfig,
    runner: Arc<dyn CommandRunner>,
    remote: RemoteShell,
}

impl Volume {
    pub fn new(device: DeviceConfig, runner: Arc<dyn CommandRunner>, remote: RemoteShell) -> Self {
        Self {
            device,
            runner,
            remote,
        }
    }

    /// Unmount if mounted, format, mount with `stream_count` streams and
    /// open the mount root to every user
    pub async fn prepare(&self, stream_count: u32) -> BenchResult<()> {
        if stream_count == 0 {
            return Err(BenchError::provision("stream count must be positive"));
        }
        info!(
            device = %self.device.path.display(),
            mount = %self.device.mount_point.display(),
            streams = stream_count,
            "Preparing volume"
        );

        self.unmount_if_mounted().await?;

        let device = self.device.path.to_string_lossy().into_owned();
        let streams = stream_count.to_string();
        let mkfs = CommandSpec::new(&self.device.mkfs_program).args(
            self.device
                .mkfs_args
                .iter()
                .map(|a| a.replace("{device}", &device).replace("{streams}", &streams)),
        );
        self.runner
            .run_checked(&mkfs)
            .await
            .map_err(|e| BenchError::provision(format!("format failed: {}", e)))?;

        let mount_point = self.device.mount_point.to_string_lossy().into_owned();
        self.runner
            .run_checked(&CommandSpec::new("mkdir").args(["-p", &mount_point]))
            .await
            .map_err(|e| BenchError::provision(e.to_string()))?;

        let mut mount = CommandSpec::new("mount");
        let options = self.device.mount_options.replace("{streams}", &streams);
        if !options.is_empty() {
            mount = mount.args(["-o", &options]);
        }
        mount = mount.args([device.as_str(), mount_point.as_str()]);
        self.runner
            .run_checked(&mount)
            .await
            .map_err(|e| BenchError::provision(format!("mount failed: {}", e)))?;

        self.runner
            .run_checked(&CommandSpec::new("chmod").args(["0777", &mount_point]))
            .await
            .map_err(|e| BenchError::provision(e.to_string()))?;

        info!(streams = stream_count, "Volume mounted");
        Ok(())
    }

    /// Reset device-level counters on the telemetry host
    pub async fn reset(&self) -> BestEffort<()> {
        self.remote
            .reset_counters()
            .await
            .warn_on_failure("device counter reset")
    }

    /// Force a device-counter snapshot into the remote log
    pub async fn snapshot(&self) -> BestEffort<()> {
        self.remote
            .snapshot_counters()
            .await
            .warn_on_failure("device counter snapshot")
    }

    /// Bytes used on the mounted filesystem
    pub async fn capacity_used(&self) -> BestEffort<u64> {
        let cmd = CommandSpec::new("df").args([
            "--output=used".to_string(),
            "-B1".to_string(),
            self.device.mount_point.to_string_lossy().into_owned(),
        ]);
        match self.runner.run(&cmd).await {
            Ok(out) if out.success() => parse_df_used(&out.stdout).into(),
            Ok(out) => BestEffort::failed(out.stderr.trim().to_string()),
            Err(e) => BestEffort::failed(e.to_string()),
        }
    }

    /// Unmount and drop caches; a clean environment is not an error
    pub async fn teardown(&self) -> BenchResult<()> {
        info!(mount = %self.device.mount_point.display(), "Tearing down volume");
        let result = self.unmount_if_mounted().await;

        if self.device.drop_caches {
            self.drop_caches().await;
        }
        result
    }

    async fn unmount_if_mounted(&self) -> BenchResult<()> {
        let mount_point = self.device.mount_point.to_string_lossy().into_owned();
        let out = self
            .runner
            .run(&CommandSpec::new("umount").arg(mount_point))
            .await?;
        if out.success() || is_not_mounted(&out.stderr) {
            return Ok(());
        }
        Err(BenchError::provision(format!(
            "umount {} failed: {}",
            self.device.mount_point.display(),
            out.stderr.trim()
        )))
    }

    async fn drop_caches(&self) {
        match self.runner.run(&CommandSpec::new("sync")).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(stderr = %out.stderr.trim(), "Failed to flush dirty pages"),
            Err(e) => warn!(error = %e, "Failed to flush dirty pages"),
        }
        let cmd = CommandSpec::new("sh").args(["-c", "echo 3 > /proc/sys/vm/drop_caches"]);
        match self.runner.run(&cmd).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(stderr = %out.stderr.trim(), "Failed to drop page cache"),
            Err(e) => warn!(error = %e, "Failed to drop page cache"),
        }
    }
}

/// Parse `df --output=used -B1` output
fn parse_df_used(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .skip(1)
        .find_map(|line| line.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_mounted_detection() {
        assert!(is_not_mounted("umount: /mnt/bench: not mounted."));
        assert!(is_not_mounted("umount: /mnt/x: no mount point specified."));
        assert!(is_not_mounted("umount: /mnt/x: No such file or directory"));
        assert!(!is_not_mounted("umount: /mnt/bench: target is busy."));
    }

    #[test]
    fn test_parse_df_used() {
        assert_eq!(parse_df_used("     Used\n123456789\n"), Some(123_456_789));
        assert_eq!(parse_df_used("Used\n"), None);
        assert_eq!(parse_df_used(""), None);
    }
}
