//! Volume provisioning and device telemetry against a recording runner

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeRunner, DF_USED};
use placement_bench::common::{BenchError, BestEffort};
use placement_bench::config::{DeviceConfig, RemoteConfig};
use placement_bench::host::CommandOutput;
use placement_bench::remote::RemoteShell;
use placement_bench::telemetry::{DeviceTelemetry, SampleLog, Sampler};
use placement_bench::volume::Volume;

fn device() -> DeviceConfig {
    DeviceConfig {
        path: PathBuf::from("/dev/nvme9n1"),
        mount_point: PathBuf::from("/mnt/bench"),
        ..DeviceConfig::default()
    }
}

fn remote() -> RemoteConfig {
    RemoteConfig {
        host: Some("fdp-host".to_string()),
        reset_command: Some("fdp-stats --reset".to_string()),
        snapshot_command: Some("fdp-stats --dump".to_string()),
        ..RemoteConfig::default()
    }
}

fn volume(runner: &Arc<FakeRunner>, remote_config: RemoteConfig) -> Volume {
    let shell = RemoteShell::new(runner.clone(), remote_config);
    Volume::new(device(), runner.clone(), shell)
}

#[tokio::test]
async fn test_prepare_runs_format_mount_sequence() {
    let runner = Arc::new(FakeRunner::default());
    runner.reply("umount", CommandOutput::failed(32, "umount: /mnt/bench: not mounted."));

    volume(&runner, RemoteConfig::default())
        .prepare(4)
        .await
        .unwrap();

    assert_eq!(
        runner.lines(),
        vec![
            "umount /mnt/bench",
            "mkfs.f2fs -f /dev/nvme9n1",
            "mkdir -p /mnt/bench",
            "mount -o fdp_log_n=4 /dev/nvme9n1 /mnt/bench",
            "chmod 0777 /mnt/bench",
        ]
    );
}

#[tokio::test]
async fn test_prepare_rejects_zero_streams() {
    let runner = Arc::new(FakeRunner::default());
    let err = volume(&runner, RemoteConfig::default())
        .prepare(0)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Provision(_)));
    assert!(runner.lines().is_empty());
}

#[tokio::test]
async fn test_mount_failure_is_a_provisioning_error() {
    let runner = Arc::new(FakeRunner::default());
    runner.reply("mount ", CommandOutput::failed(32, "wrong fs type, bad option"));

    let err = volume(&runner, RemoteConfig::default())
        .prepare(2)
        .await
        .unwrap_err();
    match err {
        BenchError::Provision(msg) => assert!(msg.contains("bad option")),
        other => panic!("expected Provision, got {:?}", other),
    }
    assert_eq!(runner.count("chmod"), 0);
}

#[tokio::test]
async fn test_teardown_is_idempotent_and_drops_caches() {
    let runner = Arc::new(FakeRunner::default());
    runner.reply("umount", CommandOutput::failed(32, "umount: /mnt/bench: not mounted."));
    let vol = volume(&runner, RemoteConfig::default());

    vol.teardown().await.unwrap();
    vol.teardown().await.unwrap();

    assert_eq!(runner.count("umount"), 2);
    assert_eq!(runner.count("sync"), 2);
    assert_eq!(runner.count("sh -c echo 3 > /proc/sys/vm/drop_caches"), 2);
}

#[tokio::test]
async fn test_sync_failure_does_not_stop_teardown() {
    let runner = Arc::new(FakeRunner::default());
    runner.reply("sync", CommandOutput::failed(1, "sync: I/O error"));

    volume(&runner, RemoteConfig::default())
        .teardown()
        .await
        .unwrap();

    assert_eq!(
        runner.lines(),
        vec![
            "umount /mnt/bench",
            "sync",
            "sh -c echo 3 > /proc/sys/vm/drop_caches",
        ]
    );
}

#[tokio::test]
async fn test_busy_unmount_fails_teardown() {
    let runner = Arc::new(FakeRunner::default());
    runner.reply("umount", CommandOutput::failed(32, "umount: /mnt/bench: target is busy."));

    let err = volume(&runner, RemoteConfig::default())
        .teardown()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("target is busy"));
}

#[tokio::test]
async fn test_counter_hooks_are_best_effort() {
    let runner = Arc::new(FakeRunner::default());
    let unconfigured = volume(&runner, RemoteConfig::default());
    assert_eq!(unconfigured.reset().await, BestEffort::Unavailable);
    assert!(runner.lines().is_empty());

    runner.reply("ssh", CommandOutput::failed(255, "ssh: connect to host fdp-host: No route"));
    let configured = volume(&runner, remote());
    assert!(matches!(configured.reset().await, BestEffort::Failed(_)));
    assert!(matches!(configured.snapshot().await, BestEffort::Failed(_)));
    assert_eq!(runner.count("ssh"), 2);
}

#[tokio::test]
async fn test_capacity_used_reads_df() {
    let runner = Arc::new(FakeRunner::default());
    let vol = volume(&runner, RemoteConfig::default());
    assert_eq!(vol.capacity_used().await, BestEffort::Value(DF_USED));
    assert_eq!(runner.lines(), vec!["df --output=used -B1 /mnt/bench"]);
}

#[tokio::test(start_paused = true)]
async fn test_sampler_records_device_telemetry() {
    let runner = Arc::new(FakeRunner::default());
    runner.reply(
        "ssh",
        CommandOutput::ok("12:00 fdp stats\n12:05 WAF: 1.80\n12:10 WAF: 1.92\n"),
    );
    let shell = RemoteShell::new(runner.clone(), remote());
    let vol = Arc::new(Volume::new(device(), runner.clone(), shell.clone()));
    let source = Arc::new(DeviceTelemetry::new(vol, shell));

    let sampler = Sampler::start(source, SampleLog::in_memory(), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(150)).await;
    let samples = sampler.stop().await;

    assert_eq!(samples.len(), 2);
    for sample in &samples {
        assert_eq!(sample.capacity_used, Some(DF_USED));
        assert_eq!(sample.write_amplification, Some(1.92));
    }
    assert!(samples[0].timestamp < samples[1].timestamp);
}
