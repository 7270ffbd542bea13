// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use common::{test_config, wait_for, write_script, AnyPort, Release};
use hostvisor::manager::{BinarySource, RestartReason, ServiceManager, SupervisorState};
use hostvisor::upgrades::VersionStore;
use semver::Version;
use std::sync::Arc;
use std::time::Duration;

mod common;

#[tokio::test]
async fn second_supervisor_defers_to_the_lock_owner() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    write_script(&config.bundled_binary_path(), "exec sleep 30")?;

    let (first, first_handle) = ServiceManager::new(config.clone());
    let first_task = first.with_port_probe(Arc::new(AnyPort)).spawn();
    let (second, second_handle) = ServiceManager::new(config);
    let second_task = second.with_port_probe(Arc::new(AnyPort)).spawn();

    first_handle.start()?;
    wait_for(&first_handle, |s| s.state == SupervisorState::Running).await?;

    second_handle.start()?;
    let deferred = wait_for(&second_handle, |s| s.deferred).await?;
    assert_eq!(deferred.state, SupervisorState::Stopped);
    assert_eq!(deferred.launches, 0);
    assert!(deferred.pid.is_none());

    // once the owner lets go, the lock can be taken over
    first_handle.stop()?;
    wait_for(&first_handle, |s| s.state == SupervisorState::Stopped).await?;

    second_handle.start()?;
    let running = wait_for(&second_handle, |s| s.state == SupervisorState::Running).await?;
    assert!(!running.deferred);
    assert_eq!(running.launches, 1);

    first_handle.shutdown()?;
    second_handle.shutdown()?;
    first_task.await?;
    second_task.await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_restart_requests_collapse_into_one() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    write_script(&config.bundled_binary_path(), "exec sleep 30")?;

    let (manager, handle) = ServiceManager::new(config);
    let task = manager.with_port_probe(Arc::new(AnyPort)).spawn();

    handle.start()?;
    let first = wait_for(&handle, |s| s.state == SupervisorState::Running).await?;

    handle.request_restart(RestartReason::HealthCheckFailed)?;
    handle.request_restart(RestartReason::Operator)?;
    let restarted =
        wait_for(&handle, |s| s.state == SupervisorState::Running && s.launches == 2).await?;
    assert_ne!(restarted.pid, first.pid);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.status().launches, 2);

    handle.shutdown()?;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn exited_backend_is_relaunched() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let marker = dir.path().join("launched");
    // the first launch exits right away, every later one stays up
    write_script(
        &config.bundled_binary_path(),
        &format!(
            "if [ -f {marker} ]; then exec sleep 30; fi\ntouch {marker}\nexit 3",
            marker = marker.display()
        ),
    )?;

    let (manager, handle) = ServiceManager::new(config);
    let task = manager.with_port_probe(Arc::new(AnyPort)).spawn();

    handle.start()?;
    let relaunched =
        wait_for(&handle, |s| s.state == SupervisorState::Running && s.launches == 2).await?;
    assert_eq!(relaunched.binary_source, BinarySource::Bundled);
    assert_eq!(relaunched.consecutive_startup_failures, 1);

    handle.shutdown()?;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn crash_looping_update_is_rolled_back() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(dir.path());
    config.updater.enabled = true;
    config.crash_tracking.max_startup_failures = 3;
    write_script(&config.bundled_binary_path(), "exec sleep 30")?;

    // an already installed update that dies immediately
    let broken = Release::new("2.0.0", "exit 1")?;
    let store = VersionStore::new(config.versions_dir(), common::BINARY_NAME, 2);
    let archive = dir.path().join("2.0.0.tar.gz");
    std::fs::write(&archive, &broken.archive)?;
    store.install_from_archive(&broken.version, &archive)?;
    store.activate(&broken.version)?;

    let (manager, handle) = ServiceManager::new(config);
    let task = manager.with_port_probe(Arc::new(AnyPort)).spawn();
    handle.start()?;

    let rolled_back = wait_for(&handle, |s| {
        s.state == SupervisorState::Running && s.backend_version == Some(Version::new(1, 9, 0))
    })
    .await?;
    assert_eq!(
        rolled_back.binary_source,
        BinarySource::RolledBack {
            rejected: Version::new(2, 0, 0)
        }
    );
    // the counter resets once it triggers
    assert_eq!(rolled_back.consecutive_startup_failures, 0);
    assert_eq!(rolled_back.launches, 4);

    let marker = store.marker()?;
    assert_eq!(marker.active, None);
    assert!(marker.is_rejected(&Version::new(2, 0, 0)));

    handle.shutdown()?;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_does_not_wait_for_the_backend() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    // ignores SIGTERM; only SIGKILL gets rid of it
    write_script(
        &config.bundled_binary_path(),
        "trap '' TERM\nwhile true; do sleep 1; done",
    )?;

    let (manager, handle) = ServiceManager::new(config.clone());
    let task = manager.with_port_probe(Arc::new(AnyPort)).spawn();
    handle.start()?;
    wait_for(&handle, |s| s.state == SupervisorState::Running).await?;

    handle.shutdown()?;
    tokio::time::timeout(Duration::from_secs(2), task).await??;

    // the lock has been released as well
    let lock = hostvisor::lock::LockHandle::try_acquire(config.lock_file_path())?;
    assert!(lock.is_some());
    Ok(())
}
