// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::daemon::launch_config::BackendConfigFile;
use crate::error::HostvisorError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use semver::Version;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod launch_config;

/// A backend binary together with the resources directory it was shipped in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub executable: PathBuf,
    pub resources_dir: PathBuf,
    pub version: Version,
}

impl LaunchTarget {
    pub fn new(executable: PathBuf, resources_dir: PathBuf, version: Version) -> Self {
        LaunchTarget {
            executable,
            resources_dir,
            version,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// The best known binary, i.e. the active update-managed version, if any.
    pub preferred: LaunchTarget,

    /// The binary bundled with the host, used whenever the preferred one is missing.
    pub fallback: LaunchTarget,

    pub config_path: PathBuf,

    /// Backend configuration. The resources directory and backend version get filled in
    /// based on the target that ends up being launched.
    pub config: BackendConfigFile,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub process: BackendProcess,

    /// Set if the preferred binary did not exist and the bundled one got launched instead.
    pub used_fallback: bool,
}

/// Writes the backend config and spawns the backend. Performs blocking I/O, so it should be
/// called from a blocking-friendly context within the runtime.
pub fn launch(request: LaunchRequest) -> Result<LaunchOutcome, HostvisorError> {
    let LaunchRequest {
        preferred,
        fallback,
        config_path,
        mut config,
    } = request;

    let (target, used_fallback) = if preferred.executable.is_file() {
        (preferred, false)
    } else if fallback.executable.is_file() {
        let differs = preferred.executable != fallback.executable;
        if differs {
            warn!(
                "backend binary at {} does not exist. falling back to the bundled one",
                preferred.executable.display()
            );
        }
        (fallback, differs)
    } else {
        return Err(HostvisorError::BackendBinaryNotFound {
            path: preferred.executable,
            fallback: fallback.executable,
        });
    };

    config.directories.resources = target.resources_dir.clone();
    config.instance.backend_version = target.version.to_string();
    config.save(&config_path)?;

    let process = BackendProcess::spawn(&target, &config_path, &config)?;
    Ok(LaunchOutcome {
        process,
        used_fallback,
    })
}

#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    pid: u32,
    version: Version,
    executable: PathBuf,
    launched_at: Instant,
}

impl BackendProcess {
    fn spawn(
        target: &LaunchTarget,
        config_path: &Path,
        config: &BackendConfigFile,
    ) -> Result<Self, HostvisorError> {
        debug!("launching {}", target.executable.display());

        // the ports are passed explicitly so that the arguments, and not the file, are authoritative
        let child = Command::new(&target.executable)
            .arg("--config")
            .arg(config_path)
            .arg("--cdp-port")
            .arg(config.ports.cdp.to_string())
            .arg("--http-mcp-port")
            .arg(config.ports.http_mcp.to_string())
            .arg("--agent-port")
            .arg(config.ports.agent.to_string())
            .arg("--extension-port")
            .arg(config.ports.extension.to_string())
            .current_dir(&config.directories.execution)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostvisorError::BackendLaunchFailure {
                path: target.executable.clone(),
                source,
            })?;

        let Some(pid) = child.id() else {
            return Err(HostvisorError::BackendWithoutPid);
        };
        info!(
            "launched backend {} from {} with pid {pid}",
            target.version,
            target.executable.display()
        );

        Ok(BackendProcess {
            child,
            pid,
            version: target.version.clone(),
            executable: target.executable.clone(),
            launched_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn launched_at(&self) -> Instant {
        self.launched_at
    }

    /// Sends SIGKILL to the process. A process that is already gone is not an error.
    pub fn kill(&self) -> Result<(), HostvisorError> {
        debug!("sending SIGKILL to the backend (pid {})", self.pid);
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(HostvisorError::ProcessKillFailure {
                pid: self.pid,
                source,
            }),
        }
    }

    /// Kills the process and, if requested, waits until it has exited.
    /// Without waiting, the process gets reaped in the background once dropped.
    pub async fn terminate(mut self, wait: bool) -> Result<(), HostvisorError> {
        self.kill()?;
        if wait {
            if let Err(err) = self.child.wait().await {
                warn!("failed to wait for the backend (pid {}) to exit: {err}", self.pid);
            }
        }
        Ok(())
    }

    /// Zero-timeout check of the process exit status.
    pub fn try_exit_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Waits for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::launch_config::{Directories, Flags, Instance};
    use crate::ports::ServiceEndpoints;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn write_script(path: &Path, body: &str) -> anyhow::Result<()> {
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, format!("#!/bin/sh\n{body}\n"))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn request(root: &Path, preferred: &Path, fallback: &Path) -> LaunchRequest {
        LaunchRequest {
            preferred: LaunchTarget::new(
                preferred.to_path_buf(),
                root.join("versions/2.0.0"),
                Version::new(2, 0, 0),
            ),
            fallback: LaunchTarget::new(
                fallback.to_path_buf(),
                root.join("bundled"),
                Version::new(1, 9, 0),
            ),
            config_path: root.join("server_config.json"),
            config: BackendConfigFile {
                ports: ServiceEndpoints {
                    cdp: 9000,
                    http_mcp: 9100,
                    agent: 9200,
                    extension: 9300,
                },
                directories: Directories {
                    resources: PathBuf::new(),
                    execution: root.to_path_buf(),
                },
                flags: Flags {
                    allow_remote_in_mcp: false,
                },
                instance: Instance {
                    install_id: "install".to_string(),
                    host_version: "3.0.0".to_string(),
                    backend_version: String::new(),
                },
            },
        }
    }

    #[tokio::test]
    async fn backend_receives_ports_as_arguments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let preferred = root.join("versions/2.0.0/bin/backend");
        let args_file = root.join("args");
        write_script(&preferred, &format!("echo \"$@\" > {}", args_file.display()))?;

        let mut outcome = tokio::task::spawn_blocking({
            let request = request(root, &preferred, &root.join("bundled/bin/backend"));
            move || launch(request)
        })
        .await??;
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.process.version(), &Version::new(2, 0, 0));

        let status = outcome.process.wait().await?;
        assert!(status.success());

        let args = fs::read_to_string(&args_file)?;
        assert_eq!(
            args.trim(),
            format!(
                "--config {} --cdp-port 9000 --http-mcp-port 9100 --agent-port 9200 --extension-port 9300",
                root.join("server_config.json").display()
            )
        );

        let written: BackendConfigFile =
            serde_json::from_slice(&fs::read(root.join("server_config.json"))?)?;
        assert_eq!(written.instance.backend_version, "2.0.0");
        assert_eq!(written.directories.resources, root.join("versions/2.0.0"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_preferred_binary_falls_back_to_bundled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let fallback = root.join("bundled/bin/backend");
        write_script(&fallback, "exit 0")?;

        let request = request(root, &root.join("versions/2.0.0/bin/backend"), &fallback);
        let mut outcome = tokio::task::spawn_blocking(move || launch(request)).await??;
        assert!(outcome.used_fallback);
        assert_eq!(outcome.process.version(), &Version::new(1, 9, 0));
        outcome.process.wait().await?;
        Ok(())
    }

    #[tokio::test]
    async fn no_binary_at_all_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let request = request(root, &root.join("a/backend"), &root.join("b/backend"));
        let res = tokio::task::spawn_blocking(move || launch(request)).await?;
        assert!(matches!(
            res,
            Err(HostvisorError::BackendBinaryNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn termination_kills_the_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let preferred = root.join("bin/backend");
        write_script(&preferred, "exec sleep 30")?;

        let request = request(root, &preferred, &preferred);
        let mut outcome = tokio::task::spawn_blocking(move || launch(request)).await??;
        assert!(outcome.process.try_exit_status()?.is_none());

        tokio::time::timeout(Duration::from_secs(5), outcome.process.terminate(true)).await??;
        Ok(())
    }
}
