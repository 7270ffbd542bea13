// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::manager::state::{RestartReason, StatusReport};
use semver::Version;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop,
    Shutdown,
    Restart {
        reason: RestartReason,

        /// Launch count observed when the restart was requested. Used for collapsing requests
        /// that refer to a process that has already been replaced.
        observed_launch: u64,
    },
    RestartForUpdate {
        version: Version,
        result: oneshot::Sender<bool>,
    },
}

/// Cheaply cloneable handle for controlling the [`ServiceManager`](crate::manager::ServiceManager).
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusReport>,
}

impl ServiceHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<StatusReport>,
    ) -> Self {
        ServiceHandle { commands, status }
    }

    fn send(&self, command: Command) -> Result<(), HostvisorError> {
        self.commands
            .send(command)
            .map_err(|_| HostvisorError::ServiceManagerUnavailable)
    }

    pub fn start(&self) -> Result<(), HostvisorError> {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> Result<(), HostvisorError> {
        self.send(Command::Stop)
    }

    /// Stops the backend and terminates the manager.
    pub fn shutdown(&self) -> Result<(), HostvisorError> {
        self.send(Command::Shutdown)
    }

    /// Requests a restart of the currently running backend. If it gets replaced before the request
    /// is processed (say, because it crashed in the meantime), the request is dropped.
    pub fn request_restart(&self, reason: RestartReason) -> Result<(), HostvisorError> {
        let observed_launch = self.status.borrow().launches;
        self.send(Command::Restart {
            reason,
            observed_launch,
        })
    }

    /// Asks the manager to restart the backend into the freshly installed `version`
    /// and waits for the outcome.
    pub async fn restart_for_update(&self, version: Version) -> Result<(), HostvisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RestartForUpdate {
            version: version.clone(),
            result: tx,
        })?;

        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(HostvisorError::UpdateRestartFailure { version }),
            Err(_) => Err(HostvisorError::ServiceManagerUnavailable),
        }
    }

    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.clone()
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_for_status<F>(&self, mut predicate: F) -> Result<StatusReport, HostvisorError>
    where
        F: FnMut(&StatusReport) -> bool,
    {
        let mut receiver = self.status.clone();
        let status = receiver
            .wait_for(|status| predicate(status))
            .await
            .map_err(|_| HostvisorError::ServiceManagerUnavailable)?;
        Ok(status.clone())
    }
}
