// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! The service manager owns the backend process, the cross-process lock and the service ports.
//!
//! It runs as a single task consuming commands from [`ServiceHandle`]s and events produced by its
//! own background work. Anything that might block (lock acquisition, port probing, file I/O,
//! spawning or reaping the process) happens on the blocking pool or in helper tasks that report
//! back through the event channel, so the manager loop itself never blocks.

use crate::config::Config;
use crate::daemon::{BackendProcess, LaunchTarget};
use crate::debug_server::DebugServer;
use crate::error::HostvisorError;
use crate::health::HealthChecker;
use crate::lock::LockHandle;
use crate::manager::handle::Command;
use crate::manager::launch::{
    LaunchJob, LaunchReport, LaunchedBackend, PortPlan, Preparation, PrepareJob,
};
use crate::manager::state::CrashCounter;
use crate::ports::{PortProbe, ServiceEndpoints, SystemPortProbe};
use crate::prefs::{PreferenceChange, Preferences, PreferencesWatcher};
use crate::upgrades::fetch::{Fetcher, HttpFetcher};
use crate::upgrades::updater::{Updater, UpdaterHandle};
use crate::upgrades::versions::VersionStore;
use semver::Version;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod handle;
pub(crate) mod launch;
pub mod state;

pub use handle::ServiceHandle;
pub use state::{BinarySource, RestartReason, StatusReport, SupervisorState};

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(100);

enum Event {
    Prepared {
        session: u64,
        result: Result<Preparation, HostvisorError>,
    },
    LaunchCompleted {
        session: u64,
        report: LaunchReport,
    },
    HealthCheckFailed {
        launch: u64,
    },
}

struct PendingUpdate {
    version: Version,
    result: oneshot::Sender<bool>,
}

fn timer(period: Duration) -> Interval {
    let period = period.max(MIN_TIMER_PERIOD);
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn wait_for_exit(process: Option<&mut BackendProcess>) -> io::Result<ExitStatus> {
    match process {
        Some(process) => process.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct ServiceManager {
    config: Config,
    prefs: Preferences,
    store: VersionStore,
    port_probe: Arc<dyn PortProbe>,
    fetcher: Option<Arc<dyn Fetcher>>,
    health: Option<HealthChecker>,

    commands: mpsc::UnboundedReceiver<Command>,
    weak_commands: mpsc::WeakUnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    status_tx: watch::Sender<StatusReport>,
    pref_changes: broadcast::Receiver<PreferenceChange>,
    _prefs_watcher: Option<PreferencesWatcher>,
    shutdown: CancellationToken,

    state: SupervisorState,

    // bumped on every start and stop. results of background work from an older session are stale
    session: u64,
    lock: Option<LockHandle>,
    endpoints: Option<ServiceEndpoints>,
    install_id: Option<String>,
    process: Option<BackendProcess>,
    running_version: Option<Version>,
    running_from_store: bool,
    launches: u64,
    deferred: bool,

    // set from the moment a (re)launch is initiated until its outcome is known
    restarting: bool,
    queued_restart: Option<RestartReason>,
    retry_at: Option<Instant>,

    crash_counter: CrashCounter,
    binary_source: BinarySource,
    rolled_back_from: Option<Version>,
    pending_update: Option<PendingUpdate>,
    activate_next: Option<Version>,
    invalidate_next: Option<Version>,

    debug_server: Option<DebugServer>,
    updater: Option<UpdaterHandle>,
    updater_unavailable: bool,

    health_timer: Interval,
    process_timer: Interval,
}

impl ServiceManager {
    /// Creates the manager together with its first handle.
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> (ServiceManager, ServiceHandle) {
        let prefs = Preferences::load_or_default(config.preferences_path());
        let prefs_watcher = match prefs.watch() {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!("preference changes made by other processes won't be observed: {err}");
                None
            }
        };
        let health = match HealthChecker::new(config.health.check_timeout) {
            Ok(checker) => Some(checker),
            Err(err) => {
                error!("health checks are unavailable: {err}");
                None
            }
        };

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status_rx) =
            watch::channel(StatusReport::initial(prefs.allow_remote_in_mcp()));
        let handle = ServiceHandle::new(commands_tx.clone(), status_rx);

        let store = VersionStore::new(
            config.versions_dir(),
            config.backend.binary_name.clone(),
            config.updater.versions_to_keep,
        );

        let manager = ServiceManager {
            pref_changes: prefs.subscribe(),
            _prefs_watcher: prefs_watcher,
            prefs,
            store,
            port_probe: Arc::new(SystemPortProbe),
            fetcher: None,
            health,
            commands,
            weak_commands: commands_tx.downgrade(),
            events_tx,
            events,
            status_tx,
            shutdown: CancellationToken::new(),
            state: SupervisorState::Stopped,
            session: 0,
            lock: None,
            endpoints: None,
            install_id: None,
            process: None,
            running_version: None,
            running_from_store: false,
            launches: 0,
            deferred: false,
            restarting: false,
            queued_restart: None,
            retry_at: None,
            crash_counter: CrashCounter::new(
                config.crash_tracking.startup_grace_period,
                config.crash_tracking.max_startup_failures,
            ),
            binary_source: BinarySource::Bundled,
            rolled_back_from: None,
            pending_update: None,
            activate_next: None,
            invalidate_next: None,
            debug_server: None,
            updater: None,
            updater_unavailable: false,
            health_timer: timer(config.health.check_interval),
            process_timer: timer(config.health.process_check_interval),
            config,
        };

        (manager, handle)
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.port_probe = probe;
        self
    }

    /// Stops the backend and terminates the manager once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    pub fn version_store(&self) -> &VersionStore {
        &self.store
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        debug!("starting the service manager ({})", self.config.hostvisor.id);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop();
                    break
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("all service handles are gone");
                        self.stop();
                        break
                    };
                    if !self.handle_command(command) {
                        break
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(event),
                exit = wait_for_exit(self.process.as_mut()) => self.handle_process_exit(exit),
                _ = self.health_timer.tick() => self.check_health(),
                _ = self.process_timer.tick() => self.poll_process(),
                change = self.pref_changes.recv() => self.handle_preference_change(change),
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_restart(RestartReason::LaunchRetry)
                }
            }
        }

        debug!("the service manager has finished");
    }

    // returns false once the manager should terminate
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Shutdown => {
                self.stop();
                return false;
            }
            Command::Restart {
                reason,
                observed_launch,
            } => self.handle_restart_request(reason, observed_launch),
            Command::RestartForUpdate { version, result } => {
                self.handle_update_restart(version, result)
            }
        }
        true
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Prepared { session, result } => self.handle_prepared(session, result),
            Event::LaunchCompleted { session, report } => {
                self.handle_launch_completed(session, report)
            }
            Event::HealthCheckFailed { launch } => {
                self.handle_restart_request(RestartReason::HealthCheckFailed, launch)
            }
        }
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            state: self.state,
            endpoints: self.endpoints,
            pid: self.process.as_ref().map(BackendProcess::pid),
            backend_version: self.running_version.clone(),
            binary_source: self.binary_source.clone(),
            consecutive_startup_failures: self.crash_counter.consecutive(),
            launches: self.launches,
            allow_remote_in_mcp: self.prefs.allow_remote_in_mcp(),
            deferred: self.deferred,
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status_report());
    }

    fn start(&mut self) {
        if self.state != SupervisorState::Stopped {
            debug!("the backend is already {}", self.state);
            return;
        }
        if self.config.backend.disabled {
            info!("the backend is disabled, not starting it");
            return;
        }

        info!("starting the backend");
        self.session += 1;
        self.state = SupervisorState::Starting;
        self.deferred = false;

        let job = PrepareJob {
            lock_path: self.config.lock_file_path(),
            execution_dir: self.config.execution_dir().to_path_buf(),
            probe: self.port_probe.clone(),
            defaults: self.config.ports.defaults(),
            overrides: self.config.ports.overrides,
            configured_install_id: self.config.host.install_id.clone(),
            prefs: self.prefs.clone(),
        };
        let session = self.session;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            };
            // the manager might have finished in the meantime
            let _ = events.send(Event::Prepared { session, result });
        });

        self.publish_status();
    }

    fn handle_prepared(&mut self, session: u64, result: Result<Preparation, HostvisorError>) {
        if session != self.session {
            debug!("ignoring a stale start");
            return;
        }

        match result {
            Err(err) => {
                error!("failed to start the backend: {err}");
                self.state = SupervisorState::Stopped;
                self.queued_restart = None;
            }
            Ok(Preparation::Deferred) => {
                info!("another supervisor already owns the backend. deferring to it");
                self.state = SupervisorState::Stopped;
                self.queued_restart = None;
                self.deferred = true;
            }
            Ok(Preparation::Ready {
                lock,
                endpoints,
                install_id,
            }) => {
                info!("using service ports {endpoints}");
                self.lock = Some(lock);
                self.endpoints = Some(endpoints);
                self.install_id = Some(install_id);
                self.debug_server = Some(DebugServer::start(
                    endpoints.cdp,
                    self.config.host.version.clone(),
                    self.status_tx.subscribe(),
                ));

                self.restarting = true;
                let job = self.launch_job(PortPlan::Keep(endpoints));
                self.spawn_launch(None, job);
            }
        }
        self.publish_status();
    }

    fn launch_job(&mut self, ports: PortPlan) -> LaunchJob {
        let store = self
            .config
            .updater
            .enabled
            .then(|| self.store.clone());

        LaunchJob {
            store,
            activate: self.activate_next.take(),
            invalidate: self.invalidate_next.take(),
            probe: self.port_probe.clone(),
            ports,
            overrides: self.config.ports.overrides,
            prefs: self.prefs.clone(),
            bundled: LaunchTarget::new(
                self.config.bundled_binary_path(),
                self.config.backend.bundled_resources_dir.clone(),
                self.config.backend.bundled_version.clone(),
            ),
            config_path: self.config.backend_config_path(),
            execution_dir: self.config.execution_dir().to_path_buf(),
            install_id: self.install_id.clone().unwrap_or_default(),
            host_version: self.config.host.version.clone(),
        }
    }

    // terminates the previous process (if any) and waits for it to exit, then runs the launch
    fn spawn_launch(&self, previous: Option<BackendProcess>, job: LaunchJob) {
        let session = self.session;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(err) = previous.terminate(true).await {
                    warn!("failed to terminate the previous backend: {err}")
                }
            }
            let report = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(report) => report,
                Err(err) => LaunchReport::failed(err.into()),
            };
            if let Err(unsent) = events.send(Event::LaunchCompleted { session, report }) {
                // nobody is going to own this process
                if let Event::LaunchCompleted { report, .. } = unsent.0 {
                    if let Ok(launched) = report.outcome {
                        let _ = launched.process.kill();
                    }
                }
            }
        });
    }

    fn handle_launch_completed(&mut self, session: u64, report: LaunchReport) {
        if session != self.session {
            if let Ok(launched) = report.outcome {
                debug!("the supervisor was stopped during the launch, killing the new backend");
                if let Err(err) = launched.process.kill() {
                    warn!("{err}")
                }
            }
            return;
        }

        self.restarting = false;
        if let Some(endpoints) = report.endpoints {
            self.endpoints = Some(endpoints);
        }
        if let Some(rejected) = report.invalidated.last() {
            self.rolled_back_from = Some(rejected.clone());
        }

        match report.outcome {
            Ok(launched) => self.on_launched(launched),
            Err(err) => {
                error!("failed to launch the backend: {err}");
                self.state = SupervisorState::Starting;

                if let Some(pending) = self.pending_update.take() {
                    let _ = pending.result.send(false);
                }
                // the update-managed binary can't be launched, so don't try it again
                if let Some(attempted) = report.attempted {
                    self.invalidate_next = Some(attempted);
                }

                let delay = self.config.crash_tracking.launch_retry_delay;
                info!(
                    "retrying the launch in {}",
                    humantime::format_duration(delay)
                );
                self.retry_at = Some(Instant::now() + delay);
            }
        }
        self.publish_status();
    }

    fn on_launched(&mut self, launched: LaunchedBackend) {
        let LaunchedBackend {
            process,
            from_store,
        } = launched;
        let version = process.version().clone();

        self.launches += 1;
        self.state = SupervisorState::Running;
        self.running_from_store = from_store;
        self.running_version = Some(version.clone());
        self.health_timer.reset();
        self.process_timer.reset();

        if let Some(pending) = self.pending_update.take() {
            let succeeded = from_store && version == pending.version;
            if succeeded {
                self.rolled_back_from = None;
            } else {
                warn!(
                    "restarted into {version} rather than the requested {}",
                    pending.version
                );
            }
            let _ = pending.result.send(succeeded);
        }

        self.binary_source = match (&self.rolled_back_from, from_store) {
            (Some(rejected), _) => BinarySource::RolledBack {
                rejected: rejected.clone(),
            },
            (None, true) => BinarySource::Updated,
            (None, false) => BinarySource::Bundled,
        };
        self.process = Some(process);

        // the updater relies on the published state to know what is running
        self.publish_status();
        self.ensure_updater();

        if let Some(reason) = self.queued_restart.take() {
            if reason == RestartReason::RestartRequested && !self.prefs.restart_requested() {
                debug!("the restart request has been honoured by the launch itself");
            } else {
                self.begin_restart(reason)
            }
        }
    }

    fn ensure_updater(&mut self) {
        if self.updater.is_some() || self.updater_unavailable || !self.config.updater.enabled {
            return;
        }
        let Some(commands) = self.weak_commands.upgrade() else {
            return;
        };
        let handle = ServiceHandle::new(commands, self.status_tx.subscribe());

        let fetcher = match &self.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => match HttpFetcher::new() {
                Ok(fetcher) => Arc::new(fetcher),
                Err(err) => {
                    error!("the updater is unavailable: {err}");
                    self.updater_unavailable = true;
                    return;
                }
            },
        };

        match Updater::new(&self.config, self.store.clone(), fetcher, handle) {
            Ok(updater) => self.updater = Some(UpdaterHandle::spawn(updater)),
            Err(err) => {
                error!("the updater is unavailable: {err}");
                self.updater_unavailable = true;
            }
        }
    }

    fn begin_restart(&mut self, reason: RestartReason) {
        if self.restarting {
            debug!("a restart is already in progress, ignoring: {reason}");
            return;
        }
        let Some(endpoints) = self.endpoints else {
            debug!("the backend was never started, ignoring: {reason}");
            return;
        };

        info!("restarting the backend: {reason}");
        self.restarting = true;
        self.retry_at = None;
        self.state = if self.pending_update.is_some() {
            SupervisorState::Updating
        } else {
            SupervisorState::Restarting
        };

        let previous = self.process.take();
        let job = self.launch_job(PortPlan::Revalidate(endpoints));
        self.spawn_launch(previous, job);
        self.publish_status();
    }

    fn handle_restart_request(&mut self, reason: RestartReason, observed_launch: u64) {
        if observed_launch != self.launches {
            debug!("the backend has been relaunched since, ignoring: {reason}");
            return;
        }
        if self.state != SupervisorState::Running {
            debug!("the backend is {}, ignoring: {reason}", self.state);
            return;
        }
        self.begin_restart(reason)
    }

    fn handle_update_restart(&mut self, version: Version, result: oneshot::Sender<bool>) {
        if self.restarting || self.pending_update.is_some() || self.state != SupervisorState::Running
        {
            warn!("can't restart into {version} while the backend is {}", self.state);
            let _ = result.send(false);
            return;
        }

        info!("restarting the backend into {version}");
        self.activate_next = Some(version.clone());
        self.pending_update = Some(PendingUpdate { version, result });
        self.begin_restart(RestartReason::Update)
    }

    fn handle_process_exit(&mut self, exit: io::Result<ExitStatus>) {
        let Some(process) = self.process.take() else {
            return;
        };
        let uptime = process.launched_at().elapsed();
        match exit {
            Ok(status) => warn!(
                "the backend (pid {}) has exited with {status} after {}",
                process.pid(),
                humantime::format_duration(Duration::from_millis(uptime.as_millis() as u64))
            ),
            Err(err) => error!(
                "failed to wait for the backend (pid {}): {err}",
                process.pid()
            ),
        }

        if self.crash_counter.record_exit(uptime) {
            warn!("the backend keeps crashing right after being launched");
            if self.running_from_store {
                self.invalidate_next = Some(process.version().clone());
            } else {
                // nothing to roll back to, so at least don't spin
                let delay = self.config.crash_tracking.launch_retry_delay;
                self.state = SupervisorState::Starting;
                self.retry_at = Some(Instant::now() + delay);
                self.publish_status();
                return;
            }
        }

        self.begin_restart(RestartReason::ProcessExited);
        self.publish_status();
    }

    fn poll_process(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        match process.try_exit_status() {
            Ok(Some(status)) => {
                debug!("the periodic process check caught an exit");
                self.handle_process_exit(Ok(status))
            }
            Ok(None) => {}
            Err(err) => warn!("failed to check the backend process status: {err}"),
        }
    }

    fn check_health(&mut self) {
        if self.state != SupervisorState::Running || self.restarting {
            return;
        }
        let (Some(endpoints), Some(checker)) = (self.endpoints, self.health.clone()) else {
            return;
        };

        let launch = self.launches;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if !checker.probe(endpoints.http_mcp).await.is_healthy() {
                let _ = events.send(Event::HealthCheckFailed { launch });
            }
        });
    }

    fn handle_preference_change(&mut self, change: Result<PreferenceChange, RecvError>) {
        let reason = match change {
            Ok(PreferenceChange::AllowRemoteInMcp(allow)) => {
                info!("remote connections allowed: {allow}");
                self.publish_status();
                RestartReason::PreferenceChanged
            }
            Ok(PreferenceChange::RestartRequested(true)) => RestartReason::RestartRequested,
            Ok(other) => {
                debug!("preference change: {other:?}");
                return;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("missed {skipped} preference changes");
                return;
            }
            Err(RecvError::Closed) => return,
        };

        match self.state {
            SupervisorState::Running => self.begin_restart(reason),
            SupervisorState::Starting
            | SupervisorState::Restarting
            | SupervisorState::Updating => {
                // the launch in progress might have used the old values
                self.queued_restart = Some(reason)
            }
            SupervisorState::Stopped => {}
        }
    }

    /// Idempotent. Never waits for the backend to exit.
    fn stop(&mut self) {
        if self.state == SupervisorState::Stopped && self.lock.is_none() {
            return;
        }
        info!("stopping the backend");

        self.session += 1;
        self.restarting = false;
        self.queued_restart = None;
        self.retry_at = None;
        self.activate_next = None;

        if let Some(updater) = self.updater.take() {
            updater.stop()
        }
        if let Some(server) = self.debug_server.take() {
            server.stop()
        }
        if let Some(process) = self.process.take() {
            if let Err(err) = process.kill() {
                warn!("{err}")
            }
        }
        if let Some(pending) = self.pending_update.take() {
            let _ = pending.result.send(false);
        }

        self.lock = None;
        self.endpoints = None;
        self.crash_counter.reset();
        self.state = SupervisorState::Stopped;
        self.publish_status();
    }
}
