//! Process supervision state machine.
//!
//! One loop task per instance owns the OS process handle and every
//! `WatchdogState` transition. Operators and callback handlers never
//! touch the state directly; they enqueue intents over a channel and
//! read status from an atomically published snapshot. Deferred build
//! swaps and engine promotions are applied only at the two safe
//! points: right before a launch, or at a self-reported reboot
//! boundary.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use warden_topic::query::host_verbs;
use warden_topic::{TopicClient, TopicError, TopicQuery};
use warden_types::{CompileArtifact, NotifyCategory, ReattachInfo, StatusSnapshot, WatchdogState};

use crate::engine::{EngineError, EngineVersionStager};
use crate::interop::{HOST_INTEROP_VERSION, InteropEvent, InteropSession};
use crate::logbuf::LogSink;
use crate::metrics::{self, ResourceSample, SharedSample};
use crate::notify::ChatNotifier;
use crate::reattach::{ReattachStore, pid_alive};
use crate::staging::{StagingError, StagingSwapper};
use crate::support::{
    bad_start_threshold, crash_backoff, format_error_chain, generate_comms_key,
    graceful_term_grace, hang_timeout, health_ping_interval, startup_timeout,
};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("no compiled build is staged")]
    NoArtifactStaged,
    #[error("engine executable missing: {0}")]
    ExecutableMissing(PathBuf),
    #[error("port {0} is already bound")]
    PortUnavailable(u16),
    #[error("server did not become ready within the startup timeout")]
    StartupTimeout,
    #[error("server exited during startup (code {0:?})")]
    EarlyExit(Option<i32>),
    #[error("supervisor loop has shut down")]
    SupervisorGone,
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("failed to spawn server process")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Port the hosted server listens on; owned exclusively by the
    /// current process instance while Starting/Online.
    pub game_port: u16,
    /// Loopback port the interop dispatcher listens on, handed to the
    /// server through its environment.
    pub interop_port: u16,
    /// Persist launch state so a service restart reattaches instead of
    /// killing the server.
    pub reattach_enabled: bool,
}

enum Intent {
    Start(oneshot::Sender<Result<(), SupervisorError>>),
    Stop(oneshot::Sender<Result<(), SupervisorError>>),
    Restart(oneshot::Sender<Result<(), SupervisorError>>),
    GracefulStop(oneshot::Sender<Result<(), SupervisorError>>),
    GracefulRestart(oneshot::Sender<Result<(), SupervisorError>>),
    Deposit(
        CompileArtifact,
        oneshot::Sender<Result<(), SupervisorError>>,
    ),
    WorldCommand(String, oneshot::Sender<Result<String, SupervisorError>>),
    Detach(oneshot::Sender<Result<(), SupervisorError>>),
    Shutdown(oneshot::Sender<()>),
    HangDetected { pid: u32 },
}

/// Everything the loop mutates, kept separate from the I/O context so
/// transition logic stays a pure function of (state, exit, flags).
#[derive(Debug, Clone, PartialEq)]
struct SupervisorState {
    state: WatchdogState,
    active_artifact: Option<CompileArtifact>,
    staged_artifact: Option<CompileArtifact>,
    soft_shutdown_requested: bool,
    soft_restart_requested: bool,
    /// The process announced (kill-me) or reported (world-rebooted) a
    /// reboot boundary; its next exit is intentional.
    reboot_seen: bool,
    /// An operator restart is mid-flight; an exit observed now belongs
    /// to it and must not schedule a second relaunch.
    restart_in_flight: bool,
    retries: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum ExitPlan {
    /// Requested shutdown; settle Offline without the crash path.
    StopClean,
    /// A restart already in progress owns this exit.
    Defer,
    Relaunch { delay: Option<Duration> },
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            state: WatchdogState::Offline,
            active_artifact: None,
            staged_artifact: None,
            soft_shutdown_requested: false,
            soft_restart_requested: false,
            reboot_seen: false,
            restart_in_flight: false,
            retries: 0,
        }
    }

    /// Record a freshly compiled artifact. Last writer wins: an
    /// undeployed staged artifact is discarded, only the newest build
    /// matters. Returns true when the caller should swap immediately
    /// (process offline, live slot not being read).
    fn deposit(&mut self, artifact: CompileArtifact) -> bool {
        self.staged_artifact = Some(artifact);
        self.state == WatchdogState::Offline
    }

    fn on_exit(&mut self, uptime: Duration, bad_start: Duration) -> ExitPlan {
        if self.restart_in_flight {
            self.state = WatchdogState::DelayedRestart;
            return ExitPlan::Defer;
        }
        if self.soft_shutdown_requested {
            self.soft_shutdown_requested = false;
            self.soft_restart_requested = false;
            self.reboot_seen = false;
            self.retries = 0;
            self.state = WatchdogState::Offline;
            return ExitPlan::StopClean;
        }
        if self.reboot_seen || self.soft_restart_requested {
            self.reboot_seen = false;
            self.soft_restart_requested = false;
            self.retries = 0;
            self.state = WatchdogState::HardRebooting;
            return ExitPlan::Relaunch { delay: None };
        }

        // Crash. A short-lived process is backing off exponentially; a
        // long-lived one relaunches immediately with the counter reset.
        self.state = WatchdogState::HardRebooting;
        if uptime < bad_start {
            // Delay comes from the count before this crash, so the
            // first bad start waits one second.
            let delay = crash_backoff(self.retries);
            self.retries += 1;
            ExitPlan::Relaunch { delay: Some(delay) }
        } else {
            self.retries = 0;
            ExitPlan::Relaunch { delay: None }
        }
    }
}

enum ServerHandle {
    Spawned(Child),
    Reattached,
}

struct RunningServer {
    handle: ServerHandle,
    pid: u32,
    port: u16,
    comms_key: String,
    interop_version: Option<String>,
    launched_at: Instant,
    pinger: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Resolves when the process is gone. Spawned children are reaped;
    /// reattached processes are polled since we never owned the handle.
    async fn wait_exit(&mut self) -> Option<i32> {
        match &mut self.handle {
            ServerHandle::Spawned(child) => child.wait().await.ok().and_then(|s| s.code()),
            ServerHandle::Reattached => {
                loop {
                    if !pid_alive(self.pid) {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn signal_term(&mut self) {
        #[cfg(unix)]
        signal_group(self.pid, libc::SIGTERM);
        #[cfg(not(unix))]
        if let ServerHandle::Spawned(child) = &mut self.handle {
            let _ = child.start_kill();
        }
    }

    fn signal_kill(&mut self) {
        #[cfg(unix)]
        signal_group(self.pid, libc::SIGKILL);
        #[cfg(not(unix))]
        if let ServerHandle::Spawned(child) = &mut self.handle {
            let _ = child.start_kill();
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(pinger) = self.pinger.take() {
            pinger.abort();
        }
    }
}

/// Handle to the loop task. Cloneable channels would also work, but a
/// single owner keeps shutdown ordering obvious.
pub struct Watchdog {
    intents: mpsc::UnboundedSender<Intent>,
    status: watch::Receiver<StatusSnapshot>,
    logs: LogSink,
    sample: SharedSample,
    join: JoinHandle<()>,
}

impl Watchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        cfg: WatchdogConfig,
        staging: Arc<StagingSwapper>,
        engine: Arc<EngineVersionStager>,
        reattach: Arc<dyn ReattachStore>,
        notifier: Arc<dyn ChatNotifier>,
        session_tx: watch::Sender<InteropSession>,
        events: mpsc::UnboundedReceiver<InteropEvent>,
        logs: LogSink,
        sample: SharedSample,
    ) -> Self {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::offline());

        let looped = SupervisorLoop {
            cfg,
            staging,
            engine,
            reattach,
            notifier,
            topic: TopicClient::default(),
            intents_tx: intents_tx.clone(),
            intents: intents_rx,
            events,
            status_tx,
            session_tx,
            logs: logs.clone(),
            sample: sample.clone(),
            state: SupervisorState::new(),
            running: None,
            relaunch_at: None,
            shutting_down: false,
        };
        let join = tokio::spawn(looped.run());

        Self {
            intents: intents_tx,
            status: status_rx,
            logs,
            sample,
            join,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Server output lines after `cursor`, at most `limit`, plus the
    /// cursor to poll from next. Cursor 0 tails the most recent lines.
    pub async fn tail_logs(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.logs.buffer().lock().await.tail_after(cursor, limit)
    }

    /// Latest cpu/memory sample, `None` while no server is Online.
    pub fn resource_sample(&self) -> Option<ResourceSample> {
        *self.sample.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn roundtrip<T>(
        &self,
        intent: Intent,
        rx: oneshot::Receiver<Result<T, SupervisorError>>,
    ) -> Result<T, SupervisorError> {
        self.intents
            .send(intent)
            .map_err(|_| SupervisorError::SupervisorGone)?;
        rx.await.map_err(|_| SupervisorError::SupervisorGone)?
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::Start(tx), rx).await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::Stop(tx), rx).await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::Restart(tx), rx).await
    }

    pub async fn request_graceful_stop(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::GracefulStop(tx), rx).await
    }

    pub async fn request_graceful_restart(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::GracefulRestart(tx), rx).await
    }

    pub async fn deposit_artifact(&self, artifact: CompileArtifact) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::Deposit(artifact, tx), rx).await
    }

    pub async fn send_world_command(&self, command: &str) -> Result<String, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::WorldCommand(command.to_string(), tx), rx)
            .await
    }

    /// Persist reattach state and leave the process running. The loop
    /// exits afterward; used on service shutdown when reattach is on.
    pub async fn detach(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(Intent::Detach(tx), rx).await
    }

    /// Stop the process (if any) and end the loop.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.intents.send(Intent::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

struct SupervisorLoop {
    cfg: WatchdogConfig,
    staging: Arc<StagingSwapper>,
    engine: Arc<EngineVersionStager>,
    reattach: Arc<dyn ReattachStore>,
    notifier: Arc<dyn ChatNotifier>,
    topic: TopicClient,
    intents_tx: mpsc::UnboundedSender<Intent>,
    intents: mpsc::UnboundedReceiver<Intent>,
    events: mpsc::UnboundedReceiver<InteropEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    session_tx: watch::Sender<InteropSession>,
    logs: LogSink,
    sample: SharedSample,
    state: SupervisorState,
    running: Option<RunningServer>,
    relaunch_at: Option<Instant>,
    shutting_down: bool,
}

async fn wait_exit(running: &mut Option<RunningServer>) -> Option<i32> {
    match running {
        Some(server) => server.wait_exit().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SupervisorLoop {
    async fn run(mut self) {
        self.publish();
        if self.cfg.reattach_enabled {
            self.try_reattach().await;
        }

        let mut events_open = true;
        loop {
            tokio::select! {
                intent = self.intents.recv() => {
                    match intent {
                        Some(intent) => self.handle_intent(intent).await,
                        None => break,
                    }
                    if self.shutting_down {
                        break;
                    }
                }
                event = self.events.recv(), if events_open => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => events_open = false,
                    }
                }
                code = wait_exit(&mut self.running) => {
                    self.handle_exit(code).await;
                }
                _ = wait_until(self.relaunch_at) => {
                    self.relaunch_at = None;
                    if let Err(e) = self.do_start().await {
                        self.fail_offline(e);
                    }
                }
            }
        }
        tracing::info!("supervisor loop ended");
    }

    fn publish(&self) {
        self.status_tx.send_replace(StatusSnapshot {
            state: self.state.state,
            current_port: self.running.as_ref().map(|r| r.port),
            pid: self.running.as_ref().map(|r| r.pid),
            active_artifact: self.state.active_artifact.clone(),
            staged_artifact: self.state.staged_artifact.clone(),
            soft_shutdown_requested: self.state.soft_shutdown_requested,
            soft_restart_requested: self.state.soft_restart_requested,
        });
    }

    fn clear_session(&self) {
        self.session_tx.send_replace(InteropSession::default());
    }

    fn save_reattach(&self) {
        if !self.cfg.reattach_enabled {
            return;
        }
        let Some(running) = &self.running else {
            return;
        };
        let info = ReattachInfo {
            pid: running.pid,
            port: running.port,
            comms_key: running.comms_key.clone(),
            interop_version: running.interop_version.clone(),
            reboot_expected: self.state.reboot_seen || self.state.soft_restart_requested,
            active_artifact: self.state.active_artifact.clone(),
        };
        if let Err(e) = self.reattach.save(&info) {
            tracing::warn!(error = %format_error_chain(&e), "failed to persist reattach state");
        }
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Start(reply) => {
                let result = if self.running.is_some() {
                    Err(SupervisorError::AlreadyRunning)
                } else {
                    self.relaunch_at = None;
                    self.do_start().await
                };
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "start failed");
                }
                let _ = reply.send(result);
            }
            Intent::Stop(reply) => {
                let result = if self.running.is_none() && self.relaunch_at.is_none() {
                    Err(SupervisorError::NotRunning)
                } else {
                    self.relaunch_at = None;
                    self.stop_running(true).await;
                    self.settle_offline();
                    if let Err(e) = self.reattach.clear() {
                        tracing::warn!(error = %format_error_chain(&e), "failed to clear reattach state");
                    }
                    self.notifier.notify("server stopped", NotifyCategory::Lifecycle);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Intent::Restart(reply) => {
                self.relaunch_at = None;
                self.state.restart_in_flight = true;
                if self.running.is_some() {
                    self.stop_running(true).await;
                }
                let result = self.do_start().await;
                self.state.restart_in_flight = false;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "restart failed");
                }
                let _ = reply.send(result);
            }
            Intent::GracefulStop(reply) => {
                let result = if self.state.state == WatchdogState::Online {
                    self.state.soft_shutdown_requested = true;
                    self.save_reattach();
                    self.publish();
                    Ok(())
                } else {
                    Err(SupervisorError::NotRunning)
                };
                let _ = reply.send(result);
            }
            Intent::GracefulRestart(reply) => {
                let result = if self.state.state == WatchdogState::Online {
                    self.state.soft_restart_requested = true;
                    self.save_reattach();
                    self.publish();
                    Ok(())
                } else {
                    Err(SupervisorError::NotRunning)
                };
                let _ = reply.send(result);
            }
            Intent::Deposit(artifact, reply) => {
                let revision = artifact.revision.clone();
                let swap_now = self.state.deposit(artifact);
                self.notifier
                    .notify(&format!("build {revision} staged"), NotifyCategory::Deploy);
                let result = if swap_now {
                    self.apply_staged().await
                } else {
                    Ok(())
                };
                self.publish();
                let _ = reply.send(result);
            }
            Intent::WorldCommand(command, reply) => {
                match &self.running {
                    Some(running) if self.state.state == WatchdogState::Online => {
                        // Issued from a short-lived task so a hung
                        // socket cannot wedge the loop.
                        let client = self.topic.clone();
                        let port = running.port;
                        let command = TopicQuery::append_comms_key(&command, &running.comms_key);
                        tokio::spawn(async move {
                            let result = client
                                .send_with_retry(port, &command)
                                .await
                                .map_err(SupervisorError::from);
                            let _ = reply.send(result);
                        });
                    }
                    _ => {
                        let _ = reply.send(Err(SupervisorError::NotRunning));
                    }
                }
            }
            Intent::Detach(reply) => {
                if let Some(running) = &mut self.running {
                    running.abort_tasks();
                }
                self.save_reattach();
                self.running = None;
                self.shutting_down = true;
                tracing::info!("detached from server process");
                let _ = reply.send(Ok(()));
            }
            Intent::Shutdown(reply) => {
                if self.running.is_some() {
                    self.stop_running(true).await;
                    self.settle_offline();
                }
                self.shutting_down = true;
                let _ = reply.send(());
            }
            Intent::HangDetected { pid } => {
                let hung = matches!(&self.running, Some(r) if r.pid == pid)
                    && self.state.state == WatchdogState::Online;
                if hung {
                    tracing::error!(pid, "server stopped answering health pings, killing it");
                    self.notifier
                        .notify("server hung, forcing restart", NotifyCategory::Lifecycle);
                    if let Some(running) = &mut self.running {
                        running.signal_kill();
                    }
                    // The exit is observed by the monitor arm and goes
                    // through the normal crash path.
                }
            }
        }
    }

    async fn handle_event(&mut self, event: InteropEvent) {
        match event {
            InteropEvent::KillRequest => {
                if let Some(running) = &mut self.running {
                    tracing::info!(pid = running.pid, "server requested its own termination");
                    self.state.reboot_seen = true;
                    running.signal_term();
                }
            }
            InteropEvent::WorldRebooted => {
                self.on_reboot_boundary().await;
            }
            InteropEvent::ApiVersion {
                version,
                request_cap,
                response_cap,
            } => {
                tracing::info!(version, "interop version announced");
                self.session_tx.send_modify(|session| {
                    session.interop_version = Some(version.clone());
                    if let Some(cap) = request_cap {
                        session.request_cap = session.request_cap.min(cap);
                    }
                    if let Some(cap) = response_cap {
                        session.response_cap = session.response_cap.min(cap);
                    }
                });
                if let Some(running) = &mut self.running {
                    running.interop_version = Some(version);
                }
                self.save_reattach();
            }
        }
    }

    /// The process reported a natural reboot; the live slot is not
    /// being read right now, so deferred work is safe to apply.
    async fn on_reboot_boundary(&mut self) {
        if self.state.state != WatchdogState::Online {
            return;
        }
        if self.state.soft_shutdown_requested {
            tracing::info!("reboot boundary reached, honoring graceful stop");
            self.stop_running(true).await;
            self.settle_offline();
            self.notifier
                .notify("server shut down at reboot boundary", NotifyCategory::Lifecycle);
            return;
        }

        let engine_pending = matches!(self.engine.staged_version().await, Ok(Some(_)));
        let wants_restart = self.state.soft_restart_requested
            || self.state.staged_artifact.is_some()
            || engine_pending;
        if !wants_restart {
            return;
        }

        tracing::info!("reboot boundary reached, applying deferred deployment");
        self.state.soft_restart_requested = false;
        self.state.restart_in_flight = true;
        self.stop_running(true).await;
        if let Err(e) = self.do_start().await {
            self.fail_offline(e);
        }
        self.state.restart_in_flight = false;
    }

    async fn handle_exit(&mut self, code: Option<i32>) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.abort_tasks();
        self.clear_session();
        self.sample.lock().unwrap_or_else(|p| p.into_inner()).take();
        let uptime = running.launched_at.elapsed();
        tracing::info!(pid = running.pid, ?code, uptime_secs = uptime.as_secs(), "server exited");

        match self.state.on_exit(uptime, bad_start_threshold()) {
            ExitPlan::StopClean => {
                if let Err(e) = self.reattach.clear() {
                    tracing::warn!(error = %format_error_chain(&e), "failed to clear reattach state");
                }
                self.notifier
                    .notify("server shut down", NotifyCategory::Lifecycle);
                self.publish();
            }
            ExitPlan::Defer => {
                tracing::debug!("exit belongs to an in-flight restart");
                self.publish();
            }
            ExitPlan::Relaunch { delay: None } => {
                self.publish();
                if let Err(e) = self.do_start().await {
                    self.fail_offline(e);
                }
            }
            ExitPlan::Relaunch { delay: Some(delay) } => {
                tracing::warn!(
                    retries = self.state.retries,
                    delay_secs = delay.as_secs(),
                    "server crashed shortly after launch, backing off"
                );
                self.notifier.notify(
                    &format!("server crashed, relaunching in {}s", delay.as_secs()),
                    NotifyCategory::Lifecycle,
                );
                self.relaunch_at = Some(Instant::now() + delay);
                self.publish();
            }
        }
    }

    fn settle_offline(&mut self) {
        self.state.state = WatchdogState::Offline;
        self.state.soft_shutdown_requested = false;
        self.state.soft_restart_requested = false;
        self.state.reboot_seen = false;
        self.state.retries = 0;
        self.clear_session();
        self.publish();
    }

    fn fail_offline(&mut self, error: SupervisorError) {
        tracing::error!(error = %error, "relaunch failed, going offline");
        self.notifier.notify(
            &format!("server relaunch failed: {error}"),
            NotifyCategory::Lifecycle,
        );
        self.settle_offline();
    }

    /// Promote any deferred build swap. Fails closed: on error the
    /// artifact stays staged and the previously live slot stays live.
    async fn apply_staged(&mut self) -> Result<(), SupervisorError> {
        let Some(artifact) = self.state.staged_artifact.take() else {
            return Ok(());
        };
        if let Err(e) = self.staging.swap(artifact.slot).await {
            self.state.staged_artifact = Some(artifact);
            return Err(e.into());
        }
        self.notifier.notify(
            &format!("build {} now live", artifact.revision),
            NotifyCategory::Deploy,
        );
        self.state.active_artifact = Some(artifact);
        Ok(())
    }

    async fn do_start(&mut self) -> Result<(), SupervisorError> {
        match self.try_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear_session();
                self.state.state = WatchdogState::Offline;
                self.publish();
                Err(e)
            }
        }
    }

    async fn try_start(&mut self) -> Result<(), SupervisorError> {
        self.state.state = WatchdogState::Starting;
        self.publish();

        if let Some(version) = self.engine.apply_pending().await? {
            self.notifier.notify(
                &format!("engine version {version} now active"),
                NotifyCategory::Deploy,
            );
        }
        self.apply_staged().await?;
        self.publish();

        let artifact = self
            .state
            .active_artifact
            .clone()
            .ok_or(SupervisorError::NoArtifactStaged)?;
        let live_dir = self.staging.live_dir()?;
        let executable = self.engine.server_executable()?;
        if !executable.exists() {
            return Err(SupervisorError::ExecutableMissing(executable));
        }
        probe_port(self.cfg.game_port)?;

        let comms_key = generate_comms_key();
        // Published before the spawn so the very first callback can
        // already authenticate.
        self.session_tx.send_replace(InteropSession {
            comms_key: Some(comms_key.clone()),
            ..InteropSession::default()
        });

        let mut cmd = Command::new(&executable);
        cmd.current_dir(&live_dir)
            .arg("--world")
            .arg(&live_dir)
            .arg("--port")
            .arg(self.cfg.game_port.to_string())
            .env("WARDEN_COMMS_KEY", &comms_key)
            .env("WARDEN_INTEROP_PORT", self.cfg.interop_port.to_string())
            .env(
                "WARDEN_SECURITY_LEVEL",
                format!("{:?}", artifact.minimum_security_level).to_lowercase(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree is one
                    // signalable group.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id().ok_or(SupervisorError::EarlyExit(None))?;
        tracing::info!(
            pid,
            port = self.cfg.game_port,
            revision = %artifact.revision,
            "server process spawned"
        );

        self.drain_output(&mut child);

        tokio::select! {
            ready = wait_for_local_tcp_port(self.cfg.game_port, startup_timeout()) => {
                if !ready {
                    #[cfg(unix)]
                    signal_group(pid, libc::SIGKILL);
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(SupervisorError::StartupTimeout);
                }
            }
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                return Err(SupervisorError::EarlyExit(code));
            }
        }

        self.running = Some(RunningServer {
            handle: ServerHandle::Spawned(child),
            pid,
            port: self.cfg.game_port,
            comms_key: comms_key.clone(),
            interop_version: artifact.interop_version.clone(),
            launched_at: Instant::now(),
            pinger: None,
        });
        self.state.state = WatchdogState::Online;
        self.publish();

        metrics::spawn_sampler(self.status_tx.subscribe(), pid, self.sample.clone());
        self.spawn_pinger(pid, self.cfg.game_port, comms_key);
        self.save_reattach();
        self.notifier.notify(
            &format!(
                "server online on port {} (build {})",
                self.cfg.game_port, artifact.revision
            ),
            NotifyCategory::Lifecycle,
        );
        Ok(())
    }

    fn drain_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let sink = self.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(line).await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = self.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(line).await;
                }
            });
        }
    }

    /// Periodic liveness probe. Goes through the same Topic channel
    /// the game uses, so a wedged interpreter (process alive, not
    /// answering) is caught too.
    fn spawn_pinger(&mut self, pid: u32, port: u16, comms_key: String) {
        let client = self.topic.clone();
        let intents = self.intents_tx.clone();
        let handle = tokio::spawn(async move {
            let mut last_ok = Instant::now();
            let mut ticker = tokio::time::interval(health_ping_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cmd = TopicQuery::new(host_verbs::PLAYER_COUNT)
                    .comms_key(&comms_key)
                    .encode();
                match client.send(port, &cmd).await {
                    Ok(_) => last_ok = Instant::now(),
                    Err(e) => {
                        tracing::debug!(error = %e, "health ping failed");
                        if last_ok.elapsed() >= hang_timeout() {
                            let _ = intents.send(Intent::HangDetected { pid });
                            return;
                        }
                    }
                }
            }
        });
        if let Some(running) = &mut self.running {
            running.pinger = Some(handle);
        }
    }

    /// Graceful-first stop escalation: ask over the protocol, then
    /// SIGTERM the group, then SIGKILL. Always reaps before returning
    /// so no watcher is left behind.
    async fn stop_running(&mut self, graceful: bool) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.abort_tasks();
        self.clear_session();
        let grace = graceful_term_grace();

        if graceful {
            // The request goes out from a short-lived task; the loop
            // only ever waits on the exit itself, so a server that
            // accepts and then sits on the socket cannot stall it.
            let client = self.topic.clone();
            let port = running.port;
            let cmd = TopicQuery::new(host_verbs::GRACEFUL_SHUTDOWN)
                .comms_key(&running.comms_key)
                .encode();
            tokio::spawn(async move {
                if let Err(e) = client.send(port, &cmd).await {
                    tracing::debug!(error = %e, "graceful shutdown request failed");
                }
            });
            if tokio::time::timeout(grace, running.wait_exit()).await.is_ok() {
                return;
            }
        }

        running.signal_term();
        if tokio::time::timeout(grace, running.wait_exit()).await.is_ok() {
            return;
        }
        tracing::warn!(pid = running.pid, "server ignored SIGTERM, killing");
        running.signal_kill();
        let _ = running.wait_exit().await;
    }

    /// Attempt to re-acquire a server left running across a service
    /// restart. Trusted only if the pid is alive and the process still
    /// answers the version handshake with the recorded comms key.
    async fn try_reattach(&mut self) {
        let info = match self.reattach.load() {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %format_error_chain(&e), "failed to read reattach state");
                return;
            }
        };

        self.state.state = WatchdogState::Restoring;
        self.publish();
        tracing::info!(pid = info.pid, port = info.port, "attempting reattach");

        if !pid_alive(info.pid) {
            tracing::info!("recorded server process is gone, cold start");
            let _ = self.reattach.clear();
            self.settle_offline();
            return;
        }

        self.session_tx.send_replace(InteropSession {
            comms_key: Some(info.comms_key.clone()),
            interop_version: info.interop_version.clone(),
            ..InteropSession::default()
        });
        let handshake = TopicQuery::new(host_verbs::API_COMPAT_ACK)
            .push("version", HOST_INTEROP_VERSION)
            .comms_key(&info.comms_key)
            .encode();
        let reply = self.topic.send_with_retry(info.port, &handshake).await;
        match reply {
            Ok(reply) if !reply.starts_with("error") => {
                self.state.active_artifact = info.active_artifact.clone();
                self.state.reboot_seen = info.reboot_expected;
                self.running = Some(RunningServer {
                    handle: ServerHandle::Reattached,
                    pid: info.pid,
                    port: info.port,
                    comms_key: info.comms_key.clone(),
                    interop_version: info.interop_version.clone(),
                    launched_at: Instant::now(),
                    pinger: None,
                });
                self.state.state = WatchdogState::Online;
                self.publish();
                metrics::spawn_sampler(
                    self.status_tx.subscribe(),
                    info.pid,
                    self.sample.clone(),
                );
                self.spawn_pinger(info.pid, info.port, info.comms_key.clone());
                // Consume the record, then persist a fresh one now
                // that the handshake has been validated.
                let _ = self.reattach.clear();
                self.save_reattach();
                self.notifier
                    .notify("reattached to running server", NotifyCategory::Lifecycle);
            }
            other => {
                match other {
                    Ok(reply) => tracing::warn!(reply, "reattach handshake rejected"),
                    Err(e) => tracing::warn!(error = %e, "reattach handshake failed"),
                }
                let _ = self.reattach.clear();
                self.clear_session();
                // Fall through to a cold start with the recorded
                // artifact identity; the live slot still holds it.
                self.state.active_artifact = info.active_artifact.clone();
                self.state.state = WatchdogState::Offline;
                self.publish();
                if self.state.active_artifact.is_some()
                    && let Err(e) = self.do_start().await
                {
                    tracing::warn!(error = %e, "cold start after failed reattach did not launch");
                }
            }
        }
    }
}

/// The hosted process must own its port exclusively; binding and
/// immediately releasing it detects a squatter before launch.
fn probe_port(port: u16) -> Result<(), SupervisorError> {
    match std::net::TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(_) => Err(SupervisorError::PortUnavailable(port)),
    }
}

async fn wait_for_local_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(stream) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            drop(stream);
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the host dies, make sure the server goes with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::reattach::JsonFileStore;
    use tempfile::TempDir;
    use warden_topic::wire;
    use warden_types::{SecurityLevel, SlotId};

    fn artifact(slot: SlotId, revision: &str) -> CompileArtifact {
        CompileArtifact {
            slot,
            revision: revision.to_string(),
            minimum_security_level: SecurityLevel::Safe,
            interop_version: Some("2.1.0".to_string()),
        }
    }

    #[test]
    fn deposit_last_writer_wins() {
        let mut state = SupervisorState::new();
        state.state = WatchdogState::Online;

        assert!(!state.deposit(artifact(SlotId::B, "r1")));
        assert!(!state.deposit(artifact(SlotId::B, "r2")));
        assert_eq!(state.staged_artifact.as_ref().unwrap().revision, "r2");
    }

    #[test]
    fn deposit_while_offline_wants_immediate_swap() {
        let mut state = SupervisorState::new();
        assert!(state.deposit(artifact(SlotId::A, "r1")));
    }

    #[test]
    fn short_lived_crashes_back_off_exponentially() {
        let bad_start = Duration::from_secs(10);
        let mut state = SupervisorState::new();
        state.state = WatchdogState::Online;

        for expected in [1, 2, 4, 8] {
            let plan = state.on_exit(Duration::from_secs(3), bad_start);
            assert_eq!(
                plan,
                ExitPlan::Relaunch {
                    delay: Some(Duration::from_secs(expected)),
                }
            );
            assert_eq!(state.state, WatchdogState::HardRebooting);
            state.state = WatchdogState::Online;
        }
        assert_eq!(state.retries, 4);

        // Twelfth consecutive bad start hits the one-hour ceiling.
        state.retries = 12;
        let plan = state.on_exit(Duration::from_secs(3), bad_start);
        assert_eq!(
            plan,
            ExitPlan::Relaunch {
                delay: Some(Duration::from_secs(3600)),
            }
        );
    }

    #[test]
    fn long_uptime_resets_retries_and_relaunches_immediately() {
        let bad_start = Duration::from_secs(10);
        let mut state = SupervisorState::new();
        state.state = WatchdogState::Online;
        state.retries = 7;

        let plan = state.on_exit(Duration::from_secs(600), bad_start);
        assert_eq!(plan, ExitPlan::Relaunch { delay: None });
        assert_eq!(state.retries, 0);
    }

    #[test]
    fn soft_shutdown_exit_is_clean_not_a_crash() {
        let mut state = SupervisorState::new();
        state.state = WatchdogState::Online;
        state.soft_shutdown_requested = true;
        state.retries = 3;

        // Voluntary exit three seconds in would normally be a bad start.
        let plan = state.on_exit(Duration::from_secs(3), Duration::from_secs(10));
        assert_eq!(plan, ExitPlan::StopClean);
        assert_eq!(state.state, WatchdogState::Offline);
        assert!(!state.soft_shutdown_requested);
        assert_eq!(state.retries, 0);
    }

    #[test]
    fn announced_reboot_relaunches_without_backoff() {
        let mut state = SupervisorState::new();
        state.state = WatchdogState::Online;
        state.reboot_seen = true;

        let plan = state.on_exit(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(plan, ExitPlan::Relaunch { delay: None });
        assert!(!state.reboot_seen);
        assert_eq!(state.state, WatchdogState::HardRebooting);
    }

    #[test]
    fn exit_during_restart_defers_instead_of_double_launching() {
        let mut state = SupervisorState::new();
        state.state = WatchdogState::Online;
        state.restart_in_flight = true;

        let plan = state.on_exit(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(plan, ExitPlan::Defer);
        assert_eq!(state.state, WatchdogState::DelayedRestart);
    }

    struct Harness {
        _tmp: TempDir,
        staging: Arc<StagingSwapper>,
        watchdog: Watchdog,
        notifier: Arc<RecordingNotifier>,
        logs: LogSink,
        sample: SharedSample,
    }

    async fn harness(reattach_enabled: bool, game_port: u16) -> Harness {
        let tmp = TempDir::new().unwrap();
        let staging = Arc::new(StagingSwapper::new(tmp.path().join("game")));
        staging.ensure_layout().unwrap();
        let engine = Arc::new(EngineVersionStager::new(tmp.path().join("engine")));
        engine.ensure_layout().unwrap();
        let store = Arc::new(JsonFileStore::new(tmp.path().join("reattach.json")));
        let notifier = Arc::new(RecordingNotifier::default());
        let (session_tx, _session_rx) = watch::channel(InteropSession::default());
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let logs = LogSink::default();
        let sample = SharedSample::default();

        let watchdog = Watchdog::spawn(
            WatchdogConfig {
                game_port,
                interop_port: 0,
                reattach_enabled,
            },
            staging.clone(),
            engine,
            store,
            notifier.clone(),
            session_tx,
            events_rx,
            logs.clone(),
            sample.clone(),
        );

        Harness {
            _tmp: tmp,
            staging,
            watchdog,
            notifier,
            logs,
            sample,
        }
    }

    #[tokio::test]
    async fn start_without_artifact_fails_fast() {
        let h = harness(false, 47001).await;
        let err = h.watchdog.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoArtifactStaged));
        assert_eq!(h.watchdog.status().state, WatchdogState::Offline);
    }

    #[tokio::test]
    async fn offline_deposit_swaps_immediately() {
        let h = harness(false, 47002).await;
        let (slot, _path) = h.staging.writable_slot().await.unwrap();
        let deposited = artifact(slot, "rev-100");

        h.watchdog.deposit_artifact(deposited.clone()).await.unwrap();

        let status = h.watchdog.status();
        assert_eq!(status.active_artifact, Some(deposited));
        assert_eq!(status.staged_artifact, None);
        assert_eq!(h.staging.live_slot().unwrap(), slot);
        let seen = h.notifier.seen.lock().unwrap();
        assert!(seen.iter().any(|(m, _)| m.contains("now live")));
    }

    #[tokio::test]
    async fn stop_while_offline_is_a_named_condition() {
        let h = harness(false, 47003).await;
        assert!(matches!(
            h.watchdog.stop().await.unwrap_err(),
            SupervisorError::NotRunning
        ));
        assert!(matches!(
            h.watchdog.request_graceful_stop().await.unwrap_err(),
            SupervisorError::NotRunning
        ));
    }

    #[tokio::test]
    async fn tail_logs_pages_drained_output() {
        let h = harness(false, 47004).await;
        for i in 1..=3 {
            h.logs.emit(format!("world tick {i}")).await;
        }

        let (lines, cursor) = h.watchdog.tail_logs(0, 2).await;
        assert_eq!(
            lines,
            vec!["world tick 2".to_string(), "world tick 3".to_string()]
        );

        // Nothing new yet; the cursor holds its place.
        let (lines, cursor) = h.watchdog.tail_logs(cursor, 10).await;
        assert!(lines.is_empty());

        h.logs.emit("world tick 4").await;
        let (lines, _) = h.watchdog.tail_logs(cursor, 10).await;
        assert_eq!(lines, vec!["world tick 4".to_string()]);
    }

    #[tokio::test]
    async fn resource_sample_surfaces_through_the_handle() {
        let h = harness(false, 47005).await;
        assert_eq!(h.watchdog.resource_sample(), None);

        let published = ResourceSample {
            cpu_percent_x100: 1250,
            rss_bytes: 64 * 1024 * 1024,
        };
        *h.sample.lock().unwrap() = Some(published);
        assert_eq!(h.watchdog.resource_sample(), Some(published));
    }

    // Answers every Topic request with a fixed reply, forever.
    async fn spawn_responder(reply: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if wire::read_command(&mut stream, wire::MAX_COMMAND_BYTES)
                        .await
                        .is_ok()
                    {
                        use tokio::io::AsyncWriteExt;
                        let _ = stream.write_all(&wire::build_reply(reply)).await;
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn reattach_reaches_online_without_relaunching() {
        // A child of ours stands in for the previously launched server:
        // alive, signalable, and never started by this watchdog.
        let mut stand_in = Command::new("sleep");
        let mut stand_in = stand_in.arg("300").kill_on_drop(true).spawn().unwrap();
        let pid = stand_in.id().unwrap();
        let port = spawn_responder("api_compat&version=2.1.0").await;

        let tmp = TempDir::new().unwrap();
        let staging = Arc::new(StagingSwapper::new(tmp.path().join("game")));
        staging.ensure_layout().unwrap();
        let engine = Arc::new(EngineVersionStager::new(tmp.path().join("engine")));
        engine.ensure_layout().unwrap();
        let store = Arc::new(JsonFileStore::new(tmp.path().join("reattach.json")));
        let saved = ReattachInfo {
            pid,
            port,
            comms_key: generate_comms_key(),
            interop_version: Some("2.1.0".to_string()),
            reboot_expected: false,
            active_artifact: Some(artifact(SlotId::A, "rev-7")),
        };
        store.save(&saved).unwrap();

        let (session_tx, session_rx) = watch::channel(InteropSession::default());
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let watchdog = Watchdog::spawn(
            WatchdogConfig {
                game_port: port,
                interop_port: 0,
                reattach_enabled: true,
            },
            staging,
            engine,
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            session_tx,
            events_rx,
            LogSink::default(),
            SharedSample::default(),
        );

        let mut status = watchdog.status_watch();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.state == WatchdogState::Online),
        )
        .await
        .expect("reattach timed out")
        .unwrap();

        let snapshot = watchdog.status();
        assert_eq!(snapshot.pid, Some(pid));
        assert_eq!(snapshot.current_port, Some(port));
        assert_eq!(snapshot.active_artifact, saved.active_artifact);
        assert_eq!(
            session_rx.borrow().comms_key.as_deref(),
            Some(saved.comms_key.as_str())
        );
        // The record was consumed and re-persisted post-handshake.
        assert!(store.load().unwrap().is_some());

        // Graceful-stop request is visible in the snapshot.
        watchdog.request_graceful_stop().await.unwrap();
        assert!(watchdog.status().soft_shutdown_requested);

        let _ = stand_in.kill().await;
    }

    // Answers the first Topic request, then accepts connections and
    // sits on them without ever replying.
    async fn spawn_one_reply_then_silent_responder(reply: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let answer = std::mem::take(&mut first);
                tokio::spawn(async move {
                    if wire::read_command(&mut stream, wire::MAX_COMMAND_BYTES)
                        .await
                        .is_ok()
                    {
                        if answer {
                            use tokio::io::AsyncWriteExt;
                            let _ = stream.write_all(&wire::build_reply(reply)).await;
                        } else {
                            tokio::time::sleep(Duration::from_secs(120)).await;
                        }
                    }
                });
            }
        });
        port
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_is_not_stalled_by_a_silent_shutdown_socket() {
        // Session leader, like a real launch, so group signals land.
        let mut cmd = Command::new("sleep");
        cmd.arg("300").kill_on_drop(true);
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut stand_in = cmd.spawn().unwrap();
        let pid = stand_in.id().unwrap();
        let port = spawn_one_reply_then_silent_responder("api_compat&version=2.1.0").await;

        let tmp = TempDir::new().unwrap();
        let staging = Arc::new(StagingSwapper::new(tmp.path().join("game")));
        staging.ensure_layout().unwrap();
        let engine = Arc::new(EngineVersionStager::new(tmp.path().join("engine")));
        engine.ensure_layout().unwrap();
        let store = Arc::new(JsonFileStore::new(tmp.path().join("reattach.json")));
        store
            .save(&ReattachInfo {
                pid,
                port,
                comms_key: generate_comms_key(),
                interop_version: None,
                reboot_expected: false,
                active_artifact: Some(artifact(SlotId::A, "rev-8")),
            })
            .unwrap();

        let (session_tx, _session_rx) = watch::channel(InteropSession::default());
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let watchdog = Watchdog::spawn(
            WatchdogConfig {
                game_port: port,
                interop_port: 0,
                reattach_enabled: true,
            },
            staging,
            engine,
            store,
            Arc::new(RecordingNotifier::default()),
            session_tx,
            events_rx,
            LogSink::default(),
            SharedSample::default(),
        );

        let mut status = watchdog.status_watch();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.state == WatchdogState::Online),
        )
        .await
        .expect("reattach timed out")
        .unwrap();

        // Shutdown request goes to a socket that never answers; stop
        // must still finish within the SIGTERM grace, not the grace
        // plus the client's receive timeout.
        let started = std::time::Instant::now();
        watchdog.stop().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(9), "stop took {elapsed:?}");
        assert_eq!(watchdog.status().state, WatchdogState::Offline);

        let _ = stand_in.wait().await;
    }

    #[tokio::test]
    async fn stale_reattach_record_cold_starts_offline() {
        let tmp = TempDir::new().unwrap();
        let staging = Arc::new(StagingSwapper::new(tmp.path().join("game")));
        staging.ensure_layout().unwrap();
        let engine = Arc::new(EngineVersionStager::new(tmp.path().join("engine")));
        engine.ensure_layout().unwrap();
        let store = Arc::new(JsonFileStore::new(tmp.path().join("reattach.json")));
        store
            .save(&ReattachInfo {
                // Far beyond any configurable pid_max.
                pid: 99_999_999,
                port: 47999,
                comms_key: generate_comms_key(),
                interop_version: None,
                reboot_expected: false,
                active_artifact: None,
            })
            .unwrap();

        let (session_tx, _session_rx) = watch::channel(InteropSession::default());
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let watchdog = Watchdog::spawn(
            WatchdogConfig {
                game_port: 47998,
                interop_port: 0,
                reattach_enabled: true,
            },
            staging,
            engine,
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            session_tx,
            events_rx,
            LogSink::default(),
            SharedSample::default(),
        );

        // The initial snapshot is already Offline, so wait on the side
        // effect: the stale record being discarded.
        let mut cleared = false;
        for _ in 0..100 {
            if store.load().unwrap().is_none() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cleared, "stale reattach record was not discarded");
        let snapshot = watchdog.status();
        assert_eq!(snapshot.state, WatchdogState::Offline);
        assert_eq!(snapshot.pid, None);
    }
}
