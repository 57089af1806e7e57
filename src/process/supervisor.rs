//! Ownership of one worker's OS process across its lifecycle.
//!
//! The supervisor spawns the worker, performs the readiness handshake over a
//! fresh channel, watches for unexpected exits and tears everything down on
//! stop. Restarts are serialized through a gate so that concurrent requests
//! collapse into the one already in flight.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{self, Signal as NixSignal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::launch::LaunchSpec;
use super::output::{forward, OutputTail};
use super::types::{ExitInfo, ProcessHandle, ProcessState};
use crate::ipc::{CancelReason, Channel, MessageKind, Payload, PipePaths, RequestDispatcher, SHUTDOWN_HANDLER};
use crate::types::{Error, InstanceId, IpcConfig, Result};

/// Time allowed between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Time allowed for the kernel to reap a SIGKILLed worker.
pub const KILL_WAIT: Duration = Duration::from_secs(2);

/// Time allowed for output forwarders to drain after exit.
const OUTPUT_DRAIN: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

type ExitWatch = watch::Receiver<Option<ExitInfo>>;

/// Everything that lives exactly as long as one worker process.
struct WorkerInstance {
    instance_id: InstanceId,
    pid: u32,
    dispatcher: Arc<RequestDispatcher>,
    exit: ExitWatch,
    signals: mpsc::Sender<Signal>,
    forwarders: Vec<JoinHandle<()>>,
    tail: OutputTail,
    _pipe_dir: TempDir,
}

impl Drop for WorkerInstance {
    fn drop(&mut self) {
        let _ = self.signals.try_send(Signal::Kill);
    }
}

/// Outcome a joined restart caller observes.
type RestartOutcome = std::result::Result<ProcessHandle, String>;

struct Inner {
    model: String,
    ipc: IpcConfig,
    status: watch::Sender<ProcessHandle>,
    dispatcher: watch::Sender<Option<Arc<RequestDispatcher>>>,
    worker: Mutex<Option<WorkerInstance>>,
    liveness: StdMutex<Option<(u32, ExitWatch)>>,
    restart_gate: Mutex<Option<RestartOutcome>>,
    restart_generation: AtomicU64,
    spawns: AtomicU64,
}

impl Inner {
    fn transition(&self, to: ProcessState) {
        self.status.send_modify(|handle| {
            if !handle.state.can_transition_to(to) && handle.state != to {
                tracing::debug!(model = %self.model, from = ?handle.state, ?to, "forced state transition");
            }
            handle.state = to;
        });
    }

    /// Called by the monitor task when the process has been reaped.
    fn on_exit(&self, instance_id: &InstanceId, info: &ExitInfo, tail: &OutputTail) {
        let crashed = self.status.send_if_modified(|handle| {
            if &handle.instance_id == instance_id && handle.state == ProcessState::Running {
                handle.state = ProcessState::Crashed;
                handle.exit = Some(info.clone());
                true
            } else {
                false
            }
        });
        if !crashed {
            return;
        }
        tracing::warn!(
            model = %self.model,
            reason = %info.reason,
            stderr_tail = %tail.render(),
            "worker exited unexpectedly"
        );
        if let Some(dispatcher) = self.dispatcher.borrow().clone() {
            dispatcher.cancel_all(CancelReason::WorkerCrashed(format!(
                "worker exited unexpectedly ({})",
                info.reason
            )));
        }
    }
}

/// Supervises the worker process of one model.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(model: impl Into<String>, ipc: IpcConfig) -> Self {
        let (status, _) = watch::channel(ProcessHandle::idle());
        let (dispatcher, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                model: model.into(),
                ipc,
                status,
                dispatcher,
                worker: Mutex::new(None),
                liveness: StdMutex::new(None),
                restart_gate: Mutex::new(None),
                restart_generation: AtomicU64::new(0),
                spawns: AtomicU64::new(0),
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// Current process snapshot.
    pub fn handle(&self) -> ProcessHandle {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessHandle> {
        self.inner.status.subscribe()
    }

    /// Dispatcher of the running instance, if any.
    pub fn dispatcher(&self) -> Option<Arc<RequestDispatcher>> {
        self.inner.dispatcher.borrow().clone()
    }

    /// Number of worker processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    /// Non-blocking liveness check: exit not yet observed and the pid still
    /// accepts signals.
    pub fn is_alive(&self) -> bool {
        let liveness = self
            .inner
            .liveness
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match liveness.as_ref() {
            Some((pid, exit)) if exit.borrow().is_none() => {
                signal::kill(Pid::from_raw(*pid as i32), None).is_ok()
            }
            _ => false,
        }
    }

    /// Launch a worker unless one is already running.
    ///
    /// `launch` is only invoked when a new process is needed. A crashed
    /// instance is cleaned up and replaced.
    pub async fn start<F, Fut>(&self, startup_timeout: Duration, launch: F) -> Result<ProcessHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LaunchSpec>>,
    {
        let mut slot = self.inner.worker.lock().await;
        if slot.is_some() && self.state() == ProcessState::Running {
            return Ok(self.handle());
        }
        self.start_locked(&mut slot, startup_timeout, launch).await
    }

    /// Stop the worker: fail pending calls, ask it to shut down, then
    /// escalate to SIGTERM and SIGKILL. Always ends in Stopped.
    pub async fn stop(&self, grace: Duration) -> Option<ExitInfo> {
        let mut slot = self.inner.worker.lock().await;
        match slot.take() {
            Some(instance) => self.teardown(instance, grace, CancelReason::Stopped).await,
            None => {
                self.inner.transition(ProcessState::Stopped);
                None
            }
        }
    }

    /// Stop then start. Concurrent callers join the restart in flight and
    /// observe its outcome instead of launching another process.
    pub async fn restart<F, Fut>(
        &self,
        grace: Duration,
        startup_timeout: Duration,
        launch: F,
    ) -> Result<ProcessHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LaunchSpec>>,
    {
        let observed = self.inner.restart_generation.load(Ordering::SeqCst);
        let mut gate = self.inner.restart_gate.lock().await;
        if self.inner.restart_generation.load(Ordering::SeqCst) != observed {
            tracing::debug!(model = %self.inner.model, "joined restart in flight");
            return match gate.clone() {
                Some(Ok(handle)) => Ok(handle),
                Some(Err(msg)) => Err(Error::Startup(msg)),
                None => Err(Error::startup("restart outcome unavailable")),
            };
        }

        tracing::info!(model = %self.inner.model, "restarting worker");
        let outcome = {
            let mut slot = self.inner.worker.lock().await;
            if let Some(instance) = slot.take() {
                self.teardown(instance, grace, CancelReason::Restarting).await;
            }
            self.start_locked(&mut slot, startup_timeout, launch).await
        };

        *gate = Some(match &outcome {
            Ok(handle) => Ok(handle.clone()),
            Err(Error::Startup(msg)) => Err(msg.clone()),
            Err(e) => Err(e.to_string()),
        });
        self.inner.restart_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn start_locked<F, Fut>(
        &self,
        slot: &mut Option<WorkerInstance>,
        startup_timeout: Duration,
        launch: F,
    ) -> Result<ProcessHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LaunchSpec>>,
    {
        if let Some(stale) = slot.take() {
            self.teardown(stale, Duration::ZERO, CancelReason::Restarting).await;
        }

        let instance_id = InstanceId::new();
        self.inner.status.send_modify(|handle| {
            handle.instance_id = instance_id.clone();
            handle.pid = None;
            handle.started_at = None;
            handle.state = ProcessState::Starting;
        });

        let spec = match launch().await {
            Ok(spec) => spec,
            Err(e) => {
                self.inner.transition(ProcessState::Stopped);
                return Err(match e {
                    Error::Startup(msg) => Error::Startup(msg),
                    other => Error::startup(format!("provisioning failed: {}", other)),
                });
            }
        };

        match self.spawn_instance(instance_id, &spec, startup_timeout).await {
            Ok(instance) => {
                let pid = instance.pid;
                self.inner.dispatcher.send_replace(Some(instance.dispatcher.clone()));
                *self
                    .inner
                    .liveness
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some((pid, instance.exit.clone()));
                self.inner.status.send_modify(|handle| {
                    handle.pid = Some(pid);
                    handle.started_at = Some(Utc::now());
                    handle.state = ProcessState::Running;
                    handle.exit = None;
                });
                *slot = Some(instance);
                tracing::info!(model = %self.inner.model, pid, "worker running");
                Ok(self.handle())
            }
            Err((e, exit)) => {
                self.inner.status.send_modify(|handle| {
                    handle.state = ProcessState::Stopped;
                    handle.exit = exit;
                });
                tracing::error!(model = %self.inner.model, error = %e, "worker failed to start");
                Err(e)
            }
        }
    }

    /// Spawn, connect and wait for the Ready message.
    async fn spawn_instance(
        &self,
        instance_id: InstanceId,
        spec: &LaunchSpec,
        startup_timeout: Duration,
    ) -> std::result::Result<WorkerInstance, (Error, Option<ExitInfo>)> {
        let fail = |msg: String| -> (Error, Option<ExitInfo>) { (Error::Startup(msg), None) };

        let pipe_dir = tempfile::Builder::new()
            .prefix("modelserve_")
            .tempdir()
            .map_err(|e| fail(format!("cannot create pipe directory: {}", e)))?;
        let paths = PipePaths::create(pipe_dir.path()).map_err(|e| fail(e.to_string()))?;

        let mut child = spec
            .command(&paths, pipe_dir.path())
            .spawn()
            .map_err(|e| fail(format!("failed to spawn {}: {}", spec.program.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| fail("worker exited before its pid was known".to_string()))?;
        self.inner.spawns.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(model = %self.inner.model, pid, program = %spec.program.display(), "spawned worker");

        let tail = OutputTail::new();
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward(stdout, "stdout", self.inner.model.clone(), tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward(stderr, "stderr", self.inner.model.clone(), tail.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::channel(4);
        tokio::spawn(monitor(
            child,
            pid,
            signal_rx,
            exit_tx,
            Arc::downgrade(&self.inner),
            instance_id.clone(),
            tail.clone(),
        ));

        let handshake = async {
            let mut channel = Channel::open(&paths, startup_timeout, &self.inner.ipc).await?;
            let ready = channel.receive().await?;
            if ready.kind != MessageKind::Ready {
                return Err(Error::protocol(format!(
                    "expected readiness message, got {:?}",
                    ready.kind
                )));
            }
            Ok::<_, Error>((channel, ready))
        };

        let mut exit_wait = exit_rx.clone();
        let outcome = tokio::select! {
            result = tokio::time::timeout(startup_timeout, handshake) => match result {
                Ok(Ok(connected)) => Ok(connected),
                Ok(Err(e)) => Err(format!("handshake failed: {}", e)),
                Err(_) => Err(format!("worker not ready within {:?}", startup_timeout)),
            },
            exit = wait_exit(&mut exit_wait) => Err(match exit {
                Some(info) => format!("worker {} during startup", info.reason),
                None => "worker monitor stopped during startup".to_string(),
            }),
        };

        match outcome {
            Ok((channel, ready)) => {
                tracing::debug!(
                    model = %self.inner.model,
                    pid,
                    handlers = ?ready.handler_names(),
                    "worker ready"
                );
                Ok(WorkerInstance {
                    instance_id,
                    pid,
                    dispatcher: RequestDispatcher::start(channel),
                    exit: exit_rx,
                    signals: signal_tx,
                    forwarders,
                    tail,
                    _pipe_dir: pipe_dir,
                })
            }
            Err(msg) => {
                let _ = signal_tx.send(Signal::Kill).await;
                let mut exit_wait = exit_rx.clone();
                let exit = tokio::time::timeout(KILL_WAIT, wait_exit(&mut exit_wait))
                    .await
                    .ok()
                    .flatten();
                drain(forwarders).await;
                let stderr = tail.render();
                let msg = if stderr.is_empty() {
                    msg
                } else {
                    format!("{}; worker output:\n{}", msg, stderr)
                };
                Err((Error::Startup(msg), exit))
            }
        }
    }

    /// Bring one instance down. Always ends in Stopped.
    async fn teardown(
        &self,
        mut instance: WorkerInstance,
        grace: Duration,
        reason: CancelReason,
    ) -> Option<ExitInfo> {
        let model = &self.inner.model;
        self.inner.transition(ProcessState::Stopping);
        self.inner.dispatcher.send_replace(None);
        *self
            .inner
            .liveness
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;

        instance.dispatcher.cancel_all(reason.clone());

        let mut exit = instance.exit.borrow().clone();
        if exit.is_none() && !grace.is_zero() {
            // Delivering the request and the clean exit share one grace period.
            let graceful = async {
                let teardown_request = instance.dispatcher.notify(SHUTDOWN_HANDLER, Payload::new());
                if let Err(e) = teardown_request.await {
                    tracing::debug!(model = %model, error = %e, "could not deliver shutdown request");
                }
                wait_exit(&mut instance.exit).await
            };
            exit = tokio::time::timeout(grace, graceful).await.ok().flatten();
        }
        if exit.is_none() {
            tracing::debug!(model = %model, pid = instance.pid, "sending SIGTERM to worker");
            let _ = instance.signals.send(Signal::Terminate).await;
            exit = tokio::time::timeout(TERMINATE_GRACE, wait_exit(&mut instance.exit))
                .await
                .ok()
                .flatten();
        }
        if exit.is_none() {
            tracing::warn!(model = %model, pid = instance.pid, "worker ignored SIGTERM, killing");
            let _ = instance.signals.send(Signal::Kill).await;
            exit = tokio::time::timeout(KILL_WAIT, wait_exit(&mut instance.exit))
                .await
                .ok()
                .flatten();
        }

        instance.dispatcher.shutdown(reason).await;
        drain(std::mem::take(&mut instance.forwarders)).await;

        let instance_id = instance.instance_id.clone();
        self.inner.status.send_modify(|handle| {
            if handle.instance_id == instance_id {
                if exit.is_some() {
                    handle.exit = exit.clone();
                }
                handle.state = ProcessState::Stopped;
            }
        });
        tracing::info!(
            model = %model,
            pid = instance.pid,
            exit = ?exit.as_ref().map(|e| e.reason.to_string()),
            "worker stopped"
        );
        exit
    }

    /// Output lines most recently printed by the current worker.
    pub async fn output_tail(&self) -> Vec<String> {
        self.inner
            .worker
            .lock()
            .await
            .as_ref()
            .map(|instance| instance.tail.lines())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("model", &self.inner.model)
            .field("handle", &self.handle())
            .finish()
    }
}

/// Wait until an exit is published. `None` if the monitor went away.
async fn wait_exit(exit: &mut ExitWatch) -> Option<ExitInfo> {
    match exit.wait_for(Option::is_some).await {
        Ok(info) => (*info).clone(),
        Err(_) => None,
    }
}

async fn drain(forwarders: Vec<JoinHandle<()>>) {
    for mut task in forwarders {
        if tokio::time::timeout(OUTPUT_DRAIN, &mut task).await.is_err() {
            task.abort();
        }
    }
}

/// Owns the child: delivers signals and reaps it.
async fn monitor(
    mut child: Child,
    pid: u32,
    mut signals: mpsc::Receiver<Signal>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    supervisor: Weak<Inner>,
    instance_id: InstanceId,
    tail: OutputTail,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(sig) = signals.recv() => match sig {
                Signal::Terminate => {
                    let _ = signal::kill(Pid::from_raw(pid as i32), NixSignal::SIGTERM);
                }
                Signal::Kill => {
                    let _ = child.start_kill();
                }
            },
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from_status(&status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to reap worker");
            ExitInfo {
                reason: super::types::TerminationReason::Unknown,
                exited_at: Utc::now(),
            }
        }
    };
    exit_tx.send_replace(Some(info.clone()));
    if let Some(inner) = supervisor.upgrade() {
        inner.on_exit(&instance_id, &info, &tail);
    }
}
