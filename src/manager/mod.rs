//! Model management facade.
//!
//! A [`ModelManager`] composes the process supervisor, the channel and the
//! request dispatcher for one named model. A [`ModelRegistry`] holds many.

mod provision;
mod registry;
mod scope;

pub use provision::{DirectProvisioner, EnvironmentProvisioner};
pub use registry::{ModelRegistry, Outcomes};
pub use scope::with_started;
pub(crate) use scope::extract_panic_message;

#[cfg(test)]
pub use provision::MockEnvironmentProvisioner;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::health::{HealthRecord, HealthState, HealthTarget, SharedHealth};
use crate::ipc::protocol::{is_reserved_handler, payload_handlers};
use crate::ipc::{Payload, RequestDispatcher, PING_HANDLER};
use crate::process::{ProcessHandle, ProcessState, ProcessSupervisor};
use crate::types::{Error, HealthPolicy, InstanceId, IpcConfig, ModelConfig, Result};

/// Point-in-time view of one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub version: String,
    pub handlers: Vec<String>,
    pub running: bool,
    pub process: ProcessHandle,
    pub health: HealthRecord,
}

/// Reply to a protocol-level ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingReport {
    /// Handlers the worker says it serves.
    pub handlers: Vec<String>,
    pub latency_ms: u64,
}

/// Facade over one model's worker.
pub struct ModelManager {
    config: ModelConfig,
    supervisor: ProcessSupervisor,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    health: SharedHealth,
    last_counted_restart: Mutex<Option<InstanceId>>,
}

impl ModelManager {
    /// Manager launching the configured command directly.
    pub fn new(config: ModelConfig) -> Result<Self> {
        Self::with_provisioner(config, Arc::new(DirectProvisioner), IpcConfig::default())
    }

    pub fn with_provisioner(
        config: ModelConfig,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        ipc: IpcConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            supervisor: ProcessSupervisor::new(config.name.clone(), ipc),
            config,
            provisioner,
            health: SharedHealth::new(),
            last_counted_restart: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.state() == ProcessState::Running
    }

    /// Launch the worker. No-op while already running; relaunches a crashed
    /// worker.
    pub async fn start(&self) -> Result<ProcessHandle> {
        let spawned_before = self.supervisor.spawn_count();
        let handle = self
            .supervisor
            .start(self.config.timeouts.startup, || {
                self.provisioner.ensure(&self.config)
            })
            .await?;
        if self.supervisor.spawn_count() != spawned_before {
            self.health.update(|r| r.reset());
        }
        Ok(handle)
    }

    /// Call `handler` with the configured request timeout.
    pub async fn request(&self, handler: &str, payload: Payload) -> Result<Payload> {
        self.request_with_timeout(handler, payload, self.config.timeouts.request)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        handler: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload> {
        if is_reserved_handler(handler) {
            return Err(Error::validation(format!(
                "handler '{}' is reserved",
                handler
            )));
        }
        if self.health.snapshot().is_dead() {
            return Err(Error::ModelDead(self.config.name.clone()));
        }
        self.dispatcher()?.call(handler, payload, timeout).await
    }

    /// Protocol-level probe; the worker must answer `{"status": "pong"}`.
    pub async fn ping(&self, timeout: Duration) -> Result<PingReport> {
        let dispatcher = self.dispatcher()?;
        let started = Instant::now();
        let reply = dispatcher.call(PING_HANDLER, Payload::new(), timeout).await?;
        let latency = started.elapsed();
        match reply.get("status").and_then(Value::as_str) {
            Some("pong") => Ok(PingReport {
                handlers: payload_handlers(&reply),
                latency_ms: latency.as_millis() as u64,
            }),
            other => Err(Error::protocol(format!(
                "unexpected ping reply status: {:?}",
                other
            ))),
        }
    }

    /// Stop the worker, failing every outstanding call. Bounded by the
    /// shutdown grace plus the terminate/kill window.
    pub async fn stop(&self) -> Result<()> {
        self.supervisor
            .stop(self.config.timeouts.shutdown_grace)
            .await;
        Ok(())
    }

    /// Explicit restart. Clears a Dead or Degraded record on success.
    pub async fn restart(&self) -> Result<ProcessHandle> {
        let handle = self.restart_worker().await?;
        self.health.update(|r| r.mark_restarted());
        Ok(handle)
    }

    async fn restart_worker(&self) -> Result<ProcessHandle> {
        let handle = self
            .supervisor
            .restart(
                self.config.timeouts.shutdown_grace,
                self.config.timeouts.startup,
                || self.provisioner.ensure(&self.config),
            )
            .await?;
        let first_observer = {
            let mut last = self
                .last_counted_restart
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if last.as_ref() == Some(&handle.instance_id) {
                false
            } else {
                *last = Some(handle.instance_id.clone());
                true
            }
        };
        // Joined restarts observe the same instance; count it once.
        if first_observer {
            self.health.update(|r| r.count_restart());
        }
        Ok(handle)
    }

    pub fn status(&self) -> ModelStatus {
        let process = self.supervisor.handle();
        ModelStatus {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            handlers: self.config.handlers.clone(),
            running: process.is_running(),
            process,
            health: self.health.snapshot(),
        }
    }

    fn dispatcher(&self) -> Result<Arc<RequestDispatcher>> {
        match self.supervisor.dispatcher() {
            Some(dispatcher) => Ok(dispatcher),
            None if self.health.state() == HealthState::Restarting => Err(Error::cancelled(
                format!("model '{}' is restarting", self.config.name),
            )),
            None => Err(Error::not_running(self.config.name.clone())),
        }
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("name", &self.config.name)
            .field("state", &self.supervisor.state())
            .field("health", &self.health.state())
            .finish()
    }
}

#[async_trait]
impl HealthTarget for ModelManager {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn policy(&self) -> HealthPolicy {
        self.config.health.clone()
    }

    fn process_state(&self) -> ProcessState {
        self.supervisor.state()
    }

    fn is_alive(&self) -> bool {
        self.supervisor.is_alive()
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration> {
        let report = self.ping(timeout).await?;
        Ok(Duration::from_millis(report.latency_ms))
    }

    async fn restart(&self) -> Result<()> {
        self.restart_worker().await.map(|_| ())
    }

    fn health(&self) -> SharedHealth {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig::new("fruit", "/bin/true")
    }

    #[tokio::test]
    async fn test_request_before_start_is_not_running() {
        let manager = ModelManager::new(config()).unwrap();
        let err = manager.request("classify", Payload::new()).await.unwrap_err();
        assert!(matches!(err, Error::ManagerNotRunning(ref name) if name == "fruit"));
        assert!(matches!(
            manager.ping(Duration::from_millis(10)).await,
            Err(Error::ManagerNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_reserved_handlers_are_rejected() {
        let manager = ModelManager::new(config()).unwrap();
        for handler in ["ping", "shutdown"] {
            let err = manager.request(handler, Payload::new()).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{}", handler);
        }
    }

    #[tokio::test]
    async fn test_dead_model_rejects_requests() {
        let manager = ModelManager::new(config()).unwrap();
        manager.health.update(|r| r.mark_dead("gave up"));
        let err = manager.request("classify", Payload::new()).await.unwrap_err();
        assert!(matches!(err, Error::ModelDead(_)));
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut bad = config();
        bad.name = "no spaces allowed".into();
        assert!(matches!(ModelManager::new(bad), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_provisioner_failure_is_startup_error() {
        let mut provisioner = MockEnvironmentProvisioner::new();
        provisioner
            .expect_ensure()
            .times(1)
            .returning(|_| Err(Error::startup("pip install failed: torch==9.9")));

        let manager =
            ModelManager::with_provisioner(config(), Arc::new(provisioner), IpcConfig::default())
                .unwrap();
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, Error::Startup(ref m) if m.contains("pip install failed")));

        let status = manager.status();
        assert!(!status.running);
        assert_eq!(status.process.state, ProcessState::Stopped);
        assert_eq!(status.health.state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_status_is_a_pure_read() {
        let manager = ModelManager::new(config()).unwrap();
        let first = manager.status();
        let second = manager.status();
        assert_eq!(first, second);
        assert_eq!(first.version, "1.0.0");
        assert!(manager.stop().await.is_ok());
    }
}
