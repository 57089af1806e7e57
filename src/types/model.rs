//! Per-model configuration record.
//!
//! A `ModelConfig` is produced by whatever loads model descriptors (files,
//! discovery, code) and is read-only to the core.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ipc::protocol::is_reserved_handler;
use crate::types::{Error, Result};

/// Environment variable that receives `gpu_ids` from the resource descriptor.
pub const GPU_VISIBILITY_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Prefix for every resource descriptor entry exported to the worker.
pub const RESOURCE_ENV_PREFIX: &str = "MODELSERVE_RESOURCE_";

/// Complete model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique model name (registry key).
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// How to launch the worker.
    pub command: LaunchCommand,

    /// Handler names the worker is expected to expose (informational).
    #[serde(default)]
    pub handlers: Vec<String>,

    #[serde(default)]
    pub health: HealthPolicy,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub timeouts: ModelTimeouts,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ModelConfig {
    /// Config with defaults for everything but the name and worker program.
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            command: LaunchCommand::new(program),
            handlers: Vec::new(),
            health: HealthPolicy::default(),
            resources: ResourceLimits::default(),
            timeouts: ModelTimeouts::default(),
        }
    }

    /// Reject configurations the core cannot act on.
    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(Error::validation(format!(
                "model name '{}' must be alphanumeric with underscores or hyphens",
                self.name
            )));
        }
        if self.command.program.as_os_str().is_empty() {
            return Err(Error::validation(format!(
                "model '{}' has no worker program",
                self.name
            )));
        }
        if let Some(reserved) = self.handlers.iter().find(|h| is_reserved_handler(h)) {
            return Err(Error::validation(format!(
                "model '{}' declares reserved handler '{}'",
                self.name, reserved
            )));
        }
        self.health.validate(&self.name)?;
        self.timeouts.validate(&self.name)?;
        Ok(())
    }
}

/// Worker launch command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment, applied on top of the parent's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Health check and restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Time between probes.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Probe timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before the restart policy kicks in.
    pub max_failures: u32,

    pub auto_restart: bool,

    #[serde(default)]
    pub restart_backoff: RestartBackoffPolicy,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_failures: 3,
            auto_restart: true,
            restart_backoff: RestartBackoffPolicy::default(),
        }
    }
}

impl HealthPolicy {
    fn validate(&self, model: &str) -> Result<()> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(Error::validation(format!(
                "model '{}': health interval and timeout must be non-zero",
                model
            )));
        }
        if self.max_failures == 0 {
            return Err(Error::validation(format!(
                "model '{}': max_failures must be at least 1",
                model
            )));
        }
        if self.restart_backoff.max_attempts == 0 {
            return Err(Error::validation(format!(
                "model '{}': restart_backoff.max_attempts must be at least 1",
                model
            )));
        }
        Ok(())
    }
}

/// What the health checker does when a restart itself fails.
///
/// Restarts are attempted up to `max_attempts` times with a fixed `delay`
/// between attempts. When all attempts fail the model is marked Dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartBackoffPolicy {
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RestartBackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(1),
        }
    }
}

/// Opaque resource-limit descriptor passed through to the worker's environment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLimits(BTreeMap<String, String>);

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Environment entries exported to the worker.
    ///
    /// Every entry becomes `MODELSERVE_RESOURCE_<KEY>`; `gpu_ids` additionally
    /// sets the device-visibility variable.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(self.0.len() + 1);
        for (key, value) in &self.0 {
            let suffix: String = key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            env.push((format!("{RESOURCE_ENV_PREFIX}{suffix}"), value.clone()));
        }
        if let Some(gpus) = self.get("gpu_ids") {
            env.push((GPU_VISIBILITY_ENV.to_string(), gpus.to_string()));
        }
        env
    }
}

/// Lifecycle timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTimeouts {
    /// Spawn-to-Ready budget.
    #[serde(with = "humantime_serde")]
    pub startup: Duration,

    /// Default per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request: Duration,

    /// How long stop() waits for a clean exit before signalling.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ModelTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            request: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ModelTimeouts {
    fn validate(&self, model: &str) -> Result<()> {
        if self.startup.is_zero() || self.request.is_zero() {
            return Err(Error::validation(format!(
                "model '{}': startup and request timeouts must be non-zero",
                model
            )));
        }
        Ok(())
    }
}
