//! Environment provisioning boundary.
//!
//! Whatever prepares a model's dependencies (virtual environments, package
//! installs) sits behind [`EnvironmentProvisioner`]. The core calls it once
//! before every launch and treats any failure as a startup error.

use async_trait::async_trait;

use crate::process::LaunchSpec;
use crate::types::{ModelConfig, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Make the environment ready and return the command to launch.
    async fn ensure(&self, config: &ModelConfig) -> Result<LaunchSpec>;
}

/// Uses the configured command as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectProvisioner;

#[async_trait]
impl EnvironmentProvisioner for DirectProvisioner {
    async fn ensure(&self, config: &ModelConfig) -> Result<LaunchSpec> {
        Ok(LaunchSpec::from_config(config))
    }
}
