//! Named collection of model managers.
//!
//! The registry is an ordinary value: construct it, pass it where it is
//! needed, and call [`ModelRegistry::shutdown`] when done.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::{DirectProvisioner, EnvironmentProvisioner, ModelManager, ModelStatus};
use crate::process::ProcessHandle;
use crate::types::{Error, IpcConfig, ModelConfig, Result};

/// Per-model result of a bulk operation.
pub type Outcomes = BTreeMap<String, Result<()>>;

pub struct ModelRegistry {
    ipc: IpcConfig,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    models: RwLock<BTreeMap<String, Arc<ModelManager>>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_provisioner(Arc::new(DirectProvisioner), IpcConfig::default())
    }

    /// Registry whose managers share `provisioner` and `ipc`.
    pub fn with_provisioner(provisioner: Arc<dyn EnvironmentProvisioner>, ipc: IpcConfig) -> Self {
        Self {
            ipc,
            provisioner,
            models: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<ModelManager>>> {
        self.models.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<ModelManager>>> {
        self.models.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Build and register a manager. `name` becomes the model's name.
    pub fn register(&self, name: &str, mut config: ModelConfig) -> Result<Arc<ModelManager>> {
        if self.contains(name) {
            return Err(Error::DuplicateModel(name.to_string()));
        }
        config.name = name.to_string();
        let manager = Arc::new(ModelManager::with_provisioner(
            config,
            self.provisioner.clone(),
            self.ipc.clone(),
        )?);
        self.register_manager(manager.clone())?;
        Ok(manager)
    }

    /// Register a prebuilt manager under its own name.
    pub fn register_manager(&self, manager: Arc<ModelManager>) -> Result<()> {
        let mut models = self.write();
        let name = manager.name().to_string();
        if models.contains_key(&name) {
            return Err(Error::DuplicateModel(name));
        }
        tracing::debug!(model = %name, "registered model");
        models.insert(name, manager);
        Ok(())
    }

    /// Stop and remove a model.
    pub async fn unregister(&self, name: &str) -> Result<Arc<ModelManager>> {
        let manager = self
            .write()
            .remove(name)
            .ok_or_else(|| Error::UnknownModel(name.to_string()))?;
        manager.stop().await?;
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelManager>> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn managers(&self) -> Vec<Arc<ModelManager>> {
        self.read().values().cloned().collect()
    }

    pub async fn start(&self, name: &str) -> Result<ProcessHandle> {
        self.get(name)?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.get(name)?.stop().await
    }

    /// Start every model concurrently. One failure never aborts the others.
    pub async fn start_all(&self) -> Outcomes {
        let starts = self.managers().into_iter().map(|manager| async move {
            let result = manager.start().await.map(|_| ());
            if let Err(e) = &result {
                tracing::error!(model = %manager.name(), error = %e, "model failed to start");
            }
            (manager.name().to_string(), result)
        });
        join_all(starts).await.into_iter().collect()
    }

    /// Stop every model concurrently.
    pub async fn stop_all(&self) -> Outcomes {
        let stops = self.managers().into_iter().map(|manager| async move {
            let result = manager.stop().await;
            (manager.name().to_string(), result)
        });
        join_all(stops).await.into_iter().collect()
    }

    pub fn status(&self) -> BTreeMap<String, ModelStatus> {
        self.read()
            .iter()
            .map(|(name, manager)| (name.clone(), manager.status()))
            .collect()
    }

    /// Defined teardown: stop everything.
    pub async fn shutdown(&self) -> Outcomes {
        tracing::info!(models = self.len(), "shutting down model registry");
        self.stop_all().await
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}
