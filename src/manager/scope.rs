//! Scoped use of a model: start, run, always stop.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::ModelManager;
use crate::types::{Error, Result};

/// Start `manager`, run `op`, and stop the manager on every exit path.
///
/// A panic inside `op` is caught, the manager is still stopped, and the
/// panic surfaces as [`Error::Internal`].
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use modelserve::{ModelConfig, ModelManager, Payload};
/// # async fn demo() -> modelserve::Result<()> {
/// let manager = Arc::new(ModelManager::new(ModelConfig::new("fruit", "/opt/fruit/worker"))?);
/// let reply = modelserve::with_started(manager, |m| async move {
///     m.request("classify", Payload::new()).await
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_started<F, Fut, T>(manager: Arc<ModelManager>, op: F) -> Result<T>
where
    F: FnOnce(Arc<ModelManager>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    manager.start().await?;

    let outcome = AssertUnwindSafe(async { op(manager.clone()).await })
        .catch_unwind()
        .await;

    if let Err(e) = manager.stop().await {
        tracing::warn!(model = %manager.name(), error = %e, "stop after scoped use failed");
    }

    match outcome {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(model = %manager.name(), panic = %panic_msg, "panic_recovered");
            Err(Error::internal(format!(
                "panic while using model '{}': {}",
                manager.name(),
                panic_msg
            )))
        }
    }
}

pub(crate) fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
