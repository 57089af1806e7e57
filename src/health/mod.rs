//! Health monitoring and policy-driven restarts.
//!
//! `HealthChecker` runs one independent loop per target, each ticking at the
//! target's own `health.interval`. A tick probes the worker (reserved `ping`
//! handler) and feeds the outcome into the target's [`HealthRecord`]:
//!
//! ```text
//! success ─────────────────────────────→ HEALTHY (failures = 0)
//! failure ─→ DEGRADED ─(≥ max_failures)─┬─ auto_restart ─→ RESTARTING ─┬→ HEALTHY
//!                                       │                              └→ DEAD
//!                                       └─ no auto_restart ───────────→ DEAD
//! ```

mod record;
mod target;

pub use record::{HealthRecord, HealthState, SharedHealth};
pub use target::{HealthObserver, HealthTarget, LoggingObserver};

#[cfg(test)]
pub use target::MockHealthObserver;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::manager::ModelRegistry;
use crate::types::{Error, Result};

/// What a single check did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Not started, stopped on purpose, mid-launch, or already Dead.
    Skipped,
    Healthy { latency_ms: u64 },
    Failed { error: String, consecutive_failures: u32 },
    Restarted { attempts: u32 },
    Dead { error: String },
}

/// Scheduled prober for a fixed set of targets.
pub struct HealthChecker {
    targets: Vec<Arc<dyn HealthTarget>>,
    observer: Option<Arc<dyn HealthObserver>>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl HealthChecker {
    pub fn new(targets: Vec<Arc<dyn HealthTarget>>) -> Self {
        Self {
            targets,
            observer: Some(Arc::new(LoggingObserver)),
            cancel: None,
            tasks: Vec::new(),
        }
    }

    /// Checker over every manager registered at the time of the call.
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        Self::new(
            registry
                .managers()
                .into_iter()
                .map(|manager| manager as Arc<dyn HealthTarget>)
                .collect(),
        )
    }

    /// Replace the default [`LoggingObserver`].
    pub fn with_observer(mut self, observer: Arc<dyn HealthObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Spawn one loop per target. No-op if already running.
    pub fn start(&mut self) {
        if self.cancel.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        self.tasks = self
            .targets
            .iter()
            .map(|target| {
                tokio::spawn(run_loop(
                    target.clone(),
                    self.observer.clone(),
                    cancel.child_token(),
                ))
            })
            .collect();
        tracing::info!(targets = self.targets.len(), "health_checker_started");
        self.cancel = Some(cancel);
    }

    /// Cancel every loop and wait for them to exit.
    ///
    /// A probe in flight is abandoned; a restart in flight runs to completion.
    pub async fn stop(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "health loop ended abnormally");
            }
        }
        tracing::info!("health_checker_stopped");
    }

    /// One pass over every target, concurrently.
    pub async fn check_all(&self) -> BTreeMap<String, CheckOutcome> {
        let checks = self.targets.iter().map(|target| async move {
            let outcome = check_target(target.as_ref(), self.observer.as_deref(), None).await;
            (target.name().to_string(), outcome)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    pub async fn check_one(&self, name: &str) -> Result<CheckOutcome> {
        let target = self
            .targets
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| Error::UnknownModel(name.to_string()))?;
        Ok(check_target(target.as_ref(), self.observer.as_deref(), None).await)
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field(
                "targets",
                &self.targets.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_loop(
    target: Arc<dyn HealthTarget>,
    observer: Option<Arc<dyn HealthObserver>>,
    cancel: CancellationToken,
) {
    let period = target.policy().interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let outcome = check_target(target.as_ref(), observer.as_deref(), Some(&cancel)).await;
        tracing::trace!(model = %target.name(), ?outcome, "health tick");
    }
    tracing::debug!(model = %target.name(), "health loop stopped");
}

/// Probe one target and apply the restart policy.
async fn check_target(
    target: &dyn HealthTarget,
    observer: Option<&dyn HealthObserver>,
    cancel: Option<&CancellationToken>,
) -> CheckOutcome {
    let name = target.name();
    let policy = target.policy();
    let health = target.health();

    if health.snapshot().is_dead() || target.process_state().is_idle() {
        return CheckOutcome::Skipped;
    }

    let probed = if !target.is_alive() {
        Err(Error::worker_crashed("worker process is not alive"))
    } else {
        let probe = async {
            match tokio::time::timeout(policy.timeout, target.probe(policy.timeout)).await {
                Ok(result) => result,
                Err(_) => Err(Error::RequestTimeout {
                    handler: crate::ipc::PING_HANDLER.to_string(),
                    timeout: policy.timeout,
                }),
            }
        };
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return CheckOutcome::Skipped,
                result = probe => result,
            },
            None => probe.await,
        }
    };

    let error = match probed {
        Ok(latency) => {
            health.update(|r| r.record_success(latency));
            return CheckOutcome::Healthy {
                latency_ms: latency.as_millis() as u64,
            };
        }
        Err(e) => e,
    };

    let record = health.update(|r| r.record_failure(error.to_string()));
    if let Some(observer) = observer {
        observer.on_failure(name, &record);
    }
    tracing::debug!(
        model = %name,
        consecutive_failures = record.consecutive_failures,
        error = %error,
        "health probe failed"
    );

    if record.consecutive_failures < policy.max_failures {
        return CheckOutcome::Failed {
            error: error.to_string(),
            consecutive_failures: record.consecutive_failures,
        };
    }

    if !policy.auto_restart {
        let reason = format!(
            "{} consecutive probe failures with auto_restart disabled; last: {}",
            record.consecutive_failures, error
        );
        tracing::error!(model = %name, "{}", reason);
        health.update(|r| r.mark_dead(reason.clone()));
        return CheckOutcome::Dead { error: reason };
    }

    health.update(|r| r.mark_restarting());
    tracing::warn!(model = %name, failures = record.consecutive_failures, "restarting unhealthy model");

    let backoff = &policy.restart_backoff;
    let mut last_error = String::new();
    for attempt in 1..=backoff.max_attempts {
        match target.restart().await {
            Ok(()) => {
                health.update(|r| r.mark_restarted());
                if let Some(observer) = observer {
                    observer.on_restart(name);
                }
                tracing::info!(model = %name, attempt, "model restarted");
                return CheckOutcome::Restarted { attempts: attempt };
            }
            Err(e) => {
                tracing::warn!(model = %name, attempt, error = %e, "restart attempt failed");
                last_error = e.to_string();
                if attempt < backoff.max_attempts {
                    let pause = tokio::time::sleep(backoff.delay);
                    match cancel {
                        Some(token) => tokio::select! {
                            _ = token.cancelled() => {
                                let reason = format!(
                                    "restart abandoned after {} attempt(s), health checker stopped: {}",
                                    attempt, last_error
                                );
                                tracing::warn!(model = %name, "{}", reason);
                                health.update(|r| r.mark_dead(reason.clone()));
                                return CheckOutcome::Dead { error: reason };
                            }
                            _ = pause => {}
                        },
                        None => pause.await,
                    }
                }
            }
        }
    }

    let reason = format!(
        "restart failed after {} attempt(s): {}",
        backoff.max_attempts, last_error
    );
    tracing::error!(model = %name, "{}", reason);
    health.update(|r| r.mark_dead(reason.clone()));
    CheckOutcome::Dead { error: reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use crate::types::HealthPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Probe {
        Ok,
        Fail,
        Hang,
    }

    struct FakeTarget {
        name: String,
        policy: HealthPolicy,
        state: Mutex<ProcessState>,
        alive: AtomicBool,
        probes: Mutex<VecDeque<Probe>>,
        restart_results: Mutex<VecDeque<Result<()>>>,
        probe_calls: AtomicUsize,
        restart_calls: AtomicUsize,
        abandoned_probes: Arc<AtomicUsize>,
        health: SharedHealth,
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FakeTarget {
        fn new(policy: HealthPolicy, probes: Vec<Probe>) -> Arc<Self> {
            Arc::new(Self {
                name: "fruit".into(),
                policy,
                state: Mutex::new(ProcessState::Running),
                alive: AtomicBool::new(true),
                probes: Mutex::new(probes.into()),
                restart_results: Mutex::new(VecDeque::new()),
                probe_calls: AtomicUsize::new(0),
                restart_calls: AtomicUsize::new(0),
                abandoned_probes: Arc::new(AtomicUsize::new(0)),
                health: SharedHealth::new(),
            })
        }

        fn with_restart_results(self: Arc<Self>, results: Vec<Result<()>>) -> Arc<Self> {
            *self.restart_results.lock().unwrap() = results.into();
            self
        }
    }

    #[async_trait]
    impl HealthTarget for FakeTarget {
        fn name(&self) -> &str {
            &self.name
        }

        fn policy(&self) -> HealthPolicy {
            self.policy.clone()
        }

        fn process_state(&self) -> ProcessState {
            *self.state.lock().unwrap()
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn probe(&self, timeout: Duration) -> Result<Duration> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.probes.lock().unwrap().pop_front().unwrap_or(Probe::Ok);
            match next {
                Probe::Ok => Ok(Duration::from_millis(2)),
                Probe::Fail => Err(Error::RequestTimeout {
                    handler: "ping".into(),
                    timeout,
                }),
                Probe::Hang => {
                    let _guard = DropCounter(self.abandoned_probes.clone());
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn restart(&self) -> Result<()> {
            self.restart_calls.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = ProcessState::Running;
            self.alive.store(true, Ordering::SeqCst);
            self.restart_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        fn health(&self) -> SharedHealth {
            self.health.clone()
        }
    }

    fn policy(max_failures: u32, auto_restart: bool) -> HealthPolicy {
        HealthPolicy {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(100),
            max_failures,
            auto_restart,
            ..HealthPolicy::default()
        }
    }

    fn checker(target: &Arc<FakeTarget>) -> HealthChecker {
        HealthChecker::new(vec![target.clone() as Arc<dyn HealthTarget>])
    }

    #[tokio::test]
    async fn test_three_failures_trigger_exactly_one_restart() {
        let target = FakeTarget::new(policy(3, true), vec![Probe::Fail, Probe::Fail, Probe::Fail]);
        let checker = checker(&target);

        for expected in 1..=2 {
            match checker.check_one("fruit").await.unwrap() {
                CheckOutcome::Failed {
                    consecutive_failures,
                    ..
                } => assert_eq!(consecutive_failures, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(target.health.state(), HealthState::Degraded);
        }

        assert_eq!(
            checker.check_one("fruit").await.unwrap(),
            CheckOutcome::Restarted { attempts: 1 }
        );
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 1);
        let record = target.health.snapshot();
        assert_eq!(record.state, HealthState::Healthy);
        assert_eq!(record.consecutive_failures, 0);

        assert!(matches!(
            checker.check_one("fruit").await.unwrap(),
            CheckOutcome::Healthy { .. }
        ));
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let target = FakeTarget::new(policy(3, true), vec![Probe::Fail, Probe::Fail, Probe::Ok, Probe::Fail]);
        let checker = checker(&target);
        for _ in 0..4 {
            checker.check_one("fruit").await.unwrap();
        }
        assert_eq!(target.health.snapshot().consecutive_failures, 1);
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_without_auto_restart_marks_dead_and_stops_probing() {
        let target = FakeTarget::new(policy(2, false), vec![Probe::Fail, Probe::Fail]);
        let checker = checker(&target);
        checker.check_one("fruit").await.unwrap();
        assert!(matches!(
            checker.check_one("fruit").await.unwrap(),
            CheckOutcome::Dead { .. }
        ));
        assert!(target.health.snapshot().is_dead());
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 0);

        assert_eq!(checker.check_one("fruit").await.unwrap(), CheckOutcome::Skipped);
        assert_eq!(target.probe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_backoff_then_dead() {
        let mut policy = policy(1, true);
        policy.restart_backoff.max_attempts = 3;
        policy.restart_backoff.delay = Duration::from_secs(2);
        let target = FakeTarget::new(policy, vec![Probe::Fail]).with_restart_results(vec![
            Err(Error::startup("boom 1")),
            Err(Error::startup("boom 2")),
            Err(Error::startup("boom 3")),
        ]);

        let started = Instant::now();
        let outcome = checker(&target).check_one("fruit").await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Dead { ref error } if error.contains("boom 3")));
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(target.health.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_restart_succeeds_on_second_attempt() {
        let mut policy = policy(1, true);
        policy.restart_backoff.max_attempts = 2;
        policy.restart_backoff.delay = Duration::from_millis(1);
        let target = FakeTarget::new(policy, vec![Probe::Fail])
            .with_restart_results(vec![Err(Error::startup("flaky")), Ok(())]);
        let outcome = checker(&target).check_one("fruit").await.unwrap();
        assert_eq!(outcome, CheckOutcome::Restarted { attempts: 2 });
        assert_eq!(target.health.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_dead_process_counts_failure_without_probe() {
        let target = FakeTarget::new(policy(3, true), vec![]);
        target.alive.store(false, Ordering::SeqCst);
        *target.state.lock().unwrap() = ProcessState::Crashed;
        let outcome = checker(&target).check_one("fruit").await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Failed { ref error, .. } if error.contains("not alive")));
        assert_eq!(target.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_idle_targets_are_skipped() {
        let target = FakeTarget::new(policy(1, true), vec![Probe::Fail]);
        *target.state.lock().unwrap() = ProcessState::Stopped;
        let checker = checker(&target);
        let all = checker.check_all().await;
        assert_eq!(all.get("fruit"), Some(&CheckOutcome::Skipped));
        assert_eq!(target.probe_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(checker.check_one("nope").await, Err(Error::UnknownModel(_))));
    }

    #[tokio::test]
    async fn test_observer_sees_failures_and_restart() {
        let target = FakeTarget::new(policy(2, true), vec![Probe::Fail, Probe::Fail]);
        let mut observer = MockHealthObserver::new();
        observer
            .expect_on_failure()
            .withf(|name, _| name == "fruit")
            .times(2)
            .return_const(());
        observer
            .expect_on_restart()
            .withf(|name| name == "fruit")
            .times(1)
            .return_const(());

        let checker = checker(&target).with_observer(Arc::new(observer));
        checker.check_one("fruit").await.unwrap();
        checker.check_one("fruit").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_loop_restarts_once() {
        let target = FakeTarget::new(policy(3, true), vec![Probe::Fail, Probe::Fail, Probe::Fail]);
        let mut checker = checker(&target);
        checker.start();
        assert!(checker.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.health.state(), HealthState::Healthy);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.probe_calls.load(Ordering::SeqCst), 5);

        checker.stop().await;
        assert!(!checker.is_running());
        let probes = target.probe_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.probe_calls.load(Ordering::SeqCst), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_restart_backoff() {
        let mut policy = policy(1, true);
        policy.restart_backoff.max_attempts = 5;
        policy.restart_backoff.delay = Duration::from_secs(60);
        let target = FakeTarget::new(policy, vec![Probe::Fail])
            .with_restart_results((0..5).map(|i| Err(Error::startup(format!("boom {}", i)))).collect());
        let mut checker = checker(&target);
        checker.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 1);

        let began = Instant::now();
        checker.stop().await;
        assert!(began.elapsed() < Duration::from_secs(1));
        assert_eq!(target.restart_calls.load(Ordering::SeqCst), 1);
        let record = target.health.snapshot();
        assert!(record.is_dead());
        assert!(record.last_error.unwrap().contains("health checker stopped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_in_flight_probe() {
        let mut policy = policy(3, true);
        policy.timeout = Duration::from_secs(60);
        let target = FakeTarget::new(policy, vec![Probe::Hang]);
        let mut checker = checker(&target);
        checker.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(target.probe_calls.load(Ordering::SeqCst), 1);

        checker.stop().await;
        assert_eq!(target.abandoned_probes.load(Ordering::SeqCst), 1);
        assert_eq!(target.health.snapshot().consecutive_failures, 0);
    }
}
