//! Swap orchestrator that keeps exactly one backend resident.
//!
//! A swap attempt walks `Checking → Terminating → CoolingDown → Launching →
//! Verifying` and ends in `Active` or `Failed`. Attempts run in spawned tasks
//! under one global swap lock, so at most one is in flight process-wide and a
//! caller that stops waiting never cancels a half-finished swap.
//!
//! Callers for the same target coalesce: each target has a pending queue and
//! a `scheduled` flag guarded by the same mutex. The first caller schedules an
//! attempt, later callers attach to it, and the attempt's single outcome is
//! fanned out to every queued caller.
//!
//! Every activated backend gets a watcher that polls its exit status. A
//! backend that dies on its own is reaped under the swap lock and marked
//! inactive, so the next request for it launches a fresh process.

use crate::config::SwapConfig;
use crate::process::{Lifecycle, Termination};
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::resources::ResourceProbe;
use crate::types::{SwapError, SwapPhase, SwapTicket};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Timing knobs for the state machine.
#[derive(Debug, Clone)]
pub struct SwapSettings {
    pub grace_period: Duration,
    pub cooldown: Duration,
    pub launch_timeout: Duration,
    pub health_poll_interval: Duration,
}

impl From<&SwapConfig> for SwapSettings {
    fn from(config: &SwapConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            cooldown: config.cooldown(),
            launch_timeout: config.launch_timeout(),
            health_poll_interval: config.health_poll_interval(),
        }
    }
}

type Waiter = oneshot::Sender<Result<(), SwapError>>;

/// Callers waiting on a target, plus whether an attempt is already queued.
#[derive(Default)]
struct PendingSwap {
    waiters: Vec<Waiter>,
    scheduled: bool,
}

/// How a caller joined the swap machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// First caller for the target; an attempt was spawned
    Scheduled,
    /// An attempt for the target was already queued or running
    Coalesced,
}

struct OrchestratorInner {
    registry: Arc<ModelRegistry>,
    lifecycle: Arc<dyn Lifecycle>,
    resources: Arc<dyn ResourceProbe>,
    settings: SwapSettings,
    /// Held for the whole of an attempt
    swap_lock: Mutex<()>,
    pending: HashMap<String, Mutex<PendingSwap>>,
    phase: watch::Sender<SwapPhase>,
    /// Set once by `shutdown`; no backend is launched or verified afterwards
    shutting_down: AtomicBool,
}

/// Serializes swaps and owns every registry mutation.
pub struct SwapOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Clone for SwapOrchestrator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SwapOrchestrator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        lifecycle: Arc<dyn Lifecycle>,
        resources: Arc<dyn ResourceProbe>,
        settings: SwapSettings,
    ) -> Self {
        let pending = registry
            .model_ids()
            .into_iter()
            .map(|id| (id, Mutex::new(PendingSwap::default())))
            .collect();
        let (phase, _) = watch::channel(SwapPhase::Idle);

        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                lifecycle,
                resources,
                settings,
                swap_lock: Mutex::new(()),
                pending,
                phase,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn resources(&self) -> &Arc<dyn ResourceProbe> {
        &self.inner.resources
    }

    pub fn phase(&self) -> SwapPhase {
        self.inner.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SwapPhase> {
        self.inner.phase.subscribe()
    }

    /// Make `model` (an id or alias) the active backend.
    ///
    /// Returns immediately when it already is. Otherwise joins (or schedules)
    /// a swap attempt and waits for its terminal state.
    pub async fn switch_to(&self, model: &str) -> Result<(), SwapError> {
        let model_id = self
            .inner
            .registry
            .resolve(model)
            .ok_or_else(|| SwapError::ModelNotFound(model.to_string()))?
            .to_string();

        if self.inner.registry.is_active(&model_id) {
            trace!(model = %model_id, "Model already active");
            return Ok(());
        }
        if self.is_shutting_down() {
            return Err(SwapError::ShuttingDown);
        }

        let outcome = self.submit(&model_id).await?;
        outcome.await.unwrap_or_else(|_| {
            Err(SwapError::Internal(
                "swap task ended without reporting an outcome".to_string(),
            ))
        })
    }

    /// Terminate the active backend without starting another one.
    ///
    /// Returns the model that was stopped, if any.
    pub async fn stop_active(&self) -> Result<Option<String>, SwapError> {
        let _guard = self.inner.swap_lock.lock().await;
        let Some(model) = self.inner.registry.active_model() else {
            return Ok(None);
        };
        info!(model = %model, "Stopping active backend");
        let result = self.retire(&model).await;
        self.set_phase(SwapPhase::Idle);
        result.map(|()| Some(model))
    }

    /// Refuse further swaps, abandon a launch still being verified and stop
    /// the active backend.
    pub async fn shutdown(&self) -> Result<Option<String>, SwapError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        info!("Orchestrator shutting down");
        self.stop_active().await
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Private
    // -----------------------------------------------------------------------

    async fn submit(
        &self,
        model_id: &str,
    ) -> Result<oneshot::Receiver<Result<(), SwapError>>, SwapError> {
        let pending = self
            .inner
            .pending
            .get(model_id)
            .ok_or_else(|| SwapError::ModelNotFound(model_id.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let admission = {
            let mut pending = pending.lock().await;
            pending.waiters.push(tx);
            debug!(model = %model_id, queue_depth = pending.waiters.len(), "Request queued");
            if pending.scheduled {
                Admission::Coalesced
            } else {
                pending.scheduled = true;
                Admission::Scheduled
            }
        };

        match admission {
            Admission::Scheduled => {
                debug!(model = %model_id, "Scheduling swap attempt");
                let orchestrator = self.clone();
                let target = model_id.to_string();
                tokio::spawn(async move {
                    orchestrator.run_attempt(&target).await;
                });
            }
            Admission::Coalesced => {
                debug!(model = %model_id, "Swap already scheduled, attaching to its outcome");
            }
        }

        Ok(rx)
    }

    async fn run_attempt(&self, target: &str) {
        let _guard = self.inner.swap_lock.lock().await;

        if self.is_shutting_down() {
            self.notify_pending(target, Err(SwapError::ShuttingDown)).await;
            return;
        }

        // The registry may have changed while this attempt waited for the lock.
        if self.inner.registry.is_active(target) && !self.reap_if_exited(target).await {
            debug!(model = %target, "Target became active while queued");
            self.notify_pending(target, Ok(())).await;
            return;
        }

        let mut ticket = SwapTicket::new(target);
        let from = self.inner.registry.active_model();
        info!(from = ?from, to = %target, "Starting model swap");

        let result = self.execute(target).await;
        ticket.resolve(&result);

        let elapsed = ticket.elapsed();
        let outcome = match ticket.failure_reason {
            None => {
                info!(model = %target, duration = ?elapsed, "Model is now active");
                self.set_phase(SwapPhase::Active {
                    model: target.to_string(),
                });
                "success"
            }
            Some(ref e) => {
                error!(model = %target, duration = ?elapsed, error = %e, "Swap failed");
                self.set_phase(SwapPhase::Failed {
                    target: target.to_string(),
                    reason: e.to_string(),
                });
                e.code()
            }
        };
        metrics::counter!("zoomux_swap_total", "outcome" => outcome).increment(1);
        metrics::histogram!("zoomux_swap_duration_seconds").record(elapsed.as_secs_f64());

        self.notify_pending(target, result).await;
        self.set_phase(SwapPhase::Idle);
    }

    /// One swap attempt, from the memory check to a verified backend.
    async fn execute(&self, target: &str) -> Result<(), SwapError> {
        let registry = &self.inner.registry;
        let descriptor = registry
            .descriptor(target)
            .ok_or_else(|| SwapError::ModelNotFound(target.to_string()))?;

        // Checking
        self.set_phase(SwapPhase::Checking {
            target: target.to_string(),
        });
        let reading = self.inner.resources.available_resources().await;
        if !reading.admits(descriptor.estimated_memory_gb) {
            let mut detail = format!(
                "needs {:.1} GB, {:.1} GB RAM free",
                descriptor.estimated_memory_gb, reading.ram_gb
            );
            if let Some(vram) = reading.vram_gb {
                detail.push_str(&format!(", {:.1} GB VRAM free", vram));
            }
            warn!(model = %target, detail = %detail, "Not enough memory for swap");
            return Err(SwapError::InsufficientMemory {
                model: target.to_string(),
                detail,
            });
        }
        // Nothing is reserved: memory freed or taken by other processes
        // between now and launch is only noticed if the backend dies.
        debug!(
            model = %target,
            estimated_gb = descriptor.estimated_memory_gb,
            ram_gb = reading.ram_gb,
            vram_gb = ?reading.vram_gb,
            "Memory check passed (advisory reading)"
        );

        // Terminating(old) + CoolingDown
        if let Some(previous) = registry.active_model() {
            self.retire(&previous).await?;

            let cooldown = self.inner.settings.cooldown;
            self.set_phase(SwapPhase::CoolingDown {
                target: target.to_string(),
            });
            info!(cooldown = ?cooldown, "Cooling down before launch");
            tokio::time::sleep(cooldown).await;
        }

        if self.is_shutting_down() {
            return Err(SwapError::ShuttingDown);
        }

        // Launching(new)
        self.set_phase(SwapPhase::Launching {
            target: target.to_string(),
        });
        let pid = self
            .inner
            .lifecycle
            .start(&descriptor)
            .await
            .map_err(|e| SwapError::LaunchFailure {
                model: target.to_string(),
                reason: e.to_string(),
            })?;
        registry.record_launch(target, pid).await;

        // Verifying
        self.set_phase(SwapPhase::Verifying {
            target: target.to_string(),
            pid,
        });
        self.verify(&descriptor, pid).await?;

        registry.activate(target, pid).await;
        self.watch_backend(target, pid);
        Ok(())
    }

    /// Terminate the active backend and mark it inactive.
    ///
    /// On timeout the service is still marked inactive: it is presumed dead
    /// or dying and is not resurrected.
    async fn retire(&self, model: &str) -> Result<(), SwapError> {
        let registry = &self.inner.registry;
        self.set_phase(SwapPhase::Terminating {
            model: model.to_string(),
        });

        let Some(pid) = registry.service(model).await.and_then(|s| s.pid) else {
            warn!(model = %model, "Active service has no pid, marking inactive");
            registry.deactivate(model, true).await;
            return Ok(());
        };

        info!(model = %model, pid, "Terminating active backend");
        match self
            .inner
            .lifecycle
            .terminate(pid, self.inner.settings.grace_period)
            .await
        {
            Termination::Terminated => {
                registry.deactivate(model, true).await;
                Ok(())
            }
            Termination::TimedOut => {
                error!(model = %model, pid, "Backend did not exit, marking inactive anyway");
                registry.deactivate(model, false).await;
                Err(SwapError::TerminationTimeout {
                    model: model.to_string(),
                })
            }
        }
    }

    /// Poll the new backend until it is healthy, it dies, or the launch
    /// timeout passes. Failed launches are torn down before returning.
    async fn verify(&self, descriptor: &ModelDescriptor, pid: u32) -> Result<(), SwapError> {
        let model = &descriptor.model_id;
        let timeout = self.inner.settings.launch_timeout;
        let started = Instant::now();

        loop {
            if self.is_shutting_down() {
                warn!(model = %model, pid, "Shutdown during startup, discarding backend");
                self.discard_launch(model, pid).await;
                return Err(SwapError::ShuttingDown);
            }

            // Another listener on the port can answer the probe, so a healthy
            // response only counts while our process is still running.
            let healthy = self.inner.lifecycle.check_health(descriptor).await;
            if let Some(status) = self.inner.lifecycle.exit_status(pid).await {
                warn!(model = %model, pid, status = %status, "Backend exited before becoming healthy");
                self.discard_launch(model, pid).await;
                return Err(SwapError::LaunchFailure {
                    model: model.clone(),
                    reason: format!("process exited during startup ({})", status),
                });
            }
            if healthy {
                info!(model = %model, pid, waited = ?started.elapsed(), "Backend is healthy");
                return Ok(());
            }

            if started.elapsed() >= timeout {
                warn!(model = %model, pid, timeout = ?timeout, "Backend never became healthy");
                self.discard_launch(model, pid).await;
                return Err(SwapError::HealthCheckTimeout {
                    model: model.clone(),
                    timeout,
                });
            }

            trace!(model = %model, "Backend not ready yet");
            tokio::time::sleep(self.inner.settings.health_poll_interval).await;
        }
    }

    async fn discard_launch(&self, model: &str, pid: u32) {
        match self
            .inner
            .lifecycle
            .terminate(pid, self.inner.settings.grace_period)
            .await
        {
            Termination::Terminated => self.inner.registry.clear_pid(model).await,
            Termination::TimedOut => {
                error!(model = %model, pid, "Half-started backend survived SIGKILL");
            }
        }
    }

    /// Poll an activated backend until it is retired or exits on its own.
    fn watch_backend(&self, model: &str, pid: u32) {
        let orchestrator = self.clone();
        let model = model.to_string();
        tokio::spawn(async move {
            let interval = orchestrator.inner.settings.health_poll_interval;
            loop {
                tokio::time::sleep(interval).await;
                if !orchestrator.serving(&model, pid).await {
                    trace!(model = %model, pid, "Backend retired, watcher done");
                    return;
                }
                if orchestrator.inner.lifecycle.exit_status(pid).await.is_none() {
                    continue;
                }
                let _guard = orchestrator.inner.swap_lock.lock().await;
                // A swap may have retired it while we waited for the lock.
                if orchestrator.serving(&model, pid).await {
                    orchestrator.reap_if_exited(&model).await;
                }
                return;
            }
        });
    }

    /// Whether `model` is active with `pid` as its process.
    async fn serving(&self, model: &str, pid: u32) -> bool {
        self.inner
            .registry
            .service(model)
            .await
            .is_some_and(|s| s.active && s.pid == Some(pid))
    }

    /// If `model`'s process has exited, take down what is left of its group
    /// and mark it inactive. Returns true when it had exited. Callers hold
    /// the swap lock.
    async fn reap_if_exited(&self, model: &str) -> bool {
        let registry = &self.inner.registry;
        let Some(pid) = registry.service(model).await.and_then(|s| s.pid) else {
            return false;
        };
        let Some(status) = self.inner.lifecycle.exit_status(pid).await else {
            return false;
        };

        error!(model = %model, pid, status = %status, "Backend exited unexpectedly");
        metrics::counter!("zoomux_backend_exits_total").increment(1);
        let confirmed = self
            .inner
            .lifecycle
            .terminate(pid, self.inner.settings.grace_period)
            .await
            == Termination::Terminated;
        registry.deactivate(model, confirmed).await;
        true
    }

    fn set_phase(&self, phase: SwapPhase) {
        debug!(phase = phase.label(), "Swap phase");
        self.inner.phase.send_replace(phase);
    }

    async fn notify_pending(&self, model: &str, result: Result<(), SwapError>) {
        let Some(pending) = self.inner.pending.get(model) else {
            return;
        };
        let mut pending = pending.lock().await;
        pending.scheduled = false;

        let count = pending.waiters.len();
        let mut delivered = 0;
        for waiter in pending.waiters.drain(..) {
            if waiter.send(result.clone()).is_ok() {
                delivered += 1;
            }
        }

        if count > 0 {
            let expired = count - delivered;
            if expired > 0 {
                warn!(model = %model, count, delivered, expired,
                    "Notified pending requests ({expired} already gave up)");
            } else {
                debug!(model = %model, count, "Notified pending requests");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLifecycle, FakeResources, test_registry, test_settings};

    fn orchestrator(
        lifecycle: &Arc<FakeLifecycle>,
        resources: &Arc<FakeResources>,
    ) -> SwapOrchestrator {
        SwapOrchestrator::new(
            Arc::new(test_registry()),
            lifecycle.clone(),
            resources.clone(),
            test_settings(),
        )
    }

    /// Registry has `a` active with pid 100, as if a previous swap happened.
    async fn with_a_active(orchestrator: &SwapOrchestrator, lifecycle: &FakeLifecycle) {
        lifecycle.adopt(100);
        orchestrator.registry().activate("a", 100).await;
    }

    #[tokio::test]
    async fn test_swap_terminates_old_and_activates_new() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        with_a_active(&orchestrator, &lifecycle).await;
        let mut phases = orchestrator.subscribe_phase();

        let started = Instant::now();
        orchestrator.switch_to("b").await.unwrap();
        assert!(phases.has_changed().unwrap());

        assert_eq!(lifecycle.terminations(), vec![100]);
        assert_eq!(lifecycle.starts(), vec!["b".to_string()]);
        assert!(started.elapsed() >= test_settings().cooldown);

        let registry = orchestrator.registry();
        assert_eq!(registry.active_model().as_deref(), Some("b"));
        let b = registry.service("b").await.unwrap();
        assert!(b.active);
        assert_eq!(b.pid, Some(200));
        let a = registry.service("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.pid, None);
        assert_eq!(orchestrator.phase(), SwapPhase::Idle);
    }

    #[tokio::test]
    async fn test_requesting_active_model_is_a_noop() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        orchestrator.switch_to("a").await.unwrap();
        assert_eq!(lifecycle.starts().len(), 1);

        orchestrator.switch_to("a").await.unwrap();
        assert_eq!(lifecycle.starts().len(), 1);
        assert!(lifecycle.terminations().is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_skips_termination() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        let started = Instant::now();
        orchestrator.switch_to("a").await.unwrap();
        assert!(lifecycle.terminations().is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(orchestrator.registry().is_active("a"));
    }

    #[tokio::test]
    async fn test_insufficient_memory_leaves_previous_untouched() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(4.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        with_a_active(&orchestrator, &lifecycle).await;

        let result = orchestrator.switch_to("b").await;
        assert!(matches!(result, Err(SwapError::InsufficientMemory { .. })));

        let a = orchestrator.registry().service("a").await.unwrap();
        assert!(a.active);
        assert_eq!(a.pid, Some(100));
        assert!(lifecycle.starts().is_empty());
        assert!(lifecycle.terminations().is_empty());
    }

    #[tokio::test]
    async fn test_known_vram_is_enforced() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(128.0, Some(6.0)));
        let orchestrator = orchestrator(&lifecycle, &resources);

        let result = orchestrator.switch_to("b").await;
        assert!(matches!(result, Err(SwapError::InsufficientMemory { .. })));

        resources.set(128.0, Some(24.0));
        orchestrator.switch_to("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_cold_start_insufficient_memory_spawns_nothing() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        let result = orchestrator.switch_to("c").await;
        assert!(matches!(result, Err(SwapError::InsufficientMemory { .. })));
        assert_eq!(orchestrator.registry().active_model(), None);
        assert!(lifecycle.starts().is_empty());
    }

    #[tokio::test]
    async fn test_termination_timeout_clears_active_flag() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        with_a_active(&orchestrator, &lifecycle).await;
        lifecycle.terminate_times_out.store(true, Ordering::SeqCst);

        let result = orchestrator.switch_to("b").await;
        assert_eq!(
            result,
            Err(SwapError::TerminationTimeout {
                model: "a".to_string()
            })
        );

        let registry = orchestrator.registry();
        assert_eq!(registry.active_model(), None);
        let a = registry.service("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.pid, Some(100));
        assert!(!registry.service("b").await.unwrap().active);
        assert!(lifecycle.starts().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_active_service() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        with_a_active(&orchestrator, &lifecycle).await;
        lifecycle.fail_spawn.store(true, Ordering::SeqCst);

        let result = orchestrator.switch_to("b").await;
        assert!(matches!(result, Err(SwapError::LaunchFailure { .. })));

        let registry = orchestrator.registry();
        assert_eq!(registry.active_model(), None);
        assert_eq!(registry.service("a").await.unwrap().pid, None);
        assert_eq!(registry.service("b").await.unwrap().pid, None);
    }

    #[tokio::test]
    async fn test_health_timeout_terminates_half_started_backend() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        lifecycle.never_healthy.store(true, Ordering::SeqCst);

        let result = orchestrator.switch_to("a").await;
        assert!(matches!(result, Err(SwapError::HealthCheckTimeout { .. })));

        assert_eq!(lifecycle.terminations(), vec![200]);
        assert!(lifecycle.live_pids().is_empty());
        let a = orchestrator.registry().service("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.pid, None);
    }

    #[tokio::test]
    async fn test_exit_during_startup_is_launch_failure() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        lifecycle.exit_during_startup.store(true, Ordering::SeqCst);

        let result = orchestrator.switch_to("a").await;
        match result {
            Err(SwapError::LaunchFailure { reason, .. }) => {
                assert!(reason.contains("exited during startup"))
            }
            other => panic!("expected launch failure, got {:?}", other),
        }
        assert!(lifecycle.live_pids().is_empty());
        assert_eq!(orchestrator.registry().active_model(), None);
    }

    #[tokio::test]
    async fn test_healthy_port_does_not_mask_exited_process() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        lifecycle.port_taken.store(true, Ordering::SeqCst);
        lifecycle.exit_during_startup.store(true, Ordering::SeqCst);

        let result = orchestrator.switch_to("a").await;
        assert!(matches!(result, Err(SwapError::LaunchFailure { .. })));

        let registry = orchestrator.registry();
        assert_eq!(registry.active_model(), None);
        let a = registry.service("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.pid, None);
    }

    #[tokio::test]
    async fn test_crashed_backend_is_deactivated_and_relaunched() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        orchestrator.switch_to("a").await.unwrap();
        let mut active = orchestrator.registry().subscribe();
        lifecycle.crash(200);

        tokio::time::timeout(Duration::from_secs(5), active.wait_for(|m| m.is_none()))
            .await
            .expect("crashed backend should be marked inactive")
            .unwrap();
        let a = orchestrator.registry().service("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.pid, None);
        // Leftover group members are cleaned up
        assert_eq!(lifecycle.terminations(), vec![200]);

        orchestrator.switch_to("a").await.unwrap();
        assert_eq!(lifecycle.starts(), vec!["a".to_string(), "a".to_string()]);
        assert_eq!(orchestrator.registry().service("a").await.unwrap().pid, Some(201));
    }

    #[tokio::test]
    async fn test_retired_backend_is_not_reaped_twice() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        orchestrator.switch_to("a").await.unwrap();
        orchestrator.switch_to("b").await.unwrap();
        // Let the watcher of `a` run a few polls after its retirement
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(lifecycle.terminations(), vec![200]);
        assert!(orchestrator.registry().is_active("b"));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_launch_being_verified() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        lifecycle.never_healthy.store(true, Ordering::SeqCst);
        let settings = SwapSettings {
            launch_timeout: Duration::from_secs(30),
            ..test_settings()
        };
        let orchestrator = SwapOrchestrator::new(
            Arc::new(test_registry()),
            lifecycle.clone(),
            resources,
            settings,
        );
        let mut phases = orchestrator.subscribe_phase();

        let swap = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.switch_to("a").await })
        };
        phases
            .wait_for(|p| matches!(p, SwapPhase::Verifying { .. }))
            .await
            .unwrap();

        let started = Instant::now();
        assert_eq!(orchestrator.shutdown().await, Ok(None));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(swap.await.unwrap(), Err(SwapError::ShuttingDown));

        assert!(lifecycle.live_pids().is_empty());
        assert_eq!(orchestrator.registry().service("a").await.unwrap().pid, None);
        assert_eq!(orchestrator.switch_to("b").await, Err(SwapError::ShuttingDown));
        assert_eq!(lifecycle.starts(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_then_retry_succeeds() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        lifecycle.fail_spawn.store(true, Ordering::SeqCst);

        assert!(orchestrator.switch_to("a").await.is_err());

        lifecycle.fail_spawn.store(false, Ordering::SeqCst);
        orchestrator.switch_to("a").await.unwrap();
        assert!(orchestrator.registry().is_active("a"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_swap() {
        let lifecycle = Arc::new(FakeLifecycle::with_start_delay(Duration::from_millis(50)));
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        with_a_active(&orchestrator, &lifecycle).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.switch_to("b").await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(lifecycle.starts(), vec!["b".to_string()]);
        assert_eq!(lifecycle.terminations(), vec![100]);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let lifecycle = Arc::new(FakeLifecycle::with_start_delay(Duration::from_millis(50)));
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);
        lifecycle.never_healthy.store(true, Ordering::SeqCst);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.switch_to("a").await })
            })
            .collect();

        let mut codes = Vec::new();
        for handle in handles {
            codes.push(handle.await.unwrap().unwrap_err().code());
        }
        assert!(codes.iter().all(|c| *c == "health_check_timeout"));
        assert_eq!(lifecycle.starts().len(), 1);
    }

    #[tokio::test]
    async fn test_different_targets_serialize() {
        let lifecycle = Arc::new(FakeLifecycle::with_start_delay(Duration::from_millis(20)));
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let registry = orchestrator.registry().clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut max_active = 0;
                while !stop.load(Ordering::SeqCst) {
                    let active = registry.snapshot().await.iter().filter(|s| s.active).count();
                    max_active = max_active.max(active);
                    tokio::task::yield_now().await;
                }
                max_active
            })
        };

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.switch_to("a").await })
        };
        let second = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.switch_to("b").await })
        };
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));

        stop.store(true, Ordering::SeqCst);
        assert!(watcher.await.unwrap() <= 1);

        assert_eq!(lifecycle.starts().len(), 2);
        assert_eq!(lifecycle.live_pids().len(), 1);
        let active: Vec<_> = orchestrator
            .registry()
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_alias_and_unknown_model() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        assert_eq!(
            orchestrator.switch_to("nope").await,
            Err(SwapError::ModelNotFound("nope".to_string()))
        );
        orchestrator.switch_to("model-a-alias").await.unwrap();
        assert!(orchestrator.registry().is_active("a"));
    }

    #[tokio::test]
    async fn test_stop_active() {
        let lifecycle = Arc::new(FakeLifecycle::default());
        let resources = Arc::new(FakeResources::new(32.0, None));
        let orchestrator = orchestrator(&lifecycle, &resources);

        assert_eq!(orchestrator.stop_active().await, Ok(None));

        orchestrator.switch_to("a").await.unwrap();
        assert_eq!(orchestrator.stop_active().await, Ok(Some("a".to_string())));
        assert_eq!(orchestrator.registry().active_model(), None);
        assert!(lifecycle.live_pids().is_empty());
    }
}
