//! In-memory stand-ins for the process layer and the resource probe.

use crate::config::ModelConfig;
use crate::orchestrator::SwapSettings;
use crate::process::{Lifecycle, ProcessError, Termination};
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::resources::{AvailableResources, ResourceProbe};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Models `a` and `b` (8 GB each) and `c` (64 GB). `a` has an alias.
pub(crate) fn test_registry() -> ModelRegistry {
    let descriptor = |id: &str, port: u16, gb: f64, aliases: &[&str]| {
        ModelDescriptor::from_config(
            ModelConfig {
                model_id: id.to_string(),
                estimated_memory_gb: Some(gb),
                command: vec!["backend".to_string(), "--port".to_string(), port.to_string()],
                working_dir: None,
                env: HashMap::new(),
                port,
                health_path: "/health".to_string(),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
                task: None,
                backend: None,
            },
            16.0,
        )
        .unwrap()
    };
    ModelRegistry::from_descriptors(vec![
        descriptor("a", 8001, 8.0, &["model-a-alias"]),
        descriptor("b", 8002, 8.0, &[]),
        descriptor("c", 8003, 64.0, &[]),
    ])
    .unwrap()
}

pub(crate) fn test_settings() -> SwapSettings {
    SwapSettings {
        grace_period: Duration::from_millis(50),
        cooldown: Duration::from_millis(20),
        launch_timeout: Duration::from_millis(100),
        health_poll_interval: Duration::from_millis(5),
    }
}

/// Records every operation. Pids are handed out from 200 upward.
pub(crate) struct FakeLifecycle {
    next_pid: AtomicU32,
    start_delay: Duration,
    starts: Mutex<Vec<String>>,
    terminations: Mutex<Vec<u32>>,
    live: Mutex<BTreeSet<u32>>,
    exited: Mutex<BTreeSet<u32>>,
    pub fail_spawn: AtomicBool,
    pub never_healthy: AtomicBool,
    pub exit_during_startup: AtomicBool,
    pub terminate_times_out: AtomicBool,
    /// Health probes succeed even for exited processes, as when something
    /// else listens on the backend's port
    pub port_taken: AtomicBool,
}

impl Default for FakeLifecycle {
    fn default() -> Self {
        Self::with_start_delay(Duration::ZERO)
    }
}

impl FakeLifecycle {
    pub(crate) fn with_start_delay(start_delay: Duration) -> Self {
        Self {
            next_pid: AtomicU32::new(200),
            start_delay,
            starts: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
            live: Mutex::new(BTreeSet::new()),
            exited: Mutex::new(BTreeSet::new()),
            fail_spawn: AtomicBool::new(false),
            never_healthy: AtomicBool::new(false),
            exit_during_startup: AtomicBool::new(false),
            terminate_times_out: AtomicBool::new(false),
            port_taken: AtomicBool::new(false),
        }
    }

    /// Treat `pid` as a running process started outside the fake.
    pub(crate) fn adopt(&self, pid: u32) {
        self.live.lock().unwrap().insert(pid);
    }

    /// Make `pid` exit on its own.
    pub(crate) fn crash(&self, pid: u32) {
        if self.live.lock().unwrap().remove(&pid) {
            self.exited.lock().unwrap().insert(pid);
        }
    }

    pub(crate) fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub(crate) fn terminations(&self) -> Vec<u32> {
        self.terminations.lock().unwrap().clone()
    }

    pub(crate) fn live_pids(&self) -> Vec<u32> {
        self.live.lock().unwrap().iter().copied().collect()
    }
}

#[async_trait]
impl Lifecycle for FakeLifecycle {
    async fn start(&self, descriptor: &ModelDescriptor) -> Result<u32, ProcessError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProcessError::SpawnFailed {
                model: descriptor.model_id.clone(),
                reason: "No such file or directory (os error 2)".to_string(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().unwrap().push(descriptor.model_id.clone());
        self.live.lock().unwrap().insert(pid);
        Ok(pid)
    }

    async fn terminate(&self, pid: u32, _grace_period: Duration) -> Termination {
        self.terminations.lock().unwrap().push(pid);
        if self.terminate_times_out.load(Ordering::SeqCst) {
            return Termination::TimedOut;
        }
        self.live.lock().unwrap().remove(&pid);
        Termination::Terminated
    }

    async fn exit_status(&self, pid: u32) -> Option<String> {
        if self.exit_during_startup.load(Ordering::SeqCst) {
            self.crash(pid);
        }
        self.exited
            .lock()
            .unwrap()
            .contains(&pid)
            .then(|| "exit status: 1".to_string())
    }

    async fn check_health(&self, _descriptor: &ModelDescriptor) -> bool {
        if self.port_taken.load(Ordering::SeqCst) {
            return true;
        }
        !self.never_healthy.load(Ordering::SeqCst) && !self.exit_during_startup.load(Ordering::SeqCst)
    }
}

/// Fixed memory readings that tests can change between swaps.
pub(crate) struct FakeResources {
    reading: Mutex<AvailableResources>,
}

impl FakeResources {
    pub(crate) fn new(ram_gb: f64, vram_gb: Option<f64>) -> Self {
        Self {
            reading: Mutex::new(AvailableResources { ram_gb, vram_gb }),
        }
    }

    pub(crate) fn set(&self, ram_gb: f64, vram_gb: Option<f64>) {
        *self.reading.lock().unwrap() = AvailableResources { ram_gb, vram_gb };
    }
}

#[async_trait]
impl ResourceProbe for FakeResources {
    async fn available_resources(&self) -> AvailableResources {
        *self.reading.lock().unwrap()
    }
}
