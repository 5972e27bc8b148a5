//! Model registry: known descriptors plus per-model service state.
//!
//! The registry is the single source of truth for which backend is active.
//! Only the swap orchestrator mutates it (inside its swap lock); the request
//! fast path reads the active pointer through a `watch` channel without
//! touching the service table.

use crate::config::{Config, ModelConfig};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read model descriptors from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("model {0} has an empty launch command")]
    EmptyCommand(String),

    #[error("model {model} has invalid estimated_memory_gb: {value}")]
    InvalidMemoryEstimate { model: String, value: f64 },

    #[error("duplicate model id: {0}")]
    DuplicateModel(String),

    #[error("duplicate port {port} (models {first} and {second})")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("alias {alias} of {model} collides with another model id or alias")]
    DuplicateAlias { alias: String, model: String },
}

/// How to start a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Static description of one installed model. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub estimated_memory_gb: f64,
    /// True when `estimated_memory_gb` came from the configured default
    pub memory_defaulted: bool,
    pub launch: LaunchCommand,
    pub port: u16,
    pub health_path: String,
    pub aliases: Vec<String>,
    pub task: Option<String>,
    pub backend: Option<String>,
}

impl ModelDescriptor {
    /// Build a descriptor from its persisted form. A missing memory estimate
    /// falls back to `default_memory_gb`; zero, negative or non-finite
    /// estimates are rejected so they cannot disable the memory guard.
    pub fn from_config(
        config: ModelConfig,
        default_memory_gb: f64,
    ) -> Result<Self, RegistryError> {
        let mut command = config.command.into_iter();
        let program = command
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| RegistryError::EmptyCommand(config.model_id.clone()))?;

        let (estimated_memory_gb, memory_defaulted) = match config.estimated_memory_gb {
            Some(value) => (value, false),
            None => (default_memory_gb, true),
        };
        if !(estimated_memory_gb.is_finite() && estimated_memory_gb > 0.0) {
            return Err(RegistryError::InvalidMemoryEstimate {
                model: config.model_id,
                value: estimated_memory_gb,
            });
        }

        Ok(Self {
            model_id: config.model_id,
            estimated_memory_gb,
            memory_defaulted,
            launch: LaunchCommand {
                program,
                args: command.collect(),
                working_dir: config.working_dir,
                env: config.env,
            },
            port: config.port,
            health_path: config.health_path,
            aliases: config.aliases,
            task: config.task,
            backend: config.backend,
        })
    }
}

/// Runtime state of one model's backend.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub descriptor: Arc<ModelDescriptor>,
    pub pid: Option<u32>,
    pub active: bool,
    pub last_swap_timestamp: Option<SystemTime>,
}

impl ServiceState {
    fn new(descriptor: Arc<ModelDescriptor>) -> Self {
        Self {
            descriptor,
            pid: None,
            active: false,
            last_swap_timestamp: None,
        }
    }
}

pub struct ModelRegistry {
    descriptors: HashMap<String, Arc<ModelDescriptor>>,
    aliases: HashMap<String, String>,
    services: RwLock<HashMap<String, ServiceState>>,
    active: watch::Sender<Option<String>>,
}

impl ModelRegistry {
    /// Build the registry from inline descriptors plus every `*.json` file in
    /// `models_dir`.
    pub fn load(config: &Config) -> Result<Self, RegistryError> {
        let mut entries = config.models.clone();
        if let Some(ref dir) = config.models_dir {
            entries.extend(scan_descriptor_dir(dir)?);
        }

        let descriptors = entries
            .into_iter()
            .map(|entry| ModelDescriptor::from_config(entry, config.default_memory_gb))
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_descriptors(descriptors)
    }

    pub fn from_descriptors(descriptors: Vec<ModelDescriptor>) -> Result<Self, RegistryError> {
        let mut by_id: HashMap<String, Arc<ModelDescriptor>> = HashMap::new();
        let mut ports: HashMap<u16, String> = HashMap::new();

        for descriptor in descriptors {
            if by_id.contains_key(&descriptor.model_id) {
                return Err(RegistryError::DuplicateModel(descriptor.model_id));
            }
            if let Some(first) = ports.insert(descriptor.port, descriptor.model_id.clone()) {
                return Err(RegistryError::DuplicatePort {
                    port: descriptor.port,
                    first,
                    second: descriptor.model_id,
                });
            }
            if descriptor.memory_defaulted {
                info!(
                    model = %descriptor.model_id,
                    estimated_memory_gb = descriptor.estimated_memory_gb,
                    "No memory estimate in descriptor, using default"
                );
            }
            by_id.insert(descriptor.model_id.clone(), Arc::new(descriptor));
        }

        let mut aliases = HashMap::new();
        let mut seen: HashSet<&str> = by_id.keys().map(String::as_str).collect();
        for descriptor in by_id.values() {
            for alias in &descriptor.aliases {
                if !seen.insert(alias.as_str()) {
                    return Err(RegistryError::DuplicateAlias {
                        alias: alias.clone(),
                        model: descriptor.model_id.clone(),
                    });
                }
                aliases.insert(alias.clone(), descriptor.model_id.clone());
            }
        }

        let (active, _) = watch::channel(None);

        info!(
            model_count = by_id.len(),
            alias_count = aliases.len(),
            "Model registry loaded"
        );

        Ok(Self {
            descriptors: by_id,
            aliases,
            services: RwLock::new(HashMap::new()),
            active,
        })
    }

    /// Resolve a model id or alias to the canonical model id.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((id, _)) = self.descriptors.get_key_value(name) {
            return Some(id.as_str());
        }
        self.aliases.get(name).map(String::as_str)
    }

    pub fn descriptor(&self, model_id: &str) -> Option<Arc<ModelDescriptor>> {
        self.descriptors.get(model_id).cloned()
    }

    /// All model ids, sorted.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.descriptors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_model(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    pub fn is_active(&self, model_id: &str) -> bool {
        self.active.borrow().as_deref() == Some(model_id)
    }

    /// Watch the active pointer.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.active.subscribe()
    }

    /// Current state of a model's service. Models never touched by the
    /// orchestrator report an inactive state with no pid.
    pub async fn service(&self, model_id: &str) -> Option<ServiceState> {
        let descriptor = self.descriptors.get(model_id)?;
        let services = self.services.read().await;
        Some(
            services
                .get(model_id)
                .cloned()
                .unwrap_or_else(|| ServiceState::new(descriptor.clone())),
        )
    }

    /// Every model's service state, sorted by model id, taken under one lock.
    pub async fn snapshot(&self) -> Vec<ServiceState> {
        let services = self.services.read().await;
        let mut states: Vec<ServiceState> = self
            .descriptors
            .iter()
            .map(|(id, descriptor)| {
                services
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| ServiceState::new(descriptor.clone()))
            })
            .collect();
        states.sort_by(|a, b| a.descriptor.model_id.cmp(&b.descriptor.model_id));
        states
    }

    // -----------------------------------------------------------------------
    // Mutations (swap orchestrator only)
    // -----------------------------------------------------------------------

    /// Record a freshly spawned, not yet verified backend.
    pub(crate) async fn record_launch(&self, model_id: &str, pid: u32) {
        self.update(model_id, |state| {
            state.pid = Some(pid);
            state.active = false;
        })
        .await;
    }

    /// Clear a pid after its process was confirmed gone.
    pub(crate) async fn clear_pid(&self, model_id: &str) {
        self.update(model_id, |state| state.pid = None).await;
    }

    /// Make `model_id` the active service. Any other service still flagged
    /// active is cleared in the same critical section.
    pub(crate) async fn activate(&self, model_id: &str, pid: u32) {
        let Some(descriptor) = self.descriptors.get(model_id) else {
            return;
        };
        let mut services = self.services.write().await;
        for (id, state) in services.iter_mut() {
            if id != model_id && state.active {
                state.active = false;
                state.pid = None;
                metrics::gauge!("zoomux_active_model", "model" => id.clone()).set(0.0);
            }
        }
        let state = services
            .entry(model_id.to_string())
            .or_insert_with(|| ServiceState::new(descriptor.clone()));
        state.active = true;
        state.pid = Some(pid);
        state.last_swap_timestamp = Some(SystemTime::now());
        self.active.send_replace(Some(model_id.to_string()));
        metrics::gauge!("zoomux_active_model", "model" => model_id.to_string()).set(1.0);
        debug!(model = %model_id, pid, "Registry: service active");
    }

    /// Mark a service inactive. The pid is cleared only when the process is
    /// confirmed gone; an unconfirmed pid is kept for diagnostics.
    pub(crate) async fn deactivate(&self, model_id: &str, confirmed_exit: bool) {
        let Some(descriptor) = self.descriptors.get(model_id) else {
            return;
        };
        let mut services = self.services.write().await;
        let state = services
            .entry(model_id.to_string())
            .or_insert_with(|| ServiceState::new(descriptor.clone()));
        state.active = false;
        if confirmed_exit {
            state.pid = None;
        }
        state.last_swap_timestamp = Some(SystemTime::now());
        if self.is_active(model_id) {
            self.active.send_replace(None);
        }
        metrics::gauge!("zoomux_active_model", "model" => model_id.to_string()).set(0.0);
        debug!(model = %model_id, confirmed_exit, "Registry: service inactive");
    }

    async fn update(&self, model_id: &str, f: impl FnOnce(&mut ServiceState)) {
        let Some(descriptor) = self.descriptors.get(model_id) else {
            return;
        };
        let mut services = self.services.write().await;
        let state = services
            .entry(model_id.to_string())
            .or_insert_with(|| ServiceState::new(descriptor.clone()));
        f(state);
    }
}

/// Read every `*.json` descriptor file in `dir`, in file-name order.
fn scan_descriptor_dir(dir: &Path) -> Result<Vec<ModelConfig>, RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            debug!(path = %path.display(), "Reading model descriptor");
            let contents = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&contents).map_err(|source| RegistryError::Parse { path, source })
        })
        .collect()
}
