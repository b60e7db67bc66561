//! Resource manager: the idempotent reconciler from declared configuration
//! to live endpoint.
//!
//! The manager owns the registry of deployed resources. `ensure` is the
//! single entry point: a registry hit with a matching config hash returns
//! immediately, concurrent requests for the same `resource_id` coalesce
//! behind one deployment, and a hash mismatch (drift) replaces the entry by
//! redeploying. Deployments adopt a same-name remote endpoint when one
//! exists, otherwise create one. State is persisted to
//! `.tetra/deployments.json` (atomic write) and rehydrated at startup; a
//! best-effort copy goes to the provider's manifest store.

use crate::error::{Error, Result};
use crate::manifest::{Manifest, ResourceDescriptor};
use crate::provider::{HttpProviderClient, ProviderClient};
use crate::resource::{ResourceConfig, ResourceKind};
use crate::singleton::Singleton;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Hidden state directory in the working directory.
pub const STATE_DIR: &str = ".tetra";

/// Registry persistence file inside [`STATE_DIR`].
pub const DEPLOYMENTS_FILE: &str = "deployments.json";

/// A resource the provider has live, plus the config that produced it.
///
/// Never mutated in place: drift replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedResource {
    config: ResourceConfig,
    endpoint_id: String,
    replica_urls: Vec<String>,
    config_hash: String,
}

impl DeployedResource {
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn kind(&self) -> ResourceKind {
        self.config.kind()
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn replica_urls(&self) -> &[String] {
        &self.replica_urls
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }
}

/// Local persistence for the deployment registry.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `.tetra/` under the current working directory.
    pub fn in_working_dir() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(cwd.join(STATE_DIR))
    }

    pub fn deployments_path(&self) -> PathBuf {
        self.dir.join(DEPLOYMENTS_FILE)
    }

    /// Read the persisted registry; a missing file is an empty registry.
    pub fn load(&self) -> Result<HashMap<String, DeployedResource>> {
        let path = self.deployments_path();
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(error) => return Err(error.into()),
        };
        Ok(serde_json::from_str(&body)?)
    }

    /// Write the registry atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, registry: &HashMap<String, DeployedResource>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.deployments_path();
        let temp = self.dir.join(format!("{DEPLOYMENTS_FILE}.tmp"));
        let body = serde_json::to_string_pretty(registry)?;
        std::fs::write(&temp, body)?;
        std::fs::rename(&temp, &target)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

type DeployShared = std::result::Result<Arc<DeployedResource>, Arc<Error>>;

#[derive(Default)]
struct ManagerState {
    registry: HashMap<String, Arc<DeployedResource>>,
    in_flight: HashMap<String, broadcast::Sender<DeployShared>>,
}

enum EnsureRole {
    Leader,
    Waiter(broadcast::Receiver<DeployShared>),
}

/// Process-wide reconciler of declared resources against the provider.
pub struct ResourceManager {
    provider: Arc<dyn ProviderClient>,
    store: StateStore,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ResourceManager")
            .field("deployed", &state.registry.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

static GLOBAL_MANAGER: Singleton<ResourceManager> = Singleton::new();

impl ResourceManager {
    /// Create a manager, rehydrating the registry from the store.
    pub fn new(provider: Arc<dyn ProviderClient>, store: StateStore) -> Self {
        let registry = match store.load() {
            Ok(loaded) => {
                if !loaded.is_empty() {
                    tracing::debug!(entries = loaded.len(), "rehydrated deployment registry");
                }
                loaded.into_iter().map(|(id, res)| (id, Arc::new(res))).collect()
            }
            Err(error) => {
                tracing::warn!(%error, "could not read persisted deployments, starting empty");
                HashMap::new()
            }
        };
        Self {
            provider,
            store,
            state: Mutex::new(ManagerState { registry, in_flight: HashMap::new() }),
        }
    }

    /// The process-wide manager, built from the environment on first use.
    pub fn global() -> Result<Arc<Self>> {
        GLOBAL_MANAGER.get_or_try_init(|| {
            let provider = Arc::new(HttpProviderClient::from_env()?);
            Ok(Self::new(provider, StateStore::in_working_dir()))
        })
    }

    /// True when the registry already holds this exact configuration.
    pub fn is_deployed(&self, config: &ResourceConfig) -> bool {
        let state = self.lock();
        state
            .registry
            .get(&config.resource_id())
            .is_some_and(|existing| existing.config_hash() == config.config_hash())
    }

    /// Registry lookup by resource id.
    pub fn get(&self, resource_id: &str) -> Option<Arc<DeployedResource>> {
        self.lock().registry.get(resource_id).cloned()
    }

    /// Snapshot of every deployed resource, sorted by name.
    pub fn list_deployed(&self) -> Vec<Arc<DeployedResource>> {
        let mut entries: Vec<Arc<DeployedResource>> =
            self.lock().registry.values().cloned().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    /// Map a configuration to a live endpoint, deploying at most once per
    /// distinct `resource_id` across concurrent callers.
    pub async fn ensure(&self, config: &ResourceConfig) -> Result<Arc<DeployedResource>> {
        let id = config.resource_id();
        let hash = config.config_hash();

        let role = {
            let mut state = self.lock();
            if let Some(existing) = state.registry.get(&id) {
                if existing.config_hash() == hash {
                    return Ok(existing.clone());
                }
                tracing::warn!(
                    resource_id = %id,
                    name = config.name(),
                    "configuration drift detected, replacing deployment"
                );
            }
            match state.in_flight.get(&id) {
                Some(sender) => EnsureRole::Waiter(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    state.in_flight.insert(id.clone(), sender);
                    EnsureRole::Leader
                }
            }
        };

        match role {
            EnsureRole::Leader => self.lead_deploy(config, &id).await,
            EnsureRole::Waiter(mut receiver) => match receiver.recv().await {
                Ok(Ok(deployed)) => Ok(deployed),
                Ok(Err(shared)) => Err(Error::from(shared)),
                // The leader went away without fulfilling (cancelled).
                Err(_) => Err(Error::ProviderUnavailable {
                    message: format!("deployment of {} was cancelled", config.name()),
                    status: None,
                }),
            },
        }
    }

    async fn lead_deploy(&self, config: &ResourceConfig, id: &str) -> Result<Arc<DeployedResource>> {
        // Removes the in-flight entry on every exit path, including
        // cancellation mid-deploy; waiters then observe a closed channel.
        let release = InFlightRelease { manager: self, id: id.to_string() };

        match self.deploy(config).await {
            Ok(deployed) => {
                let deployed = Arc::new(deployed);
                let sender = {
                    let mut state = self.lock();
                    state.registry.insert(id.to_string(), deployed.clone());
                    state.in_flight.remove(id)
                };
                std::mem::forget(release);
                self.persist_local();
                self.persist_remote().await;
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(deployed.clone()));
                }
                Ok(deployed)
            }
            Err(error) => {
                let shared = error.into_shared();
                let sender = { self.lock().in_flight.remove(id) };
                std::mem::forget(release);
                if let Some(sender) = sender {
                    let _ = sender.send(Err(shared.clone()));
                }
                Err(Error::from(shared))
            }
        }
    }

    /// Adopt a same-name remote endpoint or create a new one.
    async fn deploy(&self, config: &ResourceConfig) -> Result<DeployedResource> {
        let existing = self.provider.list(config.kind(), Some(config.name())).await?;
        let remote = match existing
            .into_iter()
            .find(|remote| remote.name == config.name() && remote.kind == config.kind())
        {
            Some(found) => {
                tracing::info!(
                    name = config.name(),
                    endpoint_id = %found.id,
                    "adopting existing remote endpoint"
                );
                found
            }
            None => {
                let created = self
                    .provider
                    .create(config.kind(), config.provider_payload())
                    .await?;
                tracing::info!(
                    name = config.name(),
                    endpoint_id = %created.id,
                    "created remote endpoint"
                );
                created
            }
        };

        Ok(DeployedResource {
            config: config.clone(),
            endpoint_id: remote.id,
            replica_urls: remote.urls,
            config_hash: config.config_hash(),
        })
    }

    /// Remove a resource by name, deleting it on the provider first.
    pub async fn undeploy(&self, name: &str) -> Result<()> {
        let (id, endpoint_id) = {
            let state = self.lock();
            state
                .registry
                .iter()
                .find(|(_, res)| res.name() == name)
                .map(|(id, res)| (id.clone(), res.endpoint_id().to_string()))
                .ok_or_else(|| Error::NotDeployed { name: name.to_string() })?
        };

        self.provider.delete(&endpoint_id).await?;
        self.lock().registry.remove(&id);
        self.persist_local();
        tracing::info!(name, endpoint_id = %endpoint_id, "resource undeployed");
        Ok(())
    }

    /// Write the registry to disk. Failures are logged, never raised: a
    /// successful deploy must not be failed by bookkeeping.
    fn persist_local(&self) {
        let snapshot: HashMap<String, DeployedResource> = self
            .lock()
            .registry
            .iter()
            .map(|(id, res)| (id.clone(), (**res).clone()))
            .collect();
        if let Err(error) = self.store.save(&snapshot) {
            tracing::warn!(%error, "failed to persist deployment state locally");
        }
    }

    /// Best-effort push of the registry to the provider's manifest store,
    /// keyed by `TETRA_ENV_ID`.
    async fn persist_remote(&self) {
        let Ok(env_id) = std::env::var("TETRA_ENV_ID") else {
            return;
        };
        let manifest = self.manifest_snapshot();
        if let Err(error) = self.provider.update_manifest(&env_id, &manifest).await {
            tracing::warn!(%error, "failed to persist deployments to the provider manifest store");
        }
    }

    /// The registry rendered as a manifest.
    pub fn manifest_snapshot(&self) -> Manifest {
        let mut manifest = Manifest::empty();
        for resource in self.lock().registry.values() {
            manifest.resources.insert(
                resource.name().to_string(),
                ResourceDescriptor {
                    kind: resource.kind(),
                    endpoint_id: Some(resource.endpoint_id().to_string()),
                    urls: resource.replica_urls().to_vec(),
                },
            );
        }
        manifest
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InFlightRelease<'a> {
    manager: &'a ResourceManager,
    id: String,
}

impl Drop for InFlightRelease<'_> {
    fn drop(&mut self) {
        self.manager.lock().in_flight.remove(&self.id);
    }
}
