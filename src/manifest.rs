//! Manifest model and TTL-cached fetcher.
//!
//! The manifest is the directory mapping logical resource names and
//! function names to endpoint descriptors. The provider's store is the
//! source of truth; a local `flash_manifest.json` is the fallback, and the
//! in-memory copy is served until its TTL expires. One mutex covers the
//! whole read-decide-write sequence so concurrent callers during a refresh
//! observe a single network fetch.

use crate::cache::LruCache;
use crate::clock::{Clock, MonotonicClock};
use crate::error::Result;
use crate::provider::{HttpProviderClient, ProviderClient};
use crate::resource::ResourceKind;
use crate::singleton::Singleton;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default manifest cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Local fallback file inside the hidden state directory, overwritten by
/// successful remote pulls.
pub const MANIFEST_FILE: &str = "flash_manifest.json";

const DESCRIPTOR_CACHE_SIZE: usize = 256;

/// Endpoint descriptor stored per logical resource name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Directory of deployed resources and the functions bound to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub generated_at: String,
    /// logical name -> endpoint descriptor
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDescriptor>,
    /// function name -> logical resource name
    #[serde(default)]
    pub function_registry: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Manifest {
    /// A well-formed manifest with no resources.
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            project_name: String::new(),
            generated_at: String::new(),
            resources: BTreeMap::new(),
            function_registry: BTreeMap::new(),
            routes: None,
        }
    }

    /// Resolve a function name to its resource descriptor.
    pub fn descriptor_for_function(&self, function_name: &str) -> Option<&ResourceDescriptor> {
        let logical = self.function_registry.get(function_name)?;
        self.resources.get(logical)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    manifest: Option<Manifest>,
    loaded_at_millis: u64,
}

/// TTL-cached manifest directory with remote pull and local-file fallback.
pub struct ManifestFetcher {
    cache_ttl: Duration,
    manifest_path: PathBuf,
    provider: Arc<dyn ProviderClient>,
    clock: Arc<dyn Clock>,
    slot: tokio::sync::Mutex<CacheSlot>,
    descriptors: LruCache<String, ResourceDescriptor>,
}

impl std::fmt::Debug for ManifestFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestFetcher")
            .field("cache_ttl", &self.cache_ttl)
            .field("manifest_path", &self.manifest_path)
            .finish()
    }
}

static GLOBAL_FETCHER: Singleton<ManifestFetcher> = Singleton::new();

impl ManifestFetcher {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            manifest_path: std::env::current_dir()
                .map(|dir| dir.join(crate::manager::STATE_DIR).join(MANIFEST_FILE))
                .unwrap_or_else(|_| PathBuf::from(MANIFEST_FILE)),
            provider,
            clock: Arc::new(MonotonicClock::default()),
            slot: tokio::sync::Mutex::new(CacheSlot::default()),
            descriptors: LruCache::new(DESCRIPTOR_CACHE_SIZE),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The process-wide fetcher, built from the environment on first use.
    pub fn global() -> Result<Arc<Self>> {
        GLOBAL_FETCHER
            .get_or_try_init(|| Ok(Self::new(Arc::new(HttpProviderClient::from_env()?))))
    }

    /// The manifest, from cache, provider, local file, or empty, in that
    /// order of preference.
    ///
    /// When `mothership_id` is not given, `MOTHERSHIP_ID` from the
    /// environment is used.
    pub async fn get_manifest(&self, mothership_id: Option<&str>) -> Manifest {
        let env_mothership = std::env::var("MOTHERSHIP_ID").ok();
        let mothership_id = mothership_id.or(env_mothership.as_deref());
        let mut slot = self.slot.lock().await;
        let now = self.clock.now_millis();

        if let Some(cached) = &slot.manifest {
            let age = now.saturating_sub(slot.loaded_at_millis);
            if age < self.cache_ttl.as_millis() as u64 {
                tracing::debug!(age_millis = age, "serving cached manifest");
                return cached.clone();
            }
        }

        tracing::debug!("manifest cache expired or empty, pulling from provider");
        match self.provider.fetch_manifest(mothership_id).await {
            Ok(manifest) => {
                self.write_local_file(&manifest);
                slot.manifest = Some(manifest.clone());
                slot.loaded_at_millis = now;
                tracing::info!(
                    resources = manifest.resources.len(),
                    "manifest pulled from provider and cached"
                );
                manifest
            }
            Err(error) => {
                tracing::warn!(%error, "manifest pull failed, falling back to local file");
                match self.load_local_file() {
                    Some(manifest) => {
                        slot.manifest = Some(manifest.clone());
                        slot.loaded_at_millis = now;
                        tracing::debug!("loaded and cached manifest from local file");
                        manifest
                    }
                    // Nothing cached so the next call retries the provider.
                    None => Manifest::empty(),
                }
            }
        }
    }

    /// Resolve a logical resource name to its descriptor, via a bounded
    /// per-name cache in front of the manifest.
    pub async fn descriptor_for(&self, logical_name: &str) -> Option<ResourceDescriptor> {
        if let Some(descriptor) = self.descriptors.get(&logical_name.to_string()) {
            return Some(descriptor);
        }
        let manifest = self.get_manifest(None).await;
        let descriptor = manifest.resources.get(logical_name).cloned()?;
        self.descriptors.set(logical_name.to_string(), descriptor.clone());
        Some(descriptor)
    }

    /// Clear the cached manifest; the next call pulls from the provider.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.manifest = None;
        slot.loaded_at_millis = 0;
        self.descriptors.clear();
        tracing::debug!("manifest cache invalidated");
    }

    fn write_local_file(&self, manifest: &Manifest) {
        let result: Result<()> = (|| {
            if let Some(parent) = self.manifest_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let body = serde_json::to_string_pretty(manifest)?;
            std::fs::write(&self.manifest_path, body)?;
            Ok(())
        })();
        match result {
            Ok(()) => tracing::debug!(path = %self.manifest_path.display(), "updated local manifest file"),
            // Non-critical: the cached manifest is still valid.
            Err(error) => tracing::warn!(%error, "failed to update local manifest file"),
        }
    }

    fn load_local_file(&self) -> Option<Manifest> {
        let body = std::fs::read_to_string(&self.manifest_path).ok()?;
        match serde_json::from_str(&body) {
            Ok(manifest) => Some(manifest),
            Err(error) => {
                tracing::warn!(%error, "local manifest file is unreadable");
                None
            }
        }
    }
}
