//! Bulk provisioning: bounded-parallel fan-out over declared resources.
//!
//! Each resource goes through the resource manager under a semaphore. One
//! failing item never aborts its siblings; failures are captured into the
//! per-item result and the resource deploys on demand at first call
//! instead.

use crate::manager::ResourceManager;
use crate::resource::ResourceConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Default number of concurrent deployments.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Outcome class of one item in a bulk deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    /// The registry already held this exact configuration.
    Cached,
    /// A provider round-trip produced or adopted an endpoint.
    Success,
    /// The deployment failed; the error is captured in the result.
    Failed,
}

/// Per-item accounting for a bulk deployment.
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub resource_name: String,
    pub status: DeploymentStatus,
    pub duration: Duration,
    pub endpoint_id: Option<String>,
    pub error: Option<String>,
}

/// Orchestrates parallel resource deployment with per-item results.
#[derive(Debug, Clone)]
pub struct DeploymentOrchestrator {
    manager: Arc<ResourceManager>,
    max_concurrent: usize,
}

impl DeploymentOrchestrator {
    pub fn new(manager: Arc<ResourceManager>) -> Self {
        Self { manager, max_concurrent: DEFAULT_MAX_CONCURRENT }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Deploy every resource, at most `max_concurrent` at a time.
    ///
    /// Returns one result per input, in input order. When `show_progress`
    /// is set a summary line is logged at the end.
    pub async fn deploy_all(
        &self,
        resources: &[ResourceConfig],
        show_progress: bool,
    ) -> Vec<DeploymentResult> {
        if resources.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let tasks = resources
            .iter()
            .map(|resource| self.deploy_one(resource.clone(), semaphore.clone()));
        let results = futures::future::join_all(tasks).await;

        if show_progress {
            self.log_summary(&results);
        }
        results
    }

    /// Fire-and-forget variant: spawns the fan-out on a detached task and
    /// returns immediately. Failures are logged; the affected resources
    /// deploy on demand at their first call.
    pub fn deploy_all_background(&self, resources: Vec<ResourceConfig>) {
        if resources.is_empty() {
            tracing::debug!("no resources to deploy");
            return;
        }
        tracing::info!(count = resources.len(), "auto-provisioning resources in background");
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let results = orchestrator.deploy_all(&resources, false).await;
            let failed = results
                .iter()
                .filter(|r| r.status == DeploymentStatus::Failed)
                .count();
            if failed > 0 {
                tracing::warn!(
                    failed,
                    total = results.len(),
                    "background provisioning finished with failures; they will deploy on-demand"
                );
            }
        });
    }

    async fn deploy_one(
        &self,
        resource: ResourceConfig,
        semaphore: Arc<Semaphore>,
    ) -> DeploymentResult {
        let start = Instant::now();
        let _permit = semaphore.acquire().await.expect("semaphore is never closed");

        if self.manager.is_deployed(&resource) {
            let deployed = self.manager.get(&resource.resource_id());
            return DeploymentResult {
                resource_name: resource.name().to_string(),
                status: DeploymentStatus::Cached,
                duration: start.elapsed(),
                endpoint_id: deployed.map(|d| d.endpoint_id().to_string()),
                error: None,
            };
        }

        match self.manager.ensure(&resource).await {
            Ok(deployed) => DeploymentResult {
                resource_name: resource.name().to_string(),
                status: DeploymentStatus::Success,
                duration: start.elapsed(),
                endpoint_id: Some(deployed.endpoint_id().to_string()),
                error: None,
            },
            Err(error) => {
                tracing::error!(name = resource.name(), %error, "deployment failed");
                DeploymentResult {
                    resource_name: resource.name().to_string(),
                    status: DeploymentStatus::Failed,
                    duration: start.elapsed(),
                    endpoint_id: None,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    fn log_summary(&self, results: &[DeploymentResult]) {
        let cached = results.iter().filter(|r| r.status == DeploymentStatus::Cached).count();
        let deployed = results.iter().filter(|r| r.status == DeploymentStatus::Success).count();
        let failed = results.iter().filter(|r| r.status == DeploymentStatus::Failed).count();
        let total_time: Duration = results.iter().map(|r| r.duration).sum();

        if failed > 0 {
            tracing::warn!(
                total = results.len(),
                cached,
                deployed,
                failed,
                elapsed_secs = total_time.as_secs_f64(),
                "provisioning completed with failures; failed resources deploy on-demand at first call"
            );
        } else {
            tracing::info!(
                total = results.len(),
                cached,
                deployed,
                elapsed_secs = total_time.as_secs_f64(),
                "provisioning completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::invoke::CallEnvelope;
    use crate::manager::StateStore;
    use crate::manifest::Manifest;
    use crate::provider::{ProviderClient, RemoteResource};
    use crate::resource::{GpuGroup, ResourceKind, ResourceSpec, ServerlessSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct SlowProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_names: Vec<String>,
    }

    #[async_trait]
    impl ProviderClient for SlowProvider {
        async fn list(
            &self,
            _kind: ResourceKind,
            _name_filter: Option<&str>,
        ) -> Result<Vec<RemoteResource>> {
            Ok(Vec::new())
        }

        async fn create(
            &self,
            kind: ResourceKind,
            payload: serde_json::Value,
        ) -> Result<RemoteResource> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let name = payload["name"].as_str().unwrap_or("unnamed").to_string();
            if self.fail_names.contains(&name) {
                return Err(Error::ProviderUnavailable {
                    message: format!("{name} exploded"),
                    status: Some(503),
                });
            }
            Ok(RemoteResource {
                id: format!("ep-{name}"),
                name,
                kind,
                urls: vec!["https://replica-1.example.com".into()],
            })
        }

        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn invoke(
            &self,
            _url: &str,
            _envelope: &CallEnvelope,
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            unimplemented!("not used by orchestrator tests")
        }

        async fn fetch_manifest(&self, _mothership_id: Option<&str>) -> Result<Manifest> {
            Ok(Manifest::empty())
        }

        async fn update_manifest(&self, _env_id: &str, _manifest: &Manifest) -> Result<()> {
            Ok(())
        }
    }

    fn config(name: &str) -> ResourceConfig {
        ResourceConfig::new(
            name,
            ResourceSpec::GpuLive(ServerlessSpec {
                image: "registry.example.com/worker:v3".into(),
                gpu_group: Some(GpuGroup::Ampere24),
                ..ServerlessSpec::default()
            }),
        )
        .unwrap()
    }

    fn orchestrator_in(
        dir: &std::path::Path,
        provider: Arc<SlowProvider>,
    ) -> DeploymentOrchestrator {
        let manager = Arc::new(ResourceManager::new(
            provider,
            StateStore::new(dir.join(crate::manager::STATE_DIR)),
        ));
        DeploymentOrchestrator::new(manager)
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path(), Arc::new(SlowProvider::default()));
        assert!(orchestrator.deploy_all(&[], true).await.is_empty());
    }

    #[tokio::test]
    async fn results_preserve_input_order_and_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(SlowProvider {
            fail_names: vec!["worker_b".into()],
            ..SlowProvider::default()
        });
        let orchestrator = orchestrator_in(dir.path(), provider);

        let resources = vec![config("worker_a"), config("worker_b"), config("worker_c")];
        let results = orchestrator.deploy_all(&resources, false).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].resource_name, "worker_a");
        assert_eq!(results[0].status, DeploymentStatus::Success);
        assert_eq!(results[0].endpoint_id.as_deref(), Some("ep-worker_a"));

        assert_eq!(results[1].status, DeploymentStatus::Failed);
        assert!(results[1].error.as_deref().unwrap().contains("worker_b"));
        assert!(results[1].endpoint_id.is_none());

        // A failing sibling does not abort the others.
        assert_eq!(results[2].status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn already_deployed_resources_report_cached() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(SlowProvider::default());
        let orchestrator = orchestrator_in(dir.path(), provider);

        let resources = vec![config("worker_a")];
        orchestrator.deploy_all(&resources, false).await;
        let results = orchestrator.deploy_all(&resources, false).await;

        assert_eq!(results[0].status, DeploymentStatus::Cached);
        assert_eq!(results[0].endpoint_id.as_deref(), Some("ep-worker_a"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_semaphore() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(SlowProvider::default());
        let orchestrator =
            orchestrator_in(dir.path(), provider.clone()).with_max_concurrent(2);

        let resources: Vec<ResourceConfig> =
            (0..6).map(|i| config(&format!("worker_{i}"))).collect();
        let results = orchestrator.deploy_all(&resources, false).await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.status == DeploymentStatus::Success));
        assert!(
            provider.max_in_flight.load(Ordering::SeqCst) <= 2,
            "observed more than max_concurrent provider calls in flight"
        );
    }

    #[tokio::test]
    async fn background_mode_returns_immediately_and_deploys() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(SlowProvider::default());
        let orchestrator = orchestrator_in(dir.path(), provider);
        let manager = orchestrator.manager.clone();

        let resource = config("worker_bg");
        orchestrator.deploy_all_background(vec![resource.clone()]);
        assert!(!manager.is_deployed(&resource), "background deploy has not finished yet");

        // Wait for the detached task to finish.
        for _ in 0..100 {
            if manager.is_deployed(&resource) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background deployment never completed");
    }
}
