//! Shared test doubles for control-plane scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tetra_rt::{
    CallEnvelope, CpuInstanceType, Error, GpuGroup, Manifest, ProviderClient, RemoteResource,
    ResourceConfig, ResourceKind, ResourceSpec, Result, ServerlessSpec,
};

/// Scriptable in-memory provider that counts every call.
#[derive(Debug, Default)]
pub struct MockProvider {
    pub remote: Mutex<Vec<RemoteResource>>,
    pub list_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub invoke_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    /// Simulated provider latency for create calls.
    pub create_delay: Duration,
    pub fail_creates: AtomicBool,
    /// Names whose create calls always fail.
    pub fail_names: Mutex<Vec<String>>,
    /// Fail the next N invokes with a retryable 503.
    pub invoke_failures_remaining: AtomicUsize,
    /// Replica URLs attached to created endpoints.
    pub replica_urls: Mutex<Vec<String>>,
    /// Manifest served by `fetch_manifest`; `None` means unavailable.
    pub manifest: Mutex<Option<Manifest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            replica_urls: Mutex::new(vec!["https://replica-1.example.com".into()]),
            ..Self::default()
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_replica_urls(self, urls: &[&str]) -> Self {
        *self.replica_urls.lock().unwrap() = urls.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_manifest(self, manifest: Manifest) -> Self {
        *self.manifest.lock().unwrap() = Some(manifest);
        self
    }

    pub fn seed_remote(&self, resource: RemoteResource) {
        self.remote.lock().unwrap().push(resource);
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn list(
        &self,
        kind: ResourceKind,
        name_filter: Option<&str>,
    ) -> Result<Vec<RemoteResource>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let remote = self.remote.lock().unwrap();
        Ok(remote
            .iter()
            .filter(|r| r.kind == kind && name_filter.map_or(true, |n| r.name == n))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        kind: ResourceKind,
        payload: serde_json::Value,
    ) -> Result<RemoteResource> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let name = payload["name"].as_str().unwrap_or("unnamed").to_string();
        if self.fail_creates.load(Ordering::SeqCst)
            || self.fail_names.lock().unwrap().contains(&name)
        {
            return Err(Error::ProviderUnavailable {
                message: format!("create of {name} failed"),
                status: Some(503),
            });
        }
        let created = RemoteResource {
            id: format!("ep-{name}"),
            name,
            kind,
            urls: self.replica_urls.lock().unwrap().clone(),
        };
        self.remote.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.remote.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn invoke(
        &self,
        _url: &str,
        envelope: &CallEnvelope,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.invoke_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.invoke_failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ProviderUnavailable {
                message: "replica hiccup".into(),
                status: Some(503),
            });
        }
        Ok(envelope.payload.clone())
    }

    async fn fetch_manifest(&self, _mothership_id: Option<&str>) -> Result<Manifest> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match self.manifest.lock().unwrap().as_ref() {
            Some(manifest) => Ok(manifest.clone()),
            None => Err(Error::ProviderUnavailable {
                message: "manifest query not yet implemented".into(),
                status: None,
            }),
        }
    }

    async fn update_manifest(&self, _env_id: &str, _manifest: &Manifest) -> Result<()> {
        Ok(())
    }
}

/// A GPU queue-based config with sensible defaults.
pub fn gpu_config(name: &str) -> ResourceConfig {
    ResourceConfig::new(
        name,
        ResourceSpec::GpuLive(ServerlessSpec {
            image: "registry.example.com/worker:v3".into(),
            gpu_group: Some(GpuGroup::Ampere24),
            ..ServerlessSpec::default()
        }),
    )
    .expect("valid gpu config")
}

/// A GPU config sharing `gpu_config`'s identity but with different tuning.
pub fn gpu_config_retuned(name: &str) -> ResourceConfig {
    ResourceConfig::new(
        name,
        ResourceSpec::GpuLive(ServerlessSpec {
            image: "registry.example.com/worker:v3".into(),
            gpu_group: Some(GpuGroup::Ampere24),
            workers_max: 10,
            idle_timeout_seconds: 120,
            ..ServerlessSpec::default()
        }),
    )
    .expect("valid gpu config")
}

/// A CPU load-balanced config.
pub fn cpu_lb_config(name: &str) -> ResourceConfig {
    ResourceConfig::new(
        name,
        ResourceSpec::CpuLoadBalanced(ServerlessSpec {
            image: "registry.example.com/api:v1".into(),
            cpu_instances: vec![CpuInstanceType::Cpu3g2_8],
            ..ServerlessSpec::default()
        }),
    )
    .expect("valid cpu config")
}
