//! Remote invocation facade.
//!
//! An author-annotated function becomes an explicit [`RemoteBinding`]:
//! the declared resource plus optional routing metadata. Each call ensures
//! the endpoint exists, picks a replica, and dispatches the serialized
//! payload through the reliability runtime: retry wrapping a per-replica
//! circuit breaker, bracketed by the balancer's in-flight accounting.
//! Decorated classes become [`RemoteSession`]s whose constructor payload is
//! captured once and re-shipped with every method call.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{reliability_config, ReliabilityConfig, RetrySettings};
use crate::error::{Error, Result};
use crate::load_balancer::LoadBalancer;
use crate::manager::ResourceManager;
use crate::provider::{HttpProviderClient, ProviderClient};
use crate::resource::{ResourceConfig, Routing};
use crate::retry::RetryPolicy;
use crate::singleton::Singleton;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default provider-call timeout for invocations.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire envelope for one remote call. The payload is an opaque byte string
/// produced by the caller's serializer; it travels base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub function_name: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
}

impl CallEnvelope {
    pub fn new(
        function_name: impl Into<String>,
        payload: Vec<u8>,
        routing: Option<Routing>,
    ) -> Self {
        Self { function_name: function_name.into(), payload, routing }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Outcome of [`RemoteBinding::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// The process is already running on a worker; the caller executes the
    /// function locally instead of dialing the provider.
    Passthrough,
    /// The provider's response body.
    Response(Vec<u8>),
}

impl Invocation {
    /// The response bytes, if this was a remote invocation.
    pub fn into_response(self) -> Option<Vec<u8>> {
        match self {
            Invocation::Response(bytes) => Some(bytes),
            Invocation::Passthrough => None,
        }
    }
}

/// True when worker-presence variables mark this process as running
/// remotely.
pub fn running_on_worker() -> bool {
    ["TETRA_POD_ID", "TETRA_ENDPOINT_ID"]
        .iter()
        .any(|var| std::env::var(var).map_or(false, |v| !v.trim().is_empty()))
}

/// Shared reliability runtime behind every binding: resource manager,
/// per-replica breakers, balancer, and retry settings.
pub struct RemoteRuntime {
    manager: Arc<ResourceManager>,
    provider: Arc<dyn ProviderClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: LoadBalancer,
    balancer_enabled: bool,
    retry_settings: RetrySettings,
    call_timeout: Duration,
}

impl std::fmt::Debug for RemoteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRuntime")
            .field("balancer", &self.balancer)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

static GLOBAL_RUNTIME: Singleton<RemoteRuntime> = Singleton::new();

impl RemoteRuntime {
    pub fn new(
        manager: Arc<ResourceManager>,
        provider: Arc<dyn ProviderClient>,
        config: &ReliabilityConfig,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let balancer =
            LoadBalancer::new(config.load_balancer.strategy).with_health(breakers.clone());
        Self {
            manager,
            provider,
            breakers,
            balancer,
            balancer_enabled: config.load_balancer.enabled,
            retry_settings: config.retry.clone(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// The process-wide runtime, assembled from the global manager and the
    /// environment-loaded reliability configuration.
    pub fn global() -> Result<Arc<Self>> {
        GLOBAL_RUNTIME.get_or_try_init(|| {
            let manager = ResourceManager::global()?;
            let provider = Arc::new(HttpProviderClient::from_env()?);
            Ok(Self::new(manager, provider, &reliability_config()))
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    /// Pick a replica. With the balancer disabled this degrades to the
    /// first healthy URL; breaker filtering applies either way.
    fn select_replica(&self, urls: &[String]) -> Option<String> {
        use crate::circuit_breaker::EndpointHealth as _;
        if self.balancer_enabled {
            self.balancer.select(urls)
        } else {
            urls.iter().find(|url| self.breakers.is_available(url.as_str())).cloned()
        }
    }
}

/// Bind a function to its resource and routing, using the process-wide
/// runtime.
pub fn register_remote(
    function_name: impl Into<String>,
    config: ResourceConfig,
    routing: Option<Routing>,
) -> Result<RemoteBinding> {
    RemoteBinding::new(RemoteRuntime::global()?, function_name, config, routing)
}

/// Bind a class to its resource: constructor arguments are captured once
/// and re-supplied with every method call.
pub fn register_remote_class(
    class_name: impl Into<String>,
    config: ResourceConfig,
    routing: Option<Routing>,
    constructor_payload: Vec<u8>,
) -> Result<RemoteSession> {
    RemoteSession::new(RemoteRuntime::global()?, class_name, config, routing, constructor_payload)
}

/// One annotated function bound to a declared resource.
#[derive(Debug, Clone)]
pub struct RemoteBinding {
    runtime: Arc<RemoteRuntime>,
    function_name: String,
    config: ResourceConfig,
    routing: Option<Routing>,
}

impl RemoteBinding {
    /// Validate and create a binding against an explicit runtime.
    ///
    /// Load-balanced kinds require routing metadata; other kinds ignore it
    /// with a warning. Volumes cannot be bound at all.
    pub fn new(
        runtime: Arc<RemoteRuntime>,
        function_name: impl Into<String>,
        config: ResourceConfig,
        routing: Option<Routing>,
    ) -> Result<Self> {
        let function_name = function_name.into();
        if !config.kind().is_invocable() {
            return Err(Error::ConfigValidation(format!(
                "{}: a {} resource cannot serve remote calls",
                function_name,
                config.kind()
            )));
        }

        let routing = if config.kind().is_load_balanced() {
            match routing {
                Some(routing) => Some(routing),
                None => {
                    return Err(Error::ConfigValidation(format!(
                        "{function_name}: {} resources require method and path routing",
                        config.kind()
                    )));
                }
            }
        } else {
            if routing.is_some() {
                tracing::warn!(
                    function = %function_name,
                    kind = %config.kind(),
                    "routing metadata is only used with load-balanced resources; ignoring"
                );
            }
            None
        };

        Ok(Self { runtime, function_name, config, routing })
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Dispatch one call with the runtime's default timeout.
    pub async fn call(&self, payload: Vec<u8>) -> Result<Invocation> {
        self.call_with_timeout(payload, self.runtime.call_timeout).await
    }

    /// Dispatch one call: ensure endpoint → select replica → retry around
    /// the replica's circuit breaker. In-flight accounting is released on
    /// every exit path.
    pub async fn call_with_timeout(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Invocation> {
        if running_on_worker() {
            tracing::debug!(function = %self.function_name, "worker environment detected, passing through");
            return Ok(Invocation::Passthrough);
        }

        let deployed = self.runtime.manager.ensure(&self.config).await?;
        let urls = deployed.replica_urls();
        let url = self
            .runtime
            .select_replica(urls)
            .ok_or(Error::AllReplicasUnhealthy { total: urls.len() })?;

        let envelope =
            CallEnvelope::new(self.function_name.clone(), payload, self.routing.clone());
        let breaker = self.runtime.breakers.get_or_create(&url);
        let retry =
            RetryPolicy::from_settings(&self.runtime.retry_settings).with_breaker(breaker.clone());

        let _guard = self.runtime.balancer.track(&url);
        let response = retry
            .execute(|| {
                let breaker = breaker.clone();
                let provider = self.runtime.provider.clone();
                let url = url.clone();
                let envelope = envelope.clone();
                async move {
                    breaker
                        .execute(|| {
                            let provider = provider.clone();
                            let url = url.clone();
                            let envelope = envelope.clone();
                            async move { provider.invoke(&url, &envelope, timeout).await }
                        })
                        .await
                }
            })
            .await?;

        Ok(Invocation::Response(response))
    }
}

/// Method-call payload shipped for class bindings: the captured constructor
/// payload plus the method and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    #[serde(with = "base64_bytes")]
    pub constructor_payload: Vec<u8>,
    pub method_name: String,
    #[serde(with = "base64_bytes")]
    pub args: Vec<u8>,
}

/// A decorated class bound as a remote session.
///
/// There is no replica affinity: the provider may serve each method call
/// from a different replica, so the constructor payload rides along every
/// time.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    class_name: String,
    constructor_payload: Vec<u8>,
    binding: RemoteBinding,
}

impl RemoteSession {
    pub fn new(
        runtime: Arc<RemoteRuntime>,
        class_name: impl Into<String>,
        config: ResourceConfig,
        routing: Option<Routing>,
        constructor_payload: Vec<u8>,
    ) -> Result<Self> {
        let class_name = class_name.into();
        let binding = RemoteBinding::new(runtime, class_name.clone(), config, routing)?;
        Ok(Self { class_name, constructor_payload, binding })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Invoke one method remotely.
    pub async fn call_method(&self, method_name: &str, args: Vec<u8>) -> Result<Invocation> {
        let envelope = SessionEnvelope {
            constructor_payload: self.constructor_payload.clone(),
            method_name: method_name.to_string(),
            args,
        };
        let payload = serde_json::to_vec(&envelope)?;
        let mut binding = self.binding.clone();
        binding.function_name = format!("{}.{method_name}", self.class_name);
        binding.call(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::manager::StateStore;
    use crate::manifest::Manifest;
    use crate::provider::RemoteResource;
    use crate::resource::{
        CpuInstanceType, GpuGroup, HttpMethod, ResourceKind, ResourceSpec, ServerlessSpec,
        VolumeSpec,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct EchoProvider {
        invocations: AtomicUsize,
        fail_first: bool,
        seen_envelopes: Mutex<Vec<CallEnvelope>>,
        seen_urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderClient for EchoProvider {
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
            let name = payload["name"].as_str().unwrap_or("unnamed").to_string();
            Ok(RemoteResource {
                id: format!("ep-{name}"),
                name,
                kind,
                urls: vec![
                    "https://replica-a.example.com".into(),
                    "https://replica-b.example.com".into(),
                ],
            })
        }

        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn invoke(
            &self,
            url: &str,
            envelope: &CallEnvelope,
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(Error::ProviderUnavailable {
                    message: "transient".into(),
                    status: Some(503),
                });
            }
            self.seen_urls.lock().unwrap().push(url.to_string());
            self.seen_envelopes.lock().unwrap().push(envelope.clone());
            Ok(envelope.payload.clone())
        }

        async fn fetch_manifest(&self, _mothership_id: Option<&str>) -> Result<Manifest> {
            Ok(Manifest::empty())
        }

        async fn update_manifest(&self, _env_id: &str, _manifest: &Manifest) -> Result<()> {
            Ok(())
        }
    }

    fn queue_config(name: &str) -> ResourceConfig {
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

    fn lb_config(name: &str) -> ResourceConfig {
        ResourceConfig::new(
            name,
            ResourceSpec::CpuLoadBalanced(ServerlessSpec {
                image: "registry.example.com/api:v1".into(),
                cpu_instances: vec![CpuInstanceType::Cpu3g2_8],
                ..ServerlessSpec::default()
            }),
        )
        .unwrap()
    }

    fn runtime_with(provider: Arc<EchoProvider>, dir: &std::path::Path) -> Arc<RemoteRuntime> {
        let manager = Arc::new(ResourceManager::new(
            provider.clone(),
            StateStore::new(dir.join(crate::manager::STATE_DIR)),
        ));
        let mut config = ReliabilityConfig::default();
        config.load_balancer.enabled = true;
        config.load_balancer.strategy = Strategy::RoundRobin;
        Arc::new(RemoteRuntime::new(manager, provider, &config))
    }

    #[test]
    fn envelope_payload_travels_as_base64() {
        let envelope = CallEnvelope::new("fn", vec![0xde, 0xad, 0xbe, 0xef], None);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"], "3q2+7w==");

        let back: CallEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn load_balanced_binding_requires_routing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(Arc::new(EchoProvider::default()), dir.path());

        let err = RemoteBinding::new(runtime.clone(), "api_fn", lb_config("api"), None)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));

        let routing = Routing::new(HttpMethod::Post, "/api/process").unwrap();
        assert!(RemoteBinding::new(runtime, "api_fn", lb_config("api"), Some(routing)).is_ok());
    }

    #[test]
    fn queue_binding_ignores_routing_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(Arc::new(EchoProvider::default()), dir.path());
        let routing = Routing::new(HttpMethod::Get, "/ignored").unwrap();

        let binding =
            RemoteBinding::new(runtime, "gpu_fn", queue_config("gpu"), Some(routing)).unwrap();
        assert!(binding.routing.is_none());
    }

    #[test]
    fn volumes_cannot_be_bound() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(Arc::new(EchoProvider::default()), dir.path());
        let volume = ResourceConfig::new(
            "models",
            ResourceSpec::NetworkVolume(VolumeSpec {
                data_center: Default::default(),
                size_gb: 100,
            }),
        )
        .unwrap();

        let err = RemoteBinding::new(runtime, "fn", volume, None).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
    }

    #[tokio::test]
    async fn call_dispatches_through_ensure_select_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider::default());
        let runtime = runtime_with(provider.clone(), dir.path());
        let binding =
            RemoteBinding::new(runtime.clone(), "gpu_fn", queue_config("gpu"), None).unwrap();

        let outcome = binding.call(b"payload".to_vec()).await.unwrap();
        assert_eq!(outcome, Invocation::Response(b"payload".to_vec()));

        let seen = provider.seen_envelopes.lock().unwrap();
        assert_eq!(seen[0].function_name, "gpu_fn");
        assert!(seen[0].routing.is_none());

        // The in-flight bracket was released.
        let stats = runtime.balancer.stats();
        assert!(stats.values().all(|&count| count == 0));
    }

    #[tokio::test]
    async fn round_robin_spreads_calls_across_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider::default());
        let runtime = runtime_with(provider.clone(), dir.path());
        let binding =
            RemoteBinding::new(runtime, "gpu_fn", queue_config("gpu"), None).unwrap();

        for _ in 0..4 {
            binding.call(vec![]).await.unwrap();
        }
        let urls = provider.seen_urls.lock().unwrap();
        assert_eq!(
            *urls,
            vec![
                "https://replica-a.example.com",
                "https://replica-b.example.com",
                "https://replica-a.example.com",
                "https://replica-b.example.com",
            ]
        );
    }

    #[tokio::test]
    async fn transient_failure_is_retried_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider { fail_first: true, ..Default::default() });
        let runtime = runtime_with(provider.clone(), dir.path());
        let binding =
            RemoteBinding::new(runtime, "gpu_fn", queue_config("gpu"), None).unwrap();

        let outcome = binding.call(b"x".to_vec()).await.unwrap();
        assert_eq!(outcome, Invocation::Response(b"x".to_vec()));
        assert_eq!(provider.invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_replicas_unhealthy_surfaces_without_dialing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider::default());
        let runtime = runtime_with(provider.clone(), dir.path());
        let binding =
            RemoteBinding::new(runtime.clone(), "gpu_fn", queue_config("gpu"), None).unwrap();

        // Deploy once, then force both replica breakers open.
        binding.call(vec![]).await.unwrap();
        for url in ["https://replica-a.example.com", "https://replica-b.example.com"] {
            let breaker = runtime.breakers.get_or_create(url);
            for _ in 0..5 {
                let _ = breaker
                    .execute(|| async {
                        Err::<(), _>(Error::ProviderUnavailable {
                            message: "down".into(),
                            status: None,
                        })
                    })
                    .await;
            }
        }

        let before = provider.invocations.load(Ordering::SeqCst);
        let err = binding.call(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::AllReplicasUnhealthy { total: 2 }));
        assert_eq!(provider.invocations.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn routed_binding_ships_method_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider::default());
        let runtime = runtime_with(provider.clone(), dir.path());
        let routing = Routing::new(HttpMethod::Post, "/api/process").unwrap();
        let binding =
            RemoteBinding::new(runtime, "api_fn", lb_config("api"), Some(routing.clone()))
                .unwrap();

        binding.call(b"{}".to_vec()).await.unwrap();

        let seen = provider.seen_envelopes.lock().unwrap();
        assert_eq!(seen[0].routing.as_ref(), Some(&routing));
    }

    #[tokio::test]
    async fn session_ships_constructor_payload_with_every_method_call() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(EchoProvider::default());
        let runtime = runtime_with(provider.clone(), dir.path());
        let session = RemoteSession::new(
            runtime,
            "Summarizer",
            queue_config("gpu"),
            None,
            b"ctor-args".to_vec(),
        )
        .unwrap();

        session.call_method("summarize", b"doc-1".to_vec()).await.unwrap();
        session.call_method("summarize", b"doc-2".to_vec()).await.unwrap();

        let seen = provider.seen_envelopes.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for (envelope, expected_args) in seen.iter().zip([b"doc-1".as_slice(), b"doc-2".as_slice()]) {
            assert_eq!(envelope.function_name, "Summarizer.summarize");
            let inner: SessionEnvelope = serde_json::from_slice(&envelope.payload).unwrap();
            assert_eq!(inner.constructor_payload, b"ctor-args");
            assert_eq!(inner.method_name, "summarize");
            assert_eq!(inner.args, expected_args);
        }
    }
}
