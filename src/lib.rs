#![forbid(unsafe_code)]

//! # tetra-rt
//!
//! Control plane for remote serverless execution. Mark a function or class
//! as remote, declare the resource it needs, and every call is routed to an
//! on-demand GPU/CPU endpoint with production reliability policies applied.
//!
//! ## What's inside
//!
//! - **Resource manager**: idempotent reconciler from a declarative
//!   [`ResourceConfig`] to a live endpoint. Registry hits short-circuit,
//!   concurrent requests for the same resource coalesce behind a single
//!   deployment, configuration drift replaces the entry, and state persists
//!   across processes.
//! - **Deployment orchestrator**: bounded-parallel fan-out for bulk
//!   provisioning with per-item accounting.
//! - **Reliability runtime**: retry with jittered exponential backoff, a
//!   three-state circuit breaker per replica URL, and a load balancer with
//!   pluggable selection.
//! - **Manifest fetcher**: TTL-cached directory of logical names to
//!   endpoint descriptors, pulled from the provider with a local-file
//!   fallback.
//!
//! ## Quick start
//!
//! ```no_run
//! use tetra_rt::{
//!     register_remote, GpuGroup, Invocation, ResourceConfig, ResourceSpec, ServerlessSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tetra_rt::Result<()> {
//!     let config = ResourceConfig::new(
//!         "gpu_worker",
//!         ResourceSpec::GpuLive(ServerlessSpec {
//!             image: "registry.example.com/worker:v3".into(),
//!             gpu_group: Some(GpuGroup::Ampere24),
//!             ..ServerlessSpec::default()
//!         }),
//!     )?;
//!
//!     // Deploys on first call (or adopts an endpoint with the same name),
//!     // then routes through retry, circuit breaking, and load balancing.
//!     let binding = register_remote("infer", config, None)?;
//!     match binding.call(b"serialized-args".to_vec()).await? {
//!         Invocation::Response(bytes) => println!("{} bytes back", bytes.len()),
//!         Invocation::Passthrough => unreachable!("not running on a worker"),
//!     }
//!     Ok(())
//! }
//! ```

mod backoff;
mod cache;
mod circuit_breaker;
mod clock;
mod config;
mod deployment;
mod error;
mod invoke;
mod jitter;
mod load_balancer;
mod manager;
mod manifest;
mod pause;
mod provider;
mod resource;
mod retry;
mod singleton;

// Re-exports
pub use backoff::Backoff;
pub use cache::LruCache;
pub use circuit_breaker::{
    BreakerStats, CircuitBreakerRegistry, CircuitState, EndpointCircuitBreaker, EndpointHealth,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    reliability_config, set_reliability_config, CircuitBreakerSettings, LoadBalancerSettings,
    MetricsSettings, ReliabilityConfig, RetrySettings, Strategy,
};
pub use deployment::{
    DeploymentOrchestrator, DeploymentResult, DeploymentStatus, DEFAULT_MAX_CONCURRENT,
};
pub use error::{Error, Result};
pub use invoke::{
    register_remote, register_remote_class, running_on_worker, CallEnvelope, Invocation,
    RemoteBinding, RemoteRuntime, RemoteSession, SessionEnvelope, DEFAULT_CALL_TIMEOUT,
};
pub use jitter::Jitter;
pub use load_balancer::{LoadBalancer, RequestGuard};
pub use manager::{
    DeployedResource, ResourceManager, StateStore, DEPLOYMENTS_FILE, STATE_DIR,
};
pub use manifest::{
    Manifest, ManifestFetcher, ResourceDescriptor, DEFAULT_CACHE_TTL, MANIFEST_FILE,
};
pub use pause::{NoPause, RecordingPause, RetryPause, TimerPause};
pub use provider::{HttpProviderClient, ProviderClient, RemoteResource};
pub use resource::{
    max_disk_size_for_instances, CpuInstanceType, DataCenter, GpuGroup, HttpMethod,
    ResourceConfig, ResourceKind, ResourceSpec, Routing, ServerlessSpec, VolumeSpec,
};
pub use retry::{RetryPolicy, RetryPredicate};
pub use singleton::Singleton;

pub mod prelude;
