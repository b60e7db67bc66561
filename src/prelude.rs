//! Convenience re-exports for typical control-plane usage.
//!
//! ```
//! use tetra_rt::prelude::*;
//! ```

pub use crate::{
    register_remote, register_remote_class, CircuitState, DeploymentOrchestrator,
    DeploymentStatus, Error, GpuGroup, HttpMethod, Invocation, ReliabilityConfig, RemoteBinding,
    RemoteRuntime, RemoteSession, ResourceConfig, ResourceKind, ResourceManager, ResourceSpec,
    Result, Routing, ServerlessSpec, Strategy, VolumeSpec,
};
