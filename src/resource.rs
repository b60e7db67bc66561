//! Declarative resource configuration and fingerprinting.
//!
//! A [`ResourceConfig`] describes a desired remote endpoint: a serverless
//! worker pool (GPU or CPU, queue-based or load-balanced), a plain queue
//! endpoint, or a network volume. Configs are immutable after construction
//! and validated up front. Identity is a deterministic fingerprint over
//! per-kind hashed fields, so two configs with the same `resource_id` are
//! interchangeable; the broader `config_hash` detects drift in tuning
//! fields without redeploying on environment churn.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Length of the truncated hex fingerprint used as `resource_id`.
const RESOURCE_ID_LEN: usize = 16;

/// GPU hardware groups selectable for serverless workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuGroup {
    #[serde(rename = "AMPERE_16")]
    Ampere16,
    #[serde(rename = "AMPERE_24")]
    Ampere24,
    #[serde(rename = "AMPERE_48")]
    Ampere48,
    #[serde(rename = "AMPERE_80")]
    Ampere80,
    #[serde(rename = "ADA_24")]
    Ada24,
    #[serde(rename = "ADA_48_PRO")]
    Ada48Pro,
    #[serde(rename = "ADA_80_PRO")]
    Ada80Pro,
    #[serde(rename = "HOPPER_141")]
    Hopper141,
}

/// CPU instance classes, with per-instance container disk limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuInstanceType {
    #[serde(rename = "cpu3c-1-2")]
    Cpu3c1_2,
    #[serde(rename = "cpu3c-2-4")]
    Cpu3c2_4,
    #[serde(rename = "cpu3c-4-8")]
    Cpu3c4_8,
    #[serde(rename = "cpu3c-8-16")]
    Cpu3c8_16,
    #[serde(rename = "cpu3g-1-4")]
    Cpu3g1_4,
    #[serde(rename = "cpu3g-2-8")]
    Cpu3g2_8,
    #[serde(rename = "cpu3g-4-16")]
    Cpu3g4_16,
    #[serde(rename = "cpu3g-8-32")]
    Cpu3g8_32,
    #[serde(rename = "cpu5c-1-2")]
    Cpu5c1_2,
    #[serde(rename = "cpu5c-2-4")]
    Cpu5c2_4,
    #[serde(rename = "cpu5c-4-8")]
    Cpu5c4_8,
    #[serde(rename = "cpu5c-8-16")]
    Cpu5c8_16,
}

impl CpuInstanceType {
    /// Maximum container disk size supported by this instance class, in GB.
    pub fn max_disk_gb(&self) -> u32 {
        match self {
            CpuInstanceType::Cpu3c1_2 => 10,
            CpuInstanceType::Cpu3c2_4 => 20,
            CpuInstanceType::Cpu3c4_8 => 40,
            CpuInstanceType::Cpu3c8_16 => 80,
            CpuInstanceType::Cpu3g1_4 => 10,
            CpuInstanceType::Cpu3g2_8 => 20,
            CpuInstanceType::Cpu3g4_16 => 40,
            CpuInstanceType::Cpu3g8_32 => 80,
            CpuInstanceType::Cpu5c1_2 => 15,
            CpuInstanceType::Cpu5c2_4 => 30,
            CpuInstanceType::Cpu5c4_8 => 60,
            CpuInstanceType::Cpu5c8_16 => 120,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CpuInstanceType::Cpu3c1_2 => "cpu3c-1-2",
            CpuInstanceType::Cpu3c2_4 => "cpu3c-2-4",
            CpuInstanceType::Cpu3c4_8 => "cpu3c-4-8",
            CpuInstanceType::Cpu3c8_16 => "cpu3c-8-16",
            CpuInstanceType::Cpu3g1_4 => "cpu3g-1-4",
            CpuInstanceType::Cpu3g2_8 => "cpu3g-2-8",
            CpuInstanceType::Cpu3g4_16 => "cpu3g-4-16",
            CpuInstanceType::Cpu3g8_32 => "cpu3g-8-32",
            CpuInstanceType::Cpu5c1_2 => "cpu5c-1-2",
            CpuInstanceType::Cpu5c2_4 => "cpu5c-2-4",
            CpuInstanceType::Cpu5c4_8 => "cpu5c-4-8",
            CpuInstanceType::Cpu5c8_16 => "cpu5c-8-16",
        }
    }
}

/// Largest disk size valid for every instance class in `instances`.
pub fn max_disk_size_for_instances(instances: &[CpuInstanceType]) -> Option<u32> {
    instances.iter().map(CpuInstanceType::max_disk_gb).min()
}

/// Data centers for network volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataCenter {
    #[default]
    #[serde(rename = "EU-RO-1")]
    EuRo1,
    #[serde(rename = "EU-SE-1")]
    EuSe1,
    #[serde(rename = "US-KS-2")]
    UsKs2,
    #[serde(rename = "US-TX-3")]
    UsTx3,
}

impl DataCenter {
    fn as_str(&self) -> &'static str {
        match self {
            DataCenter::EuRo1 => "EU-RO-1",
            DataCenter::EuSe1 => "EU-SE-1",
            DataCenter::UsKs2 => "US-KS-2",
            DataCenter::UsTx3 => "US-TX-3",
        }
    }
}

/// HTTP methods allowed in routing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// Routing metadata for functions bound to load-balanced endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub method: HttpMethod,
    pub path: String,
}

impl Routing {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(Error::ConfigValidation(format!(
                "routing path must start with '/', got {path:?}"
            )));
        }
        Ok(Self { method, path })
    }
}

/// Discriminating tag for resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    GpuLive,
    CpuLive,
    GpuLoadBalanced,
    CpuLoadBalanced,
    NetworkVolume,
    Queue,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::GpuLive => "gpu_live",
            ResourceKind::CpuLive => "cpu_live",
            ResourceKind::GpuLoadBalanced => "gpu_load_balanced",
            ResourceKind::CpuLoadBalanced => "cpu_load_balanced",
            ResourceKind::NetworkVolume => "network_volume",
            ResourceKind::Queue => "queue",
        }
    }

    /// Load-balanced kinds require routing metadata on bound functions.
    pub fn is_load_balanced(&self) -> bool {
        matches!(self, ResourceKind::GpuLoadBalanced | ResourceKind::CpuLoadBalanced)
    }

    /// Kinds that can serve remote invocations at all.
    pub fn is_invocable(&self) -> bool {
        !matches!(self, ResourceKind::NetworkVolume)
    }

    fn is_cpu(&self) -> bool {
        matches!(self, ResourceKind::CpuLive | ResourceKind::CpuLoadBalanced)
    }

    fn is_gpu(&self) -> bool {
        matches!(self, ResourceKind::GpuLive | ResourceKind::GpuLoadBalanced)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-pool fields shared by all serverless kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerlessSpec {
    /// Container image tag.
    pub image: String,
    pub workers_min: u32,
    pub workers_max: u32,
    pub idle_timeout_seconds: u32,
    /// Required for GPU kinds, rejected for CPU kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_group: Option<GpuGroup>,
    /// Required for CPU kinds, rejected for GPU kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu_instances: Vec<CpuInstanceType>,
    /// Container disk size; for CPU kinds bounded by the instance limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    /// Environment for the worker. Excluded from fingerprints so `.env`
    /// churn never looks like drift.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Logical name of an attached network volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_volume: Option<String>,
}

impl Default for ServerlessSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            workers_min: 0,
            workers_max: 3,
            idle_timeout_seconds: 5,
            gpu_group: None,
            cpu_instances: Vec::new(),
            disk_size_gb: None,
            env: BTreeMap::new(),
            network_volume: None,
        }
    }
}

/// Network volume fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    #[serde(default)]
    pub data_center: DataCenter,
    pub size_gb: u32,
}

/// Kind-specific payload of a [`ResourceConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    GpuLive(ServerlessSpec),
    CpuLive(ServerlessSpec),
    GpuLoadBalanced(ServerlessSpec),
    CpuLoadBalanced(ServerlessSpec),
    Queue(ServerlessSpec),
    NetworkVolume(VolumeSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::GpuLive(_) => ResourceKind::GpuLive,
            ResourceSpec::CpuLive(_) => ResourceKind::CpuLive,
            ResourceSpec::GpuLoadBalanced(_) => ResourceKind::GpuLoadBalanced,
            ResourceSpec::CpuLoadBalanced(_) => ResourceKind::CpuLoadBalanced,
            ResourceSpec::Queue(_) => ResourceKind::Queue,
            ResourceSpec::NetworkVolume(_) => ResourceKind::NetworkVolume,
        }
    }

    fn serverless(&self) -> Option<&ServerlessSpec> {
        match self {
            ResourceSpec::GpuLive(s)
            | ResourceSpec::CpuLive(s)
            | ResourceSpec::GpuLoadBalanced(s)
            | ResourceSpec::CpuLoadBalanced(s)
            | ResourceSpec::Queue(s) => Some(s),
            ResourceSpec::NetworkVolume(_) => None,
        }
    }
}

/// Immutable, validated description of a desired remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    name: String,
    #[serde(flatten)]
    spec: ResourceSpec,
}

impl ResourceConfig {
    /// Validate and seal a configuration.
    pub fn new(name: impl Into<String>, spec: ResourceSpec) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::ConfigValidation("resource name must not be empty".into()));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(Error::ConfigValidation(format!(
                "resource name must not contain whitespace: {name:?}"
            )));
        }

        let kind = spec.kind();
        match &spec {
            ResourceSpec::NetworkVolume(volume) => {
                if volume.size_gb == 0 {
                    return Err(Error::ConfigValidation(
                        "volume size must be greater than zero".into(),
                    ));
                }
            }
            _ => {
                let serverless = spec.serverless().expect("serverless kinds carry a spec");
                Self::validate_serverless(&name, kind, serverless)?;
            }
        }

        Ok(Self { name, spec })
    }

    fn validate_serverless(name: &str, kind: ResourceKind, spec: &ServerlessSpec) -> Result<()> {
        if spec.image.trim().is_empty() {
            return Err(Error::ConfigValidation(format!(
                "{name}: an image tag is required"
            )));
        }
        if spec.workers_min > spec.workers_max {
            return Err(Error::ConfigValidation(format!(
                "{name}: workers_min ({}) exceeds workers_max ({})",
                spec.workers_min, spec.workers_max
            )));
        }
        if kind.is_gpu() {
            if spec.gpu_group.is_none() {
                return Err(Error::ConfigValidation(format!(
                    "{name}: {kind} requires a gpu_group"
                )));
            }
            if !spec.cpu_instances.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "{name}: {kind} must not set cpu_instances"
                )));
            }
        }
        if kind.is_cpu() {
            if spec.cpu_instances.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "{name}: {kind} requires at least one cpu instance class"
                )));
            }
            if spec.gpu_group.is_some() {
                return Err(Error::ConfigValidation(format!(
                    "{name}: {kind} must not set a gpu_group"
                )));
            }
            if let Some(disk) = spec.disk_size_gb {
                let limit = max_disk_size_for_instances(&spec.cpu_instances)
                    .expect("instance list is non-empty");
                if disk > limit {
                    let limits: Vec<String> = spec
                        .cpu_instances
                        .iter()
                        .map(|i| format!("{}: max {}GB", i.as_str(), i.max_disk_gb()))
                        .collect();
                    return Err(Error::ConfigValidation(format!(
                        "{name}: disk size {disk}GB exceeds the instance limits ({}); maximum allowed: {limit}GB",
                        limits.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    /// Deterministic identity: truncated SHA-256 over the kind tag and the
    /// canonical encoding of the kind's hashed fields. Depends only on
    /// those fields, never on tuning knobs or environment.
    pub fn resource_id(&self) -> String {
        let digest = hash_value(self.kind().as_str(), &self.hashed_fields());
        digest[..RESOURCE_ID_LEN].to_string()
    }

    /// Full-config digest used for drift detection. Covers everything the
    /// provider payload covers except the worker environment.
    pub fn config_hash(&self) -> String {
        hash_value(self.kind().as_str(), &self.drift_fields())
    }

    /// Payload handed to the provider on create.
    pub fn provider_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("resource config serializes")
    }

    fn hashed_fields(&self) -> serde_json::Value {
        match &self.spec {
            ResourceSpec::NetworkVolume(volume) => serde_json::json!({
                "name": self.name,
                "data_center": volume.data_center.as_str(),
            }),
            other => {
                let spec = other.serverless().expect("serverless kinds carry a spec");
                let mut fields = serde_json::Map::new();
                fields.insert("name".into(), self.name.clone().into());
                fields.insert("image".into(), spec.image.clone().into());
                if let Some(group) = &spec.gpu_group {
                    fields.insert(
                        "gpu_group".into(),
                        serde_json::to_value(group).expect("gpu group serializes"),
                    );
                }
                if !spec.cpu_instances.is_empty() {
                    let instances: Vec<&str> =
                        spec.cpu_instances.iter().map(CpuInstanceType::as_str).collect();
                    fields.insert(
                        "cpu_instances".into(),
                        serde_json::to_value(instances).expect("instances serialize"),
                    );
                }
                if let Some(volume) = &spec.network_volume {
                    fields.insert("network_volume".into(), volume.clone().into());
                }
                serde_json::Value::Object(fields)
            }
        }
    }

    fn drift_fields(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("resource config serializes");
        if let Some(object) = value.as_object_mut() {
            object.remove("env");
        }
        value
    }
}

fn hash_value(kind: &str, value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(value).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Deterministic JSON encoding: object keys emitted in sorted order at
/// every level, so fingerprints do not depend on map iteration order.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        serde_json::Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}
