//! Provider API contract and its HTTP implementation.
//!
//! The control plane only needs a small capability set from the provider:
//! list/create/delete of remote resources, invocation of a replica URL,
//! and manifest pull/push. Everything else about the provider's API is
//! opaque. [`HttpProviderClient`] is the production implementation; tests
//! substitute mock clients.

use crate::error::{Error, Result};
use crate::invoke::CallEnvelope;
use crate::manifest::Manifest;
use crate::resource::ResourceKind;
use async_trait::async_trait;
use std::time::Duration;

/// Default provider API root; override with `TETRA_API_BASE_URL`.
const DEFAULT_BASE_URL: &str = "https://api.tetra-compute.io/v1";

/// Descriptor the provider returns for every remote resource.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemoteResource {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Capability set the control plane requires from the provider.
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    /// Resources of `kind`, optionally filtered by exact name.
    async fn list(
        &self,
        kind: ResourceKind,
        name_filter: Option<&str>,
    ) -> Result<Vec<RemoteResource>>;

    /// Create a resource from a declarative payload.
    async fn create(
        &self,
        kind: ResourceKind,
        payload: serde_json::Value,
    ) -> Result<RemoteResource>;

    /// Delete a resource by provider id.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Send a call envelope to a replica URL and return the response body.
    async fn invoke(
        &self,
        url: &str,
        envelope: &CallEnvelope,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    /// Pull the manifest from the provider's store. May fail with
    /// [`Error::ProviderUnavailable`] when the store cannot serve it; the
    /// manifest fetcher falls back on any failure.
    async fn fetch_manifest(&self, mothership_id: Option<&str>) -> Result<Manifest>;

    /// Best-effort push of the manifest, keyed by environment id.
    async fn update_manifest(&self, env_id: &str, manifest: &Manifest) -> Result<()>;
}

/// HTTP implementation of [`ProviderClient`] over the provider's REST API.
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpProviderClient {
    /// Build a client from the environment.
    ///
    /// Requires `TETRA_API_KEY`; honors `TETRA_API_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("TETRA_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(Error::CredentialMissing)?;
        let base_url = std::env::var("TETRA_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&api_key, base_url)
    }

    pub fn new(api_key: &str, base_url: impl Into<String>) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::CredentialMissing);
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| Error::CredentialMissing)?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(transport_error)?;

        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn checked(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status().as_u16();
        if let Some(kind) = classify_status(status) {
            let body = response.text().await.unwrap_or_default();
            let message = truncate(&body, 200);
            return Err(match kind {
                StatusClass::Transient => Error::ProviderUnavailable {
                    message,
                    status: Some(status),
                },
                StatusClass::Rejected => Error::ProviderRejected { status, message },
            });
        }
        Ok(response)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    /// Worth retrying: timeouts, throttling, server errors.
    Transient,
    /// Terminal client error.
    Rejected,
}

/// Map an HTTP status to a failure class, or `None` for success.
fn classify_status(status: u16) -> Option<StatusClass> {
    match status {
        200..=299 => None,
        408 | 429 => Some(StatusClass::Transient),
        500..=599 => Some(StatusClass::Transient),
        _ => Some(StatusClass::Rejected),
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    Error::ProviderUnavailable {
        message: error.to_string(),
        status: error.status().map(|s| s.as_u16()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Target of an invocation: the HTTP method and full URL for the envelope.
fn invoke_target(url: &str, envelope: &CallEnvelope) -> (reqwest::Method, String) {
    let base = url.trim_end_matches('/');
    match &envelope.routing {
        // Load-balanced endpoints expose the author's routing layer.
        Some(routing) => {
            let method = reqwest::Method::from_bytes(routing.method.as_str().as_bytes())
                .expect("routing methods are valid HTTP methods");
            (method, format!("{base}{}", routing.path))
        }
        // Queue endpoints take the envelope on the synchronous run route.
        None => (reqwest::Method::POST, format!("{base}/runsync")),
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn list(
        &self,
        kind: ResourceKind,
        name_filter: Option<&str>,
    ) -> Result<Vec<RemoteResource>> {
        let mut request = self
            .http
            .get(format!("{}/endpoints", self.base_url))
            .query(&[("kind", kind.as_str())]);
        if let Some(name) = name_filter {
            request = request.query(&[("name", name)]);
        }
        let response = request.send().await.map_err(transport_error)?;
        let response = self.checked(response).await?;
        Ok(response.json().await.map_err(transport_error)?)
    }

    async fn create(
        &self,
        kind: ResourceKind,
        payload: serde_json::Value,
    ) -> Result<RemoteResource> {
        let body = serde_json::json!({ "kind": kind, "config": payload });
        let response = self
            .http
            .post(format!("{}/endpoints", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.checked(response).await?;
        Ok(response.json().await.map_err(transport_error)?)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/endpoints/{id}", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;
        self.checked(response).await?;
        Ok(())
    }

    async fn invoke(
        &self,
        url: &str,
        envelope: &CallEnvelope,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (method, target) = invoke_target(url, envelope);
        let response = self
            .http
            .request(method, target)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.checked(response).await?;
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }

    async fn fetch_manifest(&self, mothership_id: Option<&str>) -> Result<Manifest> {
        // A deployed mothership serves the directory itself; otherwise the
        // provider's store is queried.
        let manifest_url = match std::env::var("MOTHERSHIP_URL") {
            Ok(base) if !base.trim().is_empty() => {
                format!("{}/manifest", base.trim_end_matches('/'))
            }
            _ => format!("{}/manifest", self.base_url),
        };
        let mut request = self.http.get(manifest_url);
        if let Some(id) = mothership_id {
            request = request.query(&[("mothership_id", id)]);
        }
        let response = request.send().await.map_err(transport_error)?;
        let response = self.checked(response).await?;
        Ok(response.json().await.map_err(transport_error)?)
    }

    async fn update_manifest(&self, env_id: &str, manifest: &Manifest) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/environments/{env_id}/manifest", self.base_url))
            .json(manifest)
            .send()
            .await
            .map_err(transport_error)?;
        self.checked(response).await?;
        Ok(())
    }
}
