//! Orchestrator-facing access layer
//!
//! The orchestrator owns the live workloads; this module only observes them.
//! `OrchestratorClient` wraps the two read endpoints the reconciler needs
//! (instance listing and per-instance status), and `wait_for_address` covers
//! the provisioning-side wait for an external address to be allocated.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};

/// Prefix shared by every instance workload name. The challenge id and a
/// random suffix follow: `ctfchal-<challenge>-<nonce>`.
pub const INSTANCE_PREFIX: &str = "ctfchal-";

/// An instance as reported by the orchestrator listing. Fields beyond the id
/// are tolerated missing so a sparse listing payload still deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstance {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub flag_secret_name: Option<String>,
    /// Flag embedded directly in the listing payload, when present.
    #[serde(default)]
    pub flag: Option<String>,
    /// Flags keyed by name. Insertion order is preserved because the first
    /// entry is the fallback when no primary key exists.
    #[serde(default)]
    pub flags: IndexMap<String, String>,
    /// Coarse lifecycle phase included in the listing, if the orchestrator
    /// provides one.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl LiveInstance {
    /// Challenge id recovered from the instance naming convention. Falls
    /// back to the full instance id for names outside the convention.
    pub fn challenge_id(&self) -> String {
        challenge_id_from_instance(&self.id).unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Deserialize)]
struct PhaseResponse {
    status: String,
}

/// HTTP client for the orchestrator's read endpoints.
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
}

impl OrchestratorClient {
    /// Build a client with a per-request timeout. The timeout bounds every
    /// call made during a reconciliation cycle.
    pub fn new(base_url: &str, timeout: Duration) -> ControlResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List every live instance.
    pub async fn list_instances(&self) -> ControlResult<Vec<LiveInstance>> {
        let url = format!("{}/instances", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ControlError::Network(format!(
                "instance listing returned {}",
                response.status()
            )));
        }
        Ok(response.json::<Vec<LiveInstance>>().await?)
    }

    /// Raw lifecycle signal for a single instance.
    pub async fn instance_phase(&self, instance_id: &str) -> ControlResult<String> {
        let url = format!("{}/instances/{}/status", self.base_url, instance_id);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ControlError::Network(format!(
                "status query for '{instance_id}' returned {}",
                response.status()
            )));
        }
        Ok(response.json::<PhaseResponse>().await?.status)
    }
}

/// Generate a fresh instance name for a challenge.
pub fn instance_name(challenge_id: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{INSTANCE_PREFIX}{challenge_id}-{}", &nonce[..8])
}

/// Recover the challenge id from an instance name, dropping the prefix and
/// the trailing nonce. Names without the prefix return `None`.
pub fn challenge_id_from_instance(instance_id: &str) -> Option<String> {
    let rest = instance_id.strip_prefix(INSTANCE_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    match rest.rsplit_once('-') {
        Some((challenge, _nonce)) if !challenge.is_empty() => Some(challenge.to_string()),
        _ => Some(rest.to_string()),
    }
}

/// Poll `check` every `interval` until it yields an address or `timeout`
/// elapses. Check failures are logged and count as "not yet"; the caller
/// owns cleanup of whatever was provisioned before a timeout.
pub async fn wait_for_address<F, Fut>(
    mut check: F,
    interval: Duration,
    timeout: Duration,
) -> ControlResult<String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ControlResult<Option<String>>>,
{
    let started = Instant::now();
    loop {
        match check().await {
            Ok(Some(address)) if !address.is_empty() => return Ok(address),
            Ok(_) => {}
            Err(err) => debug!("Address check failed, retrying: {err}"),
        }
        if started.elapsed() >= timeout {
            return Err(ControlError::Timeout {
                what: "external address".to_string(),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}
