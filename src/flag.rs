//! Flag resolution
//!
//! Every instance record carries a flag, but where it comes from varies by
//! challenge packaging: embedded directly in the live instance data, in a
//! flags-by-name map, or held in the secret store under a recorded or
//! derived name. Resolution walks those strategies in order and always
//! produces a value (the sentinel when everything fails) so a secret-store
//! outage degrades to "flag unknown" instead of aborting reconciliation.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ControlError, ControlResult};
use crate::orchestrator::{LiveInstance, INSTANCE_PREFIX};

/// Sentinel standing in for "no value". The secret store uses the same
/// string in its own payloads, including error bodies.
pub const NULL_SENTINEL: &str = "null";

/// Preferred key in a flags-by-name map.
pub const PRIMARY_FLAG_KEY: &str = "primary";

/// Outcome of one secret-store request.
#[derive(Debug, Clone)]
pub struct SecretLookup {
    /// Whether the HTTP call itself succeeded.
    pub success: bool,
    /// Value parsed from the body. Present on failures too when the store
    /// embedded its sentinel in the error body.
    pub value: Option<String>,
}

#[async_trait]
pub trait SecretClient: Send + Sync {
    async fn lookup(&self, name: &str) -> ControlResult<SecretLookup>;
}

#[derive(Debug, Deserialize)]
struct SecretBody {
    value: Option<String>,
}

/// HTTP client for the secret store.
pub struct HttpSecretClient {
    http: reqwest::Client,
    base_url: String,
    namespace: Option<String>,
}

impl HttpSecretClient {
    pub fn new(
        base_url: &str,
        namespace: Option<String>,
        timeout: Duration,
    ) -> ControlResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace,
        })
    }
}

#[async_trait]
impl SecretClient for HttpSecretClient {
    async fn lookup(&self, name: &str) -> ControlResult<SecretLookup> {
        let url = format!("{}/secrets/{}", self.base_url, name);
        let mut request = self.http.get(&url);
        if let Some(namespace) = &self.namespace {
            request = request.query(&[("namespace", namespace.as_str())]);
        }
        let response = request.send().await?;
        let status = response.status();
        let success = status.is_success();
        let body = response.text().await?;

        // The body is parsed even on failure: the store reports "no such
        // secret" as a sentinel-valued payload rather than a bare error.
        match serde_json::from_str::<SecretBody>(&body) {
            Ok(parsed) => Ok(SecretLookup {
                success,
                value: parsed.value,
            }),
            Err(_) if success => Ok(SecretLookup {
                success,
                value: None,
            }),
            Err(err) => Err(ControlError::Network(format!(
                "secret lookup for '{name}' returned {status} with unparseable body: {err}"
            ))),
        }
    }
}

/// A resolved flag plus the secret name that produced it (or the recorded
/// name when no lookup happened).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFlag {
    pub flag: String,
    pub secret_name: String,
}

enum Attempt {
    /// HTTP success; value from the body, sentinel when absent.
    Hit(String),
    /// HTTP failure whose body still parsed to an explicit value.
    SoftMiss(String),
}

pub struct FlagResolver<C> {
    secrets: C,
}

impl<C: SecretClient> FlagResolver<C> {
    pub fn new(secrets: C) -> Self {
        Self { secrets }
    }

    /// Resolve an instance's flag through the strategy chain. Never fails;
    /// exhausted strategies yield the sentinel.
    pub async fn extract_flag(&self, live: &LiveInstance) -> ResolvedFlag {
        let recorded = live
            .flag_secret_name
            .as_deref()
            .map(str::trim)
            .filter(|n| valid_secret_name(n))
            .unwrap_or(NULL_SENTINEL)
            .to_string();

        if let Some(flag) = live.flag.as_deref().map(str::trim).filter(|f| real_value(f)) {
            return ResolvedFlag {
                flag: flag.to_string(),
                secret_name: recorded,
            };
        }

        if let Some(flag) = flag_from_map(&live.flags) {
            return ResolvedFlag {
                flag,
                secret_name: recorded,
            };
        }

        match self
            .get_secret(live.flag_secret_name.as_deref(), Some(&live.id))
            .await
        {
            Ok((flag, name_used)) => ResolvedFlag {
                flag,
                secret_name: name_used,
            },
            Err(err) => {
                warn!("Flag resolution for '{}' degraded to sentinel: {err}", live.id);
                ResolvedFlag {
                    flag: NULL_SENTINEL.to_string(),
                    secret_name: recorded,
                }
            }
        }
    }

    /// Fetch a secret value, retrying once under a name derived from the
    /// instance id when the recorded name is missing, invalid, or fails.
    ///
    /// Returns `(value, name_used)`. Errors only when a call failed and its
    /// body could not be parsed (or never reached us at all).
    pub async fn get_secret(
        &self,
        secret_name: Option<&str>,
        fallback_instance_id: Option<&str>,
    ) -> ControlResult<(String, String)> {
        let primary = secret_name
            .map(str::trim)
            .filter(|n| valid_secret_name(n))
            .map(str::to_string);
        let derived = fallback_instance_id.and_then(derived_secret_name);

        let (first_name, retry_name) = match (primary, derived) {
            (Some(p), Some(d)) if d != p => (p, Some(d)),
            (Some(p), _) => (p, None),
            // No usable recorded name: the derived name is the one attempt.
            (None, Some(d)) => (d, None),
            (None, None) => {
                return Ok((NULL_SENTINEL.to_string(), NULL_SENTINEL.to_string()));
            }
        };

        let first = self.attempt(&first_name).await;
        if let Ok(Attempt::Hit(value)) = &first {
            return Ok((value.clone(), first_name));
        }

        if let Some(retry) = retry_name {
            debug!("Secret '{first_name}' unavailable, retrying as '{retry}'");
            match self.attempt(&retry).await {
                Ok(Attempt::Hit(value)) | Ok(Attempt::SoftMiss(value)) => {
                    return Ok((value, retry));
                }
                Err(retry_err) => {
                    if let Ok(Attempt::SoftMiss(value)) = first {
                        return Ok((value, first_name));
                    }
                    return Err(retry_err);
                }
            }
        }

        match first {
            Ok(Attempt::Hit(value)) | Ok(Attempt::SoftMiss(value)) => Ok((value, first_name)),
            Err(err) => Err(err),
        }
    }

    async fn attempt(&self, name: &str) -> ControlResult<Attempt> {
        let lookup = self.secrets.lookup(name).await?;
        if lookup.success {
            Ok(Attempt::Hit(
                lookup.value.unwrap_or_else(|| NULL_SENTINEL.to_string()),
            ))
        } else if let Some(value) = lookup.value {
            Ok(Attempt::SoftMiss(value))
        } else {
            Err(ControlError::Network(format!(
                "secret lookup for '{name}' failed without a readable body"
            )))
        }
    }
}

/// Deterministic secret name for instances that follow the naming
/// convention: `<instance-id>-flag`.
pub fn derived_secret_name(instance_id: &str) -> Option<String> {
    let id = instance_id.trim();
    if id.len() > INSTANCE_PREFIX.len() && id.starts_with(INSTANCE_PREFIX) {
        Some(format!("{id}-flag"))
    } else {
        None
    }
}

fn flag_from_map(flags: &IndexMap<String, String>) -> Option<String> {
    let candidate = flags
        .get(PRIMARY_FLAG_KEY)
        .or_else(|| flags.values().next())?;
    real_value(candidate).then(|| candidate.trim().to_string())
}

fn valid_secret_name(name: &str) -> bool {
    !name.is_empty() && !name.eq_ignore_ascii_case(NULL_SENTINEL)
}

fn real_value(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(NULL_SENTINEL)
}
