//! Instance record storage
//!
//! The reconciler's view of the world is persisted here, one row per live
//! workload. Postgres is the production backend; `MemoryInstanceStore` backs
//! tests and local runs behind the same trait.
//!
//! Connection strategy: a direct URL is preferred, and only when a distinct
//! pooled URL is configured does a failed direct attempt fall back to it.
//! When both fail the second failure is what propagates. Lost connections are
//! re-established through the same strategy, serialized so concurrent callers
//! never race duplicate connect attempts.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_postgres::{Config, Object, Pool, Runtime};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::status::ChallengeStatus;

const SCHEMA: &str = r#"
-- Persisted challenge instance records, one row per live workload
CREATE TABLE IF NOT EXISTS challenge_instances (
    id TEXT PRIMARY KEY,
    challenge_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    challenge_image TEXT NOT NULL,
    challenge_url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'CREATING',
    flag_secret_name TEXT NOT NULL DEFAULT 'null',
    flag TEXT NOT NULL DEFAULT 'null',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_challenge_instances_user ON challenge_instances(user_id);
CREATE INDEX IF NOT EXISTS idx_challenge_instances_status ON challenge_instances(status);

-- Fixed-window rate limiter state, shared when several replicas run
CREATE TABLE IF NOT EXISTS rate_limits (
    key TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    window_started_at BIGINT NOT NULL,
    blocked_until BIGINT
);
"#;

/// Persisted instance record. Field names follow the wire schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeInstance {
    pub id: String,
    pub challenge_id: String,
    pub user_id: String,
    pub challenge_image: String,
    pub challenge_url: String,
    pub status: ChallengeStatus,
    pub flag_secret_name: String,
    pub flag: String,
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn list_instances(&self) -> ControlResult<Vec<ChallengeInstance>>;
    async fn get_instance(&self, id: &str) -> ControlResult<Option<ChallengeInstance>>;
    /// Insert or fully replace the record with this id.
    async fn upsert_instance(&self, instance: &ChallengeInstance) -> ControlResult<()>;
    /// Returns whether a record was actually removed.
    async fn delete_instance(&self, id: &str) -> ControlResult<bool>;
}

// ============================================================================
// POSTGRES BACKEND
// ============================================================================

pub struct PgInstanceStore {
    pool: RwLock<Pool>,
    direct_url: Option<String>,
    pooled_url: Option<String>,
    reconnect: Mutex<()>,
}

impl PgInstanceStore {
    /// Connect using the configured URLs and initialize the schema.
    pub async fn connect(
        direct_url: Option<&str>,
        pooled_url: Option<&str>,
    ) -> ControlResult<Self> {
        let pool = build_pool(direct_url, pooled_url).await?;
        Ok(Self {
            pool: RwLock::new(pool),
            direct_url: direct_url.map(str::to_string),
            pooled_url: pooled_url.map(str::to_string),
            reconnect: Mutex::new(()),
        })
    }

    pub(crate) async fn client(&self) -> ControlResult<Object> {
        let pool = self.pool.read().await.clone();
        match pool.get().await {
            Ok(client) => Ok(client),
            Err(first_err) => {
                warn!("Instance store connection lost ({first_err}), reconnecting");
                let _guard = self.reconnect.lock().await;
                // Another caller may have finished the reconnect while we
                // waited for the lock.
                let current = self.pool.read().await.clone();
                if let Ok(client) = current.get().await {
                    return Ok(client);
                }
                let fresh =
                    build_pool(self.direct_url.as_deref(), self.pooled_url.as_deref()).await?;
                let client = fresh.get().await?;
                *self.pool.write().await = fresh;
                info!("Instance store connection re-established");
                Ok(client)
            }
        }
    }
}

async fn build_pool(direct_url: Option<&str>, pooled_url: Option<&str>) -> ControlResult<Pool> {
    match (direct_url, pooled_url) {
        (None, None) => Err(ControlError::FatalConfig(
            "no instance store URL configured".to_string(),
        )),
        (None, Some(pooled)) => {
            let pool = try_connect(pooled).await?;
            info!("Connected to instance store via pooled URL");
            Ok(pool)
        }
        (Some(direct), pooled) => match try_connect(direct).await {
            Ok(pool) => {
                info!("Connected to instance store via direct URL");
                Ok(pool)
            }
            Err(direct_err) => match pooled.filter(|p| *p != direct) {
                Some(pooled) => {
                    warn!("Direct store connection failed ({direct_err}), trying pooled URL");
                    let pool = try_connect(pooled).await?;
                    info!("Connected to instance store via pooled URL");
                    Ok(pool)
                }
                None => Err(direct_err),
            },
        },
    }
}

async fn try_connect(url: &str) -> ControlResult<Pool> {
    let mut config = Config::new();
    config.url = Some(url.to_string());
    let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

    // Pool creation is lazy; grab a client to prove the URL works, then use
    // it to apply the schema.
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    Ok(pool)
}

fn row_to_instance(row: &Row) -> ControlResult<ChallengeInstance> {
    let status: String = row.get(5);
    Ok(ChallengeInstance {
        id: row.get(0),
        challenge_id: row.get(1),
        user_id: row.get(2),
        challenge_image: row.get(3),
        challenge_url: row.get(4),
        status: status.parse()?,
        flag_secret_name: row.get(6),
        flag: row.get(7),
    })
}

const INSTANCE_COLUMNS: &str =
    "id, challenge_id, user_id, challenge_image, challenge_url, status, flag_secret_name, flag";

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn list_instances(&self) -> ControlResult<Vec<ChallengeInstance>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM challenge_instances ORDER BY id"),
                &[],
            )
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn get_instance(&self, id: &str) -> ControlResult<Option<ChallengeInstance>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!("SELECT {INSTANCE_COLUMNS} FROM challenge_instances WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    async fn upsert_instance(&self, instance: &ChallengeInstance) -> ControlResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO challenge_instances
                     (id, challenge_id, user_id, challenge_image, challenge_url, status, flag_secret_name, flag)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT(id) DO UPDATE SET
                    challenge_id = EXCLUDED.challenge_id,
                    user_id = EXCLUDED.user_id,
                    challenge_image = EXCLUDED.challenge_image,
                    challenge_url = EXCLUDED.challenge_url,
                    status = EXCLUDED.status,
                    flag_secret_name = EXCLUDED.flag_secret_name,
                    flag = EXCLUDED.flag,
                    updated_at = NOW()",
                &[
                    &instance.id,
                    &instance.challenge_id,
                    &instance.user_id,
                    &instance.challenge_image,
                    &instance.challenge_url,
                    &instance.status.as_str(),
                    &instance.flag_secret_name,
                    &instance.flag,
                ],
            )
            .await?;
        debug!("Upserted instance record {}", instance.id);
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> ControlResult<bool> {
        let client = self.client().await?;
        let deleted = client
            .execute("DELETE FROM challenge_instances WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

/// DashMap-backed store with the same semantics as the Postgres backend.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: DashMap<String, ChallengeInstance>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a record, for assembling fixtures.
    pub fn seed(&self, instance: ChallengeInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn list_instances(&self) -> ControlResult<Vec<ChallengeInstance>> {
        let mut all: Vec<ChallengeInstance> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn get_instance(&self, id: &str) -> ControlResult<Option<ChallengeInstance>> {
        Ok(self.instances.get(id).map(|e| e.value().clone()))
    }

    async fn upsert_instance(&self, instance: &ChallengeInstance) -> ControlResult<()> {
        self.instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> ControlResult<bool> {
        Ok(self.instances.remove(id).is_some())
    }
}
