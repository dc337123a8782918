//! Provisioning rate limiter
//!
//! Fixed-window counting per key. A key that spends its points inside one
//! window gets blocked for a configurable duration; consuming against a
//! blocked key reports the remaining block time. State lives behind the
//! `RateStore` trait so a single process can use the in-memory store while
//! replicated deployments share the Postgres table. A limiter-wide lock
//! spans each fetch-and-save pair, so concurrent callers never act on the
//! same window snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{ControlError, ControlResult};
use crate::store::PgInstanceStore;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Consumes allowed per window.
    pub points: u32,
    /// Window length.
    pub duration: Duration,
    /// How long a key stays blocked after exceeding its points.
    pub block_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            points: 10,
            duration: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        }
    }
}

/// One key's window state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub window_started_at: i64,
    pub blocked_until: Option<i64>,
}

#[async_trait]
pub trait RateStore: Send + Sync {
    async fn fetch(&self, key: &str) -> ControlResult<Option<RateWindow>>;
    async fn save(&self, key: &str, window: &RateWindow) -> ControlResult<()>;
}

pub struct RateLimiter<S> {
    store: S,
    config: RateLimiterConfig,
    /// Makes fetch-compute-save a single step for concurrent consumers.
    lock: Mutex<()>,
}

impl<S: RateStore> RateLimiter<S> {
    pub fn new(store: S, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Spend one point for `key`. Returns the remaining allowance, or a
    /// `RateLimited` error carrying how long the key stays blocked.
    pub async fn consume(&self, key: &str) -> ControlResult<u32> {
        self.consume_at(key, unix_now()).await
    }

    /// Remaining allowance for `key` in its current window.
    pub async fn token_count(&self, key: &str) -> ControlResult<u32> {
        self.token_count_at(key, unix_now()).await
    }

    async fn consume_at(&self, key: &str, now: i64) -> ControlResult<u32> {
        let _guard = self.lock.lock().await;
        let points = self.config.points;
        let window = self.store.fetch(key).await?;

        if let Some(w) = &window {
            if let Some(blocked_until) = w.blocked_until {
                if blocked_until > now {
                    return Err(ControlError::RateLimited {
                        retry_after: Duration::from_secs((blocked_until - now) as u64),
                    });
                }
            }
        }

        let fresh = match window {
            // Live, unblocked window: count this consume against it.
            Some(w) if w.blocked_until.is_none() && !self.expired(&w, now) => {
                let count = w.count.saturating_add(1);
                if count > points {
                    let blocked_until = now + self.config.block_duration.as_secs() as i64;
                    self.store
                        .save(
                            key,
                            &RateWindow {
                                count: w.count,
                                window_started_at: w.window_started_at,
                                blocked_until: Some(blocked_until),
                            },
                        )
                        .await?;
                    return Err(ControlError::RateLimited {
                        retry_after: self.config.block_duration,
                    });
                }
                RateWindow {
                    count,
                    window_started_at: w.window_started_at,
                    blocked_until: None,
                }
            }
            // Absent, expired, or block just lapsed: open a fresh window.
            _ => RateWindow {
                count: 1,
                window_started_at: now,
                blocked_until: None,
            },
        };

        let remaining = points.saturating_sub(fresh.count);
        self.store.save(key, &fresh).await?;
        Ok(remaining)
    }

    async fn token_count_at(&self, key: &str, now: i64) -> ControlResult<u32> {
        let _guard = self.lock.lock().await;
        let points = self.config.points;
        match self.store.fetch(key).await? {
            Some(w) => {
                if let Some(blocked_until) = w.blocked_until {
                    if blocked_until > now {
                        return Ok(0);
                    }
                    // Lapsed block: the next consume starts a fresh window.
                    return Ok(points);
                }
                if self.expired(&w, now) {
                    Ok(points)
                } else {
                    Ok(points.saturating_sub(w.count))
                }
            }
            None => Ok(points),
        }
    }

    fn expired(&self, window: &RateWindow, now: i64) -> bool {
        now >= window.window_started_at + self.config.duration.as_secs() as i64
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// BACKENDS
// ============================================================================

/// In-process backend for single-replica deployments and tests.
#[derive(Default)]
pub struct MemoryRateStore {
    windows: DashMap<String, RateWindow>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn fetch(&self, key: &str) -> ControlResult<Option<RateWindow>> {
        Ok(self.windows.get(key).map(|e| e.value().clone()))
    }

    async fn save(&self, key: &str, window: &RateWindow) -> ControlResult<()> {
        self.windows.insert(key.to_string(), window.clone());
        Ok(())
    }
}

/// Shared backend riding on the instance store's Postgres connection, for
/// deployments where several replicas must agree on limits.
pub struct PgRateStore {
    store: Arc<PgInstanceStore>,
}

impl PgRateStore {
    pub fn new(store: Arc<PgInstanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RateStore for PgRateStore {
    async fn fetch(&self, key: &str) -> ControlResult<Option<RateWindow>> {
        let client = self.store.client().await?;
        let row = client
            .query_opt(
                "SELECT count, window_started_at, blocked_until FROM rate_limits WHERE key = $1",
                &[&key],
            )
            .await?;
        Ok(row.map(|r| RateWindow {
            count: r.get::<_, i32>(0).max(0) as u32,
            window_started_at: r.get(1),
            blocked_until: r.get(2),
        }))
    }

    async fn save(&self, key: &str, window: &RateWindow) -> ControlResult<()> {
        let client = self.store.client().await?;
        client
            .execute(
                "INSERT INTO rate_limits (key, count, window_started_at, blocked_until)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT(key) DO UPDATE SET
                    count = EXCLUDED.count,
                    window_started_at = EXCLUDED.window_started_at,
                    blocked_until = EXCLUDED.blocked_until",
                &[
                    &key,
                    &(window.count as i32),
                    &window.window_started_at,
                    &window.blocked_until,
                ],
            )
            .await?;
        Ok(())
    }
}
