//! Reconciliation engine
//!
//! A single long-lived task keeps the persisted instance records converged
//! with what the orchestrator reports as live. Each cycle takes a snapshot of
//! both sets, admits new instances, updates drifted ones, and deletes records
//! whose workload vanished. Failures are contained at two boundaries: one
//! instance's error never stops the rest of the cycle, and a cycle's error
//! never stops the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::ControlResult;
use crate::flag::{FlagResolver, SecretClient};
use crate::orchestrator::{LiveInstance, OrchestratorClient};
use crate::status::{next_status, status_for_new_instance};
use crate::store::{ChallengeInstance, InstanceStore};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub live: usize,
    pub stored: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl CycleStats {
    /// True when the cycle reached the fixed point: no writes at all.
    pub fn wrote_nothing(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Running counters published for the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub last_cycle: CycleStats,
    pub last_completed_at: Option<DateTime<Utc>>,
}

pub struct Reconciler<S, C> {
    store: Arc<S>,
    orchestrator: OrchestratorClient,
    flags: FlagResolver<C>,
    config: ReconcilerConfig,
    status: Arc<RwLock<EngineStatus>>,
}

impl<S, C> Reconciler<S, C>
where
    S: InstanceStore,
    C: SecretClient,
{
    pub fn new(
        store: Arc<S>,
        orchestrator: OrchestratorClient,
        flags: FlagResolver<C>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            flags,
            config,
            status: Arc::new(RwLock::new(EngineStatus::default())),
        }
    }

    /// Shared handle to the engine counters, for the HTTP surface.
    pub fn status_handle(&self) -> Arc<RwLock<EngineStatus>> {
        self.status.clone()
    }

    /// Drive cycles until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        // A slow cycle must delay the next one, never let it fire back-to-back.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Reconciler started, interval {}s",
            self.config.interval.as_secs_f64()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler stopping");
                        return;
                    }
                    continue;
                }
            }

            match self.run_cycle().await {
                Ok(stats) => {
                    if !stats.wrote_nothing() {
                        info!(
                            "Reconciled {} live / {} stored: +{} ~{} -{} ({} failed)",
                            stats.live,
                            stats.stored,
                            stats.created,
                            stats.updated,
                            stats.deleted,
                            stats.failed
                        );
                    }
                    let mut status = self.status.write();
                    status.cycles_completed += 1;
                    status.last_cycle = stats;
                    status.last_completed_at = Some(Utc::now());
                }
                Err(err) => {
                    error!("Reconciliation cycle failed: {err}");
                    self.status.write().cycles_failed += 1;
                }
            }
        }
    }

    /// One reconciliation pass. Converged input produces no writes.
    pub async fn run_cycle(&self) -> ControlResult<CycleStats> {
        // A flapping orchestrator must not kill the loop; an empty live set
        // simply means every record looks vanished this cycle.
        let live = match self.orchestrator.list_instances().await {
            Ok(live) => live,
            Err(err) => {
                warn!("Live instance listing failed, treating as empty: {err}");
                Vec::new()
            }
        };
        let stored = self.store.list_instances().await?;

        let mut stats = CycleStats {
            live: live.len(),
            stored: stored.len(),
            ..Default::default()
        };

        let live_ids: HashMap<&str, ()> = live.iter().map(|l| (l.id.as_str(), ())).collect();
        let stored_by_id: HashMap<&str, &ChallengeInstance> =
            stored.iter().map(|s| (s.id.as_str(), s)).collect();

        for instance in &live {
            match stored_by_id.get(instance.id.as_str()) {
                None => match self.admit(instance).await {
                    Ok(()) => stats.created += 1,
                    Err(err) => {
                        stats.failed += 1;
                        warn!("Admitting instance '{}' failed: {err}", instance.id);
                    }
                },
                Some(existing) => match self.converge(instance, existing).await {
                    Ok(true) => stats.updated += 1,
                    Ok(false) => {}
                    Err(err) => {
                        stats.failed += 1;
                        warn!("Converging instance '{}' failed: {err}", instance.id);
                    }
                },
            }
        }

        for record in &stored {
            if live_ids.contains_key(record.id.as_str()) {
                continue;
            }
            match self.store.delete_instance(&record.id).await {
                Ok(_) => {
                    stats.deleted += 1;
                    info!("Deleted record for vanished instance '{}'", record.id);
                }
                Err(err) => {
                    stats.failed += 1;
                    warn!("Deleting record '{}' failed: {err}", record.id);
                }
            }
        }

        Ok(stats)
    }

    /// First observation of a live instance: build and persist its record.
    async fn admit(&self, live: &LiveInstance) -> ControlResult<()> {
        let (raw, secondary) = self.observe_signals(live).await;
        let resolved = self.flags.extract_flag(live).await;
        let record = ChallengeInstance {
            id: live.id.clone(),
            challenge_id: live.challenge_id(),
            user_id: live.user_id.clone(),
            challenge_image: live.image.clone(),
            challenge_url: live.url.clone(),
            status: status_for_new_instance(&raw, &secondary),
            flag_secret_name: resolved.secret_name,
            flag: resolved.flag,
        };
        self.store.upsert_instance(&record).await?;
        info!(
            "Created record for new instance '{}' ({})",
            record.id, record.status
        );
        Ok(())
    }

    /// Recompute a tracked instance's record; write only when it differs.
    async fn converge(
        &self,
        live: &LiveInstance,
        stored: &ChallengeInstance,
    ) -> ControlResult<bool> {
        let (raw, secondary) = self.observe_signals(live).await;
        let resolved = self.flags.extract_flag(live).await;

        let mut next = stored.clone();
        next.status = next_status(stored.status, &raw, &secondary);
        next.flag = resolved.flag;
        next.flag_secret_name = resolved.secret_name;
        // Observable fields refresh only when the listing actually carries
        // them; a sparse payload must not blank out known values.
        if !live.user_id.is_empty() {
            next.user_id = live.user_id.clone();
        }
        if !live.image.is_empty() {
            next.challenge_image = live.image.clone();
        }
        if !live.url.is_empty() {
            next.challenge_url = live.url.clone();
        }

        if next != *stored {
            debug!(
                "Instance '{}' drifted ({} -> {}), updating record",
                stored.id, stored.status, next.status
            );
            self.store.upsert_instance(&next).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Primary signal comes from the per-instance status query, secondary
    /// from the listing payload. A failed query degrades to the listing
    /// phase alone rather than failing the instance.
    async fn observe_signals(&self, live: &LiveInstance) -> (String, String) {
        let listed = live.phase.clone().unwrap_or_default();
        match self.orchestrator.instance_phase(&live.id).await {
            Ok(phase) => (phase, listed),
            Err(err) => {
                debug!(
                    "Status query for '{}' failed, using listing phase: {err}",
                    live.id
                );
                (listed, String::new())
            }
        }
    }
}

/// Run the reconciler on its own task.
pub fn spawn_reconciler<S, C>(
    reconciler: Reconciler<S, C>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: InstanceStore + 'static,
    C: SecretClient + 'static,
{
    tokio::spawn(async move { reconciler.run(shutdown).await })
}
