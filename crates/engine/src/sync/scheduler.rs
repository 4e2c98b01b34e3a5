//! Periodic reconciliation

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::reconciler::{SyncError, SyncReconciler};
use crate::conflict::ConflictResolver;

/// Fixed-interval reconciliation loop
///
/// The first tick runs a full reconciliation, later ticks run incremental
/// ones from the watermark. A failed run is logged and the loop carries on.
/// With a resolver attached, each successful run is followed by one
/// auto-resolve sweep over the pending conflicts.
pub struct SyncScheduler {
    reconciler: Arc<SyncReconciler>,
    resolver: Option<Arc<ConflictResolver>>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncScheduler {
    pub fn new(
        reconciler: Arc<SyncReconciler>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            resolver: None,
            interval,
            shutdown_rx,
        }
    }

    /// Sweep pending conflicts after every successful reconciliation
    pub fn with_auto_resolve(mut self, resolver: Arc<ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run on a background task until shutdown is signalled
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut first = true;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    debug!("Shutdown signal received during wait");
                    break;
                }
            }

            let result = if first {
                self.reconciler.run_full().await
            } else {
                self.reconciler.run_incremental(None).await
            };

            match result {
                Ok(report) => {
                    first = false;
                    debug!(
                        mode = %report.mode,
                        synced_records = report.synced_records,
                        conflicts = report.conflicts,
                        "Scheduled reconciliation finished"
                    );
                    self.sweep_conflicts().await;
                }
                Err(SyncError::SyncInProgress { .. }) => {
                    debug!("Skipping tick, reconciliation already running elsewhere");
                }
                Err(e) => error!(error = %e, "Scheduled reconciliation failed"),
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn sweep_conflicts(&self) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        match resolver.auto_resolve().await {
            Ok(report) if report.attempted > 0 => debug!(
                resolved = report.resolved,
                failed = report.failed,
                skipped = report.skipped,
                "Scheduled auto-resolve finished"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Scheduled auto-resolve failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::clock::SystemClock;
    use crate::conflict::ResolverConfig;
    use crate::persistence::{
        ConflictStore, InMemoryRecordStore, InMemoryStore, RecordStore, SyncStateStore,
    };
    use crate::sync::{EntityType, ReconcilerConfig, SyncRecord};
    use crate::validation::{DataValidationGate, InMemoryReferenceDirectory};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let authoritative = Arc::new(InMemoryRecordStore::new());
        let replica = Arc::new(InMemoryRecordStore::new());
        let store = Arc::new(InMemoryStore::new());
        let gate = Arc::new(DataValidationGate::new(
            Arc::new(InMemoryReferenceDirectory::new()),
            store.clone(),
            authoritative.clone(),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(SystemClock),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            authoritative.clone(),
            replica.clone(),
            store.clone(),
            store.clone(),
            gate,
            Arc::new(SystemClock),
            ReconcilerConfig::default().with_tenant_id("t"),
        ));
        authoritative.put(SyncRecord::new(
            EntityType::MedicalRecord,
            Uuid::now_v7(),
            json!({"title": "CBC"}),
            Utc::now(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            SyncScheduler::new(reconciler, Duration::from_millis(20), shutdown_rx).spawn();

        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(replica.len(), 1);
        assert!(store.last_sync_timestamp("t").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scheduler_auto_resolves_detected_conflicts() {
        let authoritative = Arc::new(InMemoryRecordStore::new());
        let replica = Arc::new(InMemoryRecordStore::new());
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let gate = Arc::new(DataValidationGate::new(
            Arc::new(InMemoryReferenceDirectory::new()),
            store.clone(),
            authoritative.clone(),
            bus.clone(),
            Arc::new(SystemClock),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            authoritative.clone(),
            replica.clone(),
            store.clone(),
            store.clone(),
            gate.clone(),
            Arc::new(SystemClock),
            ReconcilerConfig::default().with_tenant_id("t"),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            authoritative.clone(),
            replica.clone(),
            gate,
            bus,
            Arc::new(SystemClock),
            ResolverConfig::default(),
        ));

        let id = Uuid::now_v7();
        let now = Utc::now();
        authoritative.put(SyncRecord::new(
            EntityType::MedicalRecord,
            id,
            json!({"title": "CBC (corrected)"}),
            now,
        ));
        replica.put(SyncRecord::new(
            EntityType::MedicalRecord,
            id,
            json!({"title": "CBC"}),
            now - chrono::Duration::hours(1),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = SyncScheduler::new(reconciler, Duration::from_millis(20), shutdown_rx)
            .with_auto_resolve(resolver)
            .spawn();

        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let stats = store.conflict_statistics().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.pending, 0);

        let synced = replica
            .get(EntityType::MedicalRecord, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced.field("title"), Some(&json!("CBC (corrected)")));
    }
}
