//! Reconciliation, conflict resolution and quarantine scenarios
//!
//! Run with: cargo test -p carepath-engine --test sync_conflict_test

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use carepath_engine::bus::{event_types, topics, InMemoryEventBus};
use carepath_engine::clock::{Clock, ManualClock};
use carepath_engine::conflict::{
    ConflictError, ConflictResolver, ConflictStatus, ReplicaWinsPolicy, ResolutionRequest,
    ResolutionStrategy, ResolverConfig,
};
use carepath_engine::persistence::{
    InMemoryRecordStore, InMemoryStore, RecordStore, StoreError, UpsertOutcome,
};
use carepath_engine::sync::{
    ChangeOutcome, EntityType, ReconcilerConfig, SyncError, SyncReconciler, SyncRecord,
};
use carepath_engine::validation::{
    BatchItemOutcome, DataValidationGate, InMemoryReferenceDirectory, QuarantineStatus,
    ReferenceKind,
};

/// Record store whose reads take a while, to hold a run or resolution open
struct SlowRecordStore {
    inner: Arc<InMemoryRecordStore>,
    list_delay: Duration,
    get_delay: Duration,
}

#[async_trait]
impl RecordStore for SlowRecordStore {
    async fn list(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncRecord>, StoreError> {
        tokio::time::sleep(self.list_delay).await;
        self.inner.list(entity_type, since).await
    }

    async fn get(&self, entity_type: EntityType, id: Uuid) -> Result<Option<SyncRecord>, StoreError> {
        tokio::time::sleep(self.get_delay).await;
        self.inner.get(entity_type, id).await
    }

    async fn upsert(&self, record: &SyncRecord) -> Result<UpsertOutcome, StoreError> {
        self.inner.upsert(record).await
    }

    async fn delete(&self, entity_type: EntityType, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete(entity_type, id).await
    }
}

struct Fixture {
    reconciler: Arc<SyncReconciler>,
    resolver: ConflictResolver,
    gate: Arc<DataValidationGate>,
    authoritative: Arc<InMemoryRecordStore>,
    replica: Arc<InMemoryRecordStore>,
    store: Arc<InMemoryStore>,
    bus: Arc<InMemoryEventBus>,
    clock: Arc<ManualClock>,
}

fn fixture_with(resolver_config: ResolverConfig) -> Fixture {
    let authoritative = Arc::new(InMemoryRecordStore::new());
    let replica = Arc::new(InMemoryRecordStore::new());
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let clock = Arc::new(ManualClock::new(
        "2024-03-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap(),
    ));
    let directory = Arc::new(
        InMemoryReferenceDirectory::new()
            .with(ReferenceKind::Patient, "p-1")
            .with(ReferenceKind::Provider, "dr-1"),
    );
    let gate = Arc::new(DataValidationGate::new(
        directory,
        store.clone(),
        authoritative.clone(),
        bus.clone(),
        clock.clone(),
    ));
    let reconciler = Arc::new(SyncReconciler::new(
        authoritative.clone(),
        replica.clone(),
        store.clone(),
        store.clone(),
        gate.clone(),
        clock.clone(),
        ReconcilerConfig::default().with_tenant_id("clinic-a"),
    ));
    let resolver = ConflictResolver::new(
        store.clone(),
        authoritative.clone(),
        replica.clone(),
        gate.clone(),
        bus.clone(),
        clock.clone(),
        resolver_config,
    );
    Fixture {
        reconciler,
        resolver,
        gate,
        authoritative,
        replica,
        store,
        bus,
        clock,
    }
}

fn fixture() -> Fixture {
    fixture_with(ResolverConfig::default())
}

fn consultation(id: Uuid, extra: Value, at: DateTime<Utc>) -> SyncRecord {
    let mut data = json!({
        "patient_id": "p-1",
        "provider_id": "dr-1",
        "consultation_type": "routine",
    });
    if let (Some(target), Some(source)) = (data.as_object_mut(), extra.as_object()) {
        target.extend(source.clone());
    }
    SyncRecord::new(EntityType::Consultation, id, data, at)
}

/// Seed a diverged consultation and detect it; returns the conflict id
async fn seed_conflict(f: &Fixture, gap: chrono::Duration) -> Uuid {
    let id = Uuid::now_v7();
    let t0 = f.clock.now();
    f.authoritative.put(consultation(
        id,
        json!({"status": "completed", "notes": "stable", "tags": ["cardio"]}),
        t0 + gap,
    ));
    f.replica.put(consultation(
        id,
        json!({"status": "in-progress", "notes": "dizzy", "tags": ["neuro"]}),
        t0,
    ));

    f.reconciler.run_full().await.unwrap();
    let pending = f.resolver.get_pending_conflicts(100).await.unwrap();
    pending
        .into_iter()
        .find(|c| c.record_id == id)
        .map(|c| c.id)
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_newer_authoritative_conflict_resolved_authoritative_wins() {
    let f = fixture();
    let conflict_id = seed_conflict(&f, chrono::Duration::minutes(10)).await;

    let conflict = f.resolver.get_pending_conflicts(10).await.unwrap().remove(0);
    assert_eq!(conflict.differing_fields, vec!["status".to_string()]);

    let result = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::AuthoritativeWins, "ops"),
        )
        .await
        .unwrap();

    assert_eq!(result.conflict.status, ConflictStatus::Resolved);
    assert_eq!(
        result.conflict.resolution_strategy,
        Some(ResolutionStrategy::AuthoritativeWins)
    );
    let replica = f
        .replica
        .get(EntityType::Consultation, conflict.record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replica.field("status"), Some(&json!("completed")));

    let audit = f.resolver.get_audit_log(conflict_id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "resolved");
    assert_eq!(audit[0].after["status"], "completed");
    assert_eq!(f.bus.published(topics::SYNC_RESULTS).len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_merge_twice_rejected() {
    let f = fixture();
    let conflict_id = seed_conflict(&f, chrono::Duration::minutes(10)).await;

    let first = f
        .resolver
        .resolve(conflict_id, ResolutionRequest::new(ResolutionStrategy::Merge, "ops"))
        .await
        .unwrap();
    assert_eq!(first.resolved_record.field("notes"), Some(&json!("stable\n---\ndizzy")));
    assert_eq!(
        first.resolved_record.field("tags"),
        Some(&json!(["cardio", "neuro"]))
    );
    assert!(first.replica_written && first.authoritative_written);

    let second = f
        .resolver
        .resolve(conflict_id, ResolutionRequest::new(ResolutionStrategy::Merge, "ops"))
        .await
        .unwrap_err();
    assert!(matches!(
        second,
        ConflictError::ConflictAlreadyResolved {
            status: ConflictStatus::Resolved,
            ..
        }
    ));
    assert_eq!(f.resolver.get_audit_log(conflict_id).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_auto_resolve_picks_strategy_by_gap() {
    let f = fixture();
    let close = seed_conflict(&f, chrono::Duration::minutes(2)).await;
    let far = seed_conflict(&f, chrono::Duration::minutes(30)).await;

    let report = f.resolver.auto_resolve().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.resolved, 2);
    assert_eq!(report.failed, 0);

    let close = f.store_conflict(close).await;
    let far = f.store_conflict(far).await;
    assert_eq!(close.resolution_strategy, Some(ResolutionStrategy::Merge));
    assert_eq!(far.resolution_strategy, Some(ResolutionStrategy::AuthoritativeWins));
    assert_eq!(close.resolved_by.as_deref(), Some("auto-resolver"));

    let stats = f.resolver.get_conflict_statistics().await.unwrap();
    assert_eq!(stats.resolved, 2);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.by_strategy["merge"], 1);
}

#[test_log::test(tokio::test)]
async fn test_overlapping_resolutions_write_once() {
    let f = fixture();
    let conflict_id = seed_conflict(&f, chrono::Duration::minutes(10)).await;

    // Each resolution stalls reading the replica after it has claimed
    let slow_replica = Arc::new(SlowRecordStore {
        inner: f.replica.clone(),
        list_delay: Duration::ZERO,
        get_delay: Duration::from_millis(50),
    });
    let resolver = ConflictResolver::new(
        f.store.clone(),
        f.authoritative.clone(),
        slow_replica,
        f.gate.clone(),
        f.bus.clone(),
        f.clock.clone(),
        ResolverConfig::default(),
    );

    let (first, second) = tokio::join!(
        resolver.resolve(conflict_id, ResolutionRequest::new(ResolutionStrategy::Merge, "ops-a")),
        resolver.resolve(conflict_id, ResolutionRequest::new(ResolutionStrategy::Merge, "ops-b")),
    );

    let first = first.unwrap();
    assert_eq!(first.conflict.status, ConflictStatus::Resolved);
    assert!(matches!(
        second.unwrap_err(),
        ConflictError::ResolutionInProgress(id) if id == conflict_id
    ));

    let record_id = first.conflict.record_id;
    for store in [&f.authoritative, &f.replica] {
        let record = store
            .get(EntityType::Consultation, record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.field("notes"), Some(&json!("stable\n---\ndizzy")));
    }
    assert_eq!(f.resolver.get_audit_log(conflict_id).await.unwrap().len(), 1);

    // Once closed, later attempts see the terminal status
    let late = resolver
        .resolve(conflict_id, ResolutionRequest::new(ResolutionStrategy::Merge, "ops-b"))
        .await
        .unwrap_err();
    assert!(matches!(
        late,
        ConflictError::ConflictAlreadyResolved {
            status: ConflictStatus::Resolved,
            ..
        }
    ));
}

#[test_log::test(tokio::test)]
async fn test_failed_resolution_releases_claim() {
    let f = fixture();
    let conflict_id = seed_conflict(&f, chrono::Duration::minutes(10)).await;

    let err = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::Manual, "ops"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConflictError::MissingManualData(_)));

    // Nobody holds the conflict any more, so a different caller can resolve it
    let resolved = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::AuthoritativeWins, "ops-2"),
        )
        .await
        .unwrap();
    assert_eq!(resolved.conflict.status, ConflictStatus::Resolved);
}

impl Fixture {
    async fn store_conflict(&self, id: Uuid) -> carepath_engine::conflict::ConflictRecord {
        use carepath_engine::persistence::ConflictStore;
        self.store.get_conflict(id).await.unwrap().unwrap()
    }
}

#[test_log::test(tokio::test)]
async fn test_escalated_conflict_is_terminal() {
    let f = fixture();
    let conflict_id = seed_conflict(&f, chrono::Duration::minutes(10)).await;

    let escalated = f
        .resolver
        .escalate(conflict_id, "diagnosis disagreement", "nurse-1")
        .await
        .unwrap();
    assert_eq!(escalated.status, ConflictStatus::Escalated);
    assert_eq!(
        escalated.escalation_reason.as_deref(),
        Some("diagnosis disagreement")
    );

    let alerts = f.bus.published(topics::SYNC_ALERTS);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].event_type, event_types::CONFLICT_ESCALATED);

    let err = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::AuthoritativeWins, "ops"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConflictError::ConflictAlreadyResolved { .. }));
}

#[test_log::test(tokio::test)]
async fn test_manual_resolution_validates_payload() {
    let f = fixture();
    let conflict_id = seed_conflict(&f, chrono::Duration::minutes(10)).await;

    let missing = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::Manual, "ops"),
        )
        .await
        .unwrap_err();
    assert!(matches!(missing, ConflictError::MissingManualData(_)));

    let invalid = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::manual(json!({"status": "paused"}), "ops"),
        )
        .await
        .unwrap_err();
    let ConflictError::ValidationFailed(errors) = invalid else {
        panic!("expected validation failure, got {invalid:?}");
    };
    assert!(errors.iter().any(|e| e.field == "patient_id"));
    assert!(errors.iter().any(|e| e.field == "status"));

    let resolved = f
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::manual(
                json!({
                    "patient_id": "p-1",
                    "provider_id": "dr-1",
                    "consultation_type": "routine",
                    "status": "cancelled",
                }),
                "ops",
            ),
        )
        .await
        .unwrap();
    let record_id = resolved.conflict.record_id;
    for store in [&f.authoritative, &f.replica] {
        let record = store
            .get(EntityType::Consultation, record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.field("status"), Some(&json!("cancelled")));
    }
}

#[test_log::test(tokio::test)]
async fn test_replica_wins_policies() {
    let keep = fixture();
    let conflict_id = seed_conflict(&keep, chrono::Duration::minutes(10)).await;
    let result = keep
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::ReplicaWins, "ops"),
        )
        .await
        .unwrap();
    assert!(!result.replica_written && !result.authoritative_written);

    let write_back = fixture_with(
        ResolverConfig::default()
            .with_replica_wins_policy(ReplicaWinsPolicy::WriteBackToAuthoritative),
    );
    let conflict_id = seed_conflict(&write_back, chrono::Duration::minutes(10)).await;
    let result = write_back
        .resolver
        .resolve(
            conflict_id,
            ResolutionRequest::new(ResolutionStrategy::ReplicaWins, "ops"),
        )
        .await
        .unwrap();
    let authoritative = write_back
        .authoritative
        .get(EntityType::Consultation, result.conflict.record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(authoritative.field("status"), Some(&json!("in-progress")));
}

#[test_log::test(tokio::test)]
async fn test_concurrent_run_rejected() {
    let f = fixture();
    let slow = Arc::new(SlowRecordStore {
        inner: f.authoritative.clone(),
        list_delay: Duration::from_millis(50),
        get_delay: Duration::ZERO,
    });
    let gate = f.gate.clone();
    let reconciler = SyncReconciler::new(
        slow,
        f.replica.clone(),
        f.store.clone(),
        f.store.clone(),
        gate,
        f.clock.clone(),
        ReconcilerConfig::default().with_tenant_id("clinic-a"),
    );

    let (first, second) = tokio::join!(reconciler.run_full(), reconciler.run_incremental(None));
    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::SyncInProgress { .. })));

    // Lease released once the first run finished
    assert!(reconciler.run_full().await.is_ok());
    assert!(!f.reconciler.get_sync_status().await.unwrap().is_syncing);
}

#[test_log::test(tokio::test)]
async fn test_incoming_invalid_change_is_quarantined() {
    let f = fixture();
    let outcome = f
        .reconciler
        .handle_incoming_change(
            EntityType::Consultation,
            json!({
                "id": Uuid::now_v7().to_string(),
                "provider_id": "dr-1",
                "consultation_type": "routine",
                "status": "scheduled",
            }),
        )
        .await
        .unwrap();

    let ChangeOutcome::Quarantined(quarantine_id) = outcome else {
        panic!("expected quarantine, got {outcome:?}");
    };
    assert!(f.replica.is_empty());

    let pending = f
        .gate
        .get_quarantined(Some(QuarantineStatus::PendingReview), 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, quarantine_id);
    assert_eq!(pending[0].validation_errors[0].field, "patient_id");

    let alerts = f.bus.published(topics::SYNC_ALERTS);
    assert_eq!(alerts[0].event_type, event_types::RECORD_QUARANTINED);
}

#[test_log::test(tokio::test)]
async fn test_incoming_newer_change_becomes_conflict_once() {
    let f = fixture();
    let id = Uuid::now_v7();
    let t0 = f.clock.now();
    f.replica
        .put(consultation(id, json!({"status": "in-progress"}), t0));

    let change = consultation(
        id,
        json!({"status": "completed"}),
        t0 + chrono::Duration::minutes(10),
    );
    let first = f
        .reconciler
        .handle_incoming_change(EntityType::Consultation, change.data.clone())
        .await
        .unwrap();
    let second = f
        .reconciler
        .handle_incoming_change(EntityType::Consultation, change.data)
        .await
        .unwrap();

    let (ChangeOutcome::Conflict(a), ChangeOutcome::Conflict(b)) = (first, second) else {
        panic!("expected conflicts, got {first:?} / {second:?}");
    };
    assert_eq!(a, b);
    assert_eq!(f.resolver.get_pending_conflicts(10).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_medical_record_missing_title() {
    let f = fixture();
    let record = json!({
        "id": Uuid::now_v7().to_string(),
        "patient_id": "p-1",
        "record_type": "lab_result",
    });

    let report = f.gate.validate(EntityType::MedicalRecord, &record).await;
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].field, "title");

    let batch = f
        .gate
        .validate_batch(EntityType::MedicalRecord, vec![record])
        .await;
    assert_eq!(batch.quarantined, 1);
    assert!(matches!(
        batch.items[0].outcome,
        BatchItemOutcome::Quarantined { .. }
    ));
    assert!(f.authoritative.is_empty());
}
