// Worker service: wires PostgreSQL stores into the reconciler and resolver
// Decision: One process owns both the scheduler and the command consumer;
// the per-tenant lease keeps overlapping runs from other workers out

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use carepath_engine::bus::InMemoryEventBus;
use carepath_engine::clock::SystemClock;
use carepath_engine::persistence::{PostgresRecordStore, PostgresStore};
use carepath_engine::sync::{ReconcilerConfig, SyncCommandHandler, SyncScheduler};
use carepath_engine::validation::PostgresReferenceDirectory;
use carepath_engine::{ConflictResolver, DataValidationGate, ResolverConfig, SyncReconciler};

use crate::config::WorkerConfig;

const MAX_CONNECTIONS: u32 = 10;

/// Long-running sync worker
pub struct SyncWorker {
    config: WorkerConfig,
    bus: Arc<InMemoryEventBus>,
    reconciler: Arc<SyncReconciler>,
    resolver: Arc<ConflictResolver>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncWorker {
    /// Connect both databases, apply migrations and build the reconciler
    /// and resolver
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        info!(
            worker_id = %config.worker_id,
            tenant_id = %config.tenant_id,
            "Initializing sync worker"
        );

        let authoritative_pool = connect(&config.database_url)
            .await
            .context("Failed to connect to authoritative database")?;
        let replica_pool = connect(&config.replica_database_url)
            .await
            .context("Failed to connect to replica database")?;

        let state_store = Arc::new(PostgresStore::new(authoritative_pool.clone()));
        let authoritative = Arc::new(PostgresRecordStore::new(authoritative_pool.clone()));
        let replica = Arc::new(PostgresRecordStore::new(replica_pool));
        let replica_records = replica.clone();
        let references = Arc::new(PostgresReferenceDirectory::new(authoritative_pool));
        let bus = Arc::new(InMemoryEventBus::new());
        let clock = Arc::new(SystemClock);

        let gate = Arc::new(DataValidationGate::new(
            references,
            state_store.clone(),
            authoritative.clone(),
            bus.clone(),
            clock.clone(),
        ));

        let reconciler = Arc::new(SyncReconciler::new(
            authoritative.clone(),
            replica,
            state_store.clone(),
            state_store.clone(),
            gate.clone(),
            clock.clone(),
            ReconcilerConfig::default()
                .with_tenant_id(config.tenant_id.clone())
                .with_holder_id(config.worker_id.clone())
                .with_lease_ttl(config.lease_ttl),
        ));

        let resolver = Arc::new(ConflictResolver::new(
            state_store,
            authoritative,
            replica_records,
            gate,
            bus.clone(),
            clock,
            ResolverConfig::default(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(auto_resolve = config.auto_resolve, "Sync worker initialized");

        Ok(Self {
            config,
            bus,
            reconciler,
            resolver,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// In-process bus the command handler listens on
    pub fn bus(&self) -> Arc<InMemoryEventBus> {
        self.bus.clone()
    }

    pub fn reconciler(&self) -> Arc<SyncReconciler> {
        self.reconciler.clone()
    }

    /// Resolver for operator-driven resolution and escalation
    pub fn resolver(&self) -> Arc<ConflictResolver> {
        self.resolver.clone()
    }

    /// Run the scheduler and command handler until shutdown
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            interval_secs = self.config.sync_interval.as_secs(),
            "Starting sync worker"
        );

        let mut scheduler = SyncScheduler::new(
            self.reconciler.clone(),
            self.config.sync_interval,
            self.shutdown_rx.clone(),
        );
        if self.config.auto_resolve {
            scheduler = scheduler.with_auto_resolve(self.resolver.clone());
        }
        let scheduler = scheduler.spawn();

        let handler = SyncCommandHandler::new(self.reconciler.clone(), self.bus.clone());
        handler
            .run(self.bus.subscribe(), self.shutdown_rx.clone())
            .await;

        // The handler only returns on shutdown or a closed bus; make sure the
        // scheduler sees the signal either way
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = scheduler.await {
            warn!(error = %e, "Sync scheduler task ended abnormally");
        }

        info!("Sync worker stopped");
        Ok(())
    }

    /// Signal the worker to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(url)
        .await?;
    sqlx::migrate!("../engine/migrations")
        .run(&pool)
        .await
        .context("Failed to apply migrations")?;
    Ok(pool)
}
