//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - API Server (order intake, admin operations)
//! - Fulfillment worker pool (dispatch queue consumers)
//! - Reconciler (status polling and stranded-order sweep)
//! - Rate sync (catalog repricing)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Initialize store, queue and adapter factory
//! 3. Start API server
//! 4. Spawn worker pool and periodic jobs
//! 5. Graceful shutdown on SIGINT (in-flight jobs finish, nothing new starts)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use smm_engine::RetryPolicy;
use smm_exec::{
    DispatchQueue, FulfillmentWorker, MemoryQueue, RateSync, Reconciler, StubUpstream,
    StubUpstreamFactory, UpstreamFactory,
};
use smm_store::{MemoryStore, Store};

use crate::api::{create_router, ApiState};
use crate::config::{Config, Environment};
use crate::error::{DaemonError, DaemonResult};

// =============================================================================
// Daemon
// =============================================================================

/// The main SMM daemon.
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Accounts, ledger, orders and catalog
    store: Arc<dyn Store>,
    /// Dispatch queue
    queue: Arc<dyn DispatchQueue>,
    /// Upstream adapter factory
    upstreams: Arc<dyn UpstreamFactory>,
    /// Cancelled on shutdown
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with stub components (for testing/development).
    pub fn new_stub(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let upstreams = Arc::new(StubUpstreamFactory::new(Arc::new(StubUpstream::new())));

        Self::new(config, store, queue, upstreams)
    }

    /// Create a new daemon with provided components.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        queue: Arc<dyn DispatchQueue>,
        upstreams: Arc<dyn UpstreamFactory>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            upstreams,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a daemon backed by PostgreSQL and the HTTP provider adapters.
    ///
    /// Requires `DATABASE_URL` and `SMM_CRYPTO_KEY`.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: Config) -> DaemonResult<Self> {
        use smm_connectors::ProviderAdapterFactory;
        use smm_exec::PgQueue;
        use smm_store::{PgStore, ProviderKeyCipher};

        let database_url = config
            .database_url
            .clone()
            .ok_or_else(|| DaemonError::Config("DATABASE_URL is required".to_string()))?;
        let crypto_key = config.upstream.crypto_key.as_deref().ok_or_else(|| {
            DaemonError::Config("SMM_CRYPTO_KEY is required with a database".to_string())
        })?;

        let pool = sqlx::PgPool::connect(&database_url)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to connect to database: {}", e)))?;
        let pool = Arc::new(pool);

        let cipher = Arc::new(ProviderKeyCipher::from_hex(crypto_key)?);
        let store = Arc::new(PgStore::new(pool.clone()));
        let queue = Arc::new(PgQueue::new(pool, config.dispatch.lease));
        let upstreams = Arc::new(ProviderAdapterFactory::new(cipher, config.upstream.timeout));

        info!("Connected to PostgreSQL");
        Ok(Self::new(config, store, queue, upstreams))
    }

    /// Pick the backend from configuration.
    ///
    /// With the `postgres` feature and a `DATABASE_URL`, outside of the test
    /// environment, the daemon runs on PostgreSQL. Otherwise it runs on stubs,
    /// which production refuses.
    pub async fn from_config(config: Config) -> DaemonResult<Self> {
        #[cfg(feature = "postgres")]
        if config.environment != Environment::Test && config.database_url.is_some() {
            return Self::connect(config).await;
        }

        if config.environment == Environment::Production {
            return Err(DaemonError::Config(
                "production requires the postgres feature and DATABASE_URL".to_string(),
            ));
        }

        warn!(environment = %config.environment, "Running on in-memory store and stub upstream");
        Ok(Self::new_stub(config))
    }

    /// Token cancelled when the daemon shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT or the
    /// shutdown token).
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting SMM daemon"
        );

        // 1. Start API server
        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        // 2. Worker pool and periodic jobs
        let tasks = self.spawn_background()?;
        info!(
            workers = self.config.dispatch.worker_concurrency,
            "Background tasks started"
        );

        // 3. Wait for shutdown
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        // 4. Graceful shutdown
        self.shutdown.cancel();
        self.join(tasks).await
    }

    /// Spawn the fulfillment worker pool, the reconciler and rate sync.
    pub fn spawn_background(&self) -> DaemonResult<Vec<JoinHandle<()>>> {
        let dispatch = &self.config.dispatch;
        let reconcile = &self.config.reconcile;

        let worker = FulfillmentWorker::new(
            self.store.clone(),
            self.queue.clone(),
            self.upstreams.clone(),
            RetryPolicy::new(dispatch.max_attempts, dispatch.backoff),
            to_chrono(dispatch.lease, "SMM_DISPATCH_LEASE_SECS")?,
        );
        let reconciler = Reconciler::new(
            self.store.clone(),
            self.queue.clone(),
            self.upstreams.clone(),
            to_chrono(reconcile.stale_pending_after, "SMM_STALE_PENDING_SECS")?,
        );
        let rate_sync = RateSync::new(self.store.clone(), self.upstreams.clone());

        let mut tasks = Vec::with_capacity(dispatch.worker_concurrency + 2);
        for index in 0..dispatch.worker_concurrency {
            tasks.push(tokio::spawn(run_worker(
                index,
                worker.clone(),
                dispatch.poll_interval,
                self.shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_reconciler(
            reconciler,
            reconcile.interval,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_rate_sync(
            rate_sync,
            reconcile.rate_sync_interval,
            self.shutdown.clone(),
        )));

        Ok(tasks)
    }

    /// Start the API server.
    pub async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState::new(
            self.store.clone(),
            self.queue.clone(),
            self.upstreams.clone(),
        ));

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(format!("Failed to get local address: {}", e)))?;

        // Spawn the server task
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Wait for background tasks to stop.
    async fn join(&self, tasks: Vec<JoinHandle<()>>) -> DaemonResult<()> {
        info!("Initiating graceful shutdown");

        let mut failed = 0usize;
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(DaemonError::Task(format!("{} background tasks failed", failed)));
        }

        info!("Shutdown complete");
        Ok(())
    }
}

fn to_chrono(duration: Duration, key: &str) -> DaemonResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| DaemonError::Config(format!("{} is out of range", key)))
}

// =============================================================================
// Background loops
// =============================================================================

/// Consume the dispatch queue until shutdown.
///
/// Shutdown is only observed between jobs; a job in flight runs to the end.
async fn run_worker(
    index: usize,
    worker: FulfillmentWorker,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(worker = index, "Fulfillment worker started");

    while !shutdown.is_cancelled() {
        match worker.poll_once().await {
            Ok(Some(outcome)) => {
                debug!(worker = index, ?outcome, "Dispatch job handled");
                continue;
            },
            Ok(None) => {},
            Err(e) => {
                error!(worker = index, error = %e, "Dispatch job failed");
            },
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!(worker = index, "Fulfillment worker stopped");
}

/// Reconcile on a fixed interval until shutdown.
async fn run_reconciler(reconciler: Reconciler, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match reconciler.run_once().await {
                    Ok(report) if report.checked > 0 || report.requeued > 0 => {
                        info!(
                            checked = report.checked,
                            progressed = report.progressed,
                            completed = report.completed,
                            partial = report.partial,
                            refunded = report.refunded,
                            failed = report.failed,
                            requeued = report.requeued,
                            "Reconciliation pass finished"
                        );
                    },
                    Ok(_) => {},
                    Err(e) => error!(error = %e, "Reconciliation pass failed"),
                }
            }
        }
    }

    debug!("Reconciler stopped");
}

/// Sync catalog rates on a fixed interval until shutdown.
async fn run_rate_sync(rate_sync: RateSync, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match rate_sync.run_once().await {
                    Ok(report) => info!(
                        providers = report.providers,
                        providers_failed = report.providers_failed,
                        repriced = report.repriced,
                        "Rate sync finished"
                    ),
                    Err(e) => error!(error = %e, "Rate sync failed"),
                }
            }
        }
    }

    debug!("Rate sync stopped");
}

// =============================================================================
// Tests
// =============================================================================
