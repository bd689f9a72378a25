//! MangaTrack server binary: wires the stores, workers, and HTTP surface
//! together and supervises graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mangatrack_config::Settings;
use mangatrack_core::audit::AuditLogger;
use mangatrack_core::fanout::{
    DeliveryWorker, FanoutConfig, FanoutPipeline, FanoutWorker, PostgresFanoutStore,
    RedisCoalesceSlot,
};
use mangatrack_core::gatekeeper::CrawlGatekeeper;
use mangatrack_core::library::{
    ImportWorker, MetadataRetry, MetadataRetryConfig, PostgresLibraryStore,
};
use mangatrack_core::outbox::{PostgresReconcilerStore, Reconciler};
use mangatrack_core::progress::{PostgresProgressStore, ProgressEngine, TrustConfig};
use mangatrack_core::queue::{PostgresQueue, QueueName, QueueService};
use mangatrack_core::ratelimit::FixedWindowLimiter;
use mangatrack_core::security::{CsrfPolicy, PostgresLoginAttemptStore, LoginAttemptStore};
use mangatrack_core::sync::{
    AdapterRegistry, HttpSourceAdapter, PeriodicSweep, PostgresSyncStore, SweepConfig,
    SweepLeadership, SyncScheduleConfig, SyncWorker, SyncWorkerConfig,
};

mod auth;
mod errors;
mod handlers;
mod middleware;
mod routes;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Arc::new(Settings::from_env().context("configuration")?);
    info!(env = ?settings.environment, "starting mangatrack server");

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.database_url)
        .await
        .context("postgres connect")?;
    sqlx::migrate!("../mangatrack-core/migrations")
        .run(&pool)
        .await
        .context("migrations")?;

    let redis_client =
        redis::Client::open(settings.redis_url.as_str()).context("redis client")?;
    let redis = ConnectionManager::new(redis_client)
        .await
        .context("redis connect")?;

    let queue: Arc<dyn QueueService> = Arc::new(PostgresQueue::new(pool.clone()).await?);
    let limiter = Arc::new(FixedWindowLimiter::new(redis.clone()));

    let sync_store = Arc::new(PostgresSyncStore::new(pool.clone()));
    let gatekeeper = Arc::new(CrawlGatekeeper::new(queue.clone(), sync_store.clone()));

    let progress_store = Arc::new(PostgresProgressStore::new(pool.clone()));
    let progress = Arc::new(ProgressEngine::new(
        progress_store.clone(),
        TrustConfig::default(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(PostgresReconcilerStore::new(pool.clone())),
        progress.clone(),
    ));
    let library_store = Arc::new(PostgresLibraryStore::new(pool.clone()));
    let metadata_retry = Arc::new(MetadataRetry::new(
        library_store.clone(),
        queue.clone(),
        MetadataRetryConfig::default(),
    ));

    let fanout_repo = Arc::new(PostgresFanoutStore::new(pool.clone()));
    let pipeline = Arc::new(FanoutPipeline::new(
        fanout_repo.clone(),
        queue.clone(),
        Arc::new(RedisCoalesceSlot::new(redis.clone())),
        limiter.clone(),
        FanoutConfig::default(),
    ));

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(
        HttpSourceAdapter::new(
            "mangadex",
            "https://api.mangadex.org",
            limiter.clone(),
            5,
            Duration::from_secs(30),
        )
        .map_err(|e| anyhow::anyhow!("adapter setup: {e}"))?,
    ));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for index in 0..settings.sync_workers {
        let worker = SyncWorker::new(
            queue.clone(),
            sync_store.clone(),
            adapters.clone(),
            SyncScheduleConfig::default(),
            SyncWorkerConfig::default(),
            format!("sync-{index}"),
        );
        tasks.push(tokio::spawn(worker.run(cancel.clone())));
    }

    tasks.push(tokio::spawn(
        FanoutWorker::new(pipeline.clone(), queue.clone(), "fanout-0").run(cancel.clone()),
    ));
    for (queue_name, worker_id) in [
        (QueueName::NotificationDelivery, "delivery-0"),
        (QueueName::NotificationDeliveryPremium, "delivery-premium-0"),
    ] {
        tasks.push(tokio::spawn(
            DeliveryWorker::new(fanout_repo.clone(), queue.clone(), queue_name, worker_id)
                .run(cancel.clone()),
        ));
    }
    tasks.push(tokio::spawn(
        ImportWorker::new(
            queue.clone(),
            library_store.clone(),
            progress.clone(),
            "import-0",
        )
        .run(cancel.clone()),
    ));

    let sweep = PeriodicSweep::new(
        sync_store.clone(),
        gatekeeper.clone(),
        Some(SweepLeadership::new(
            redis.clone(),
            Duration::from_secs(90),
        )),
        SweepConfig {
            interval: settings.sweep_interval,
            ..SweepConfig::default()
        },
    );
    tasks.push(tokio::spawn(sweep.run(cancel.clone())));

    // Maintenance: retention sweeps and the chapters_read counter
    // reconciliation.
    {
        let queue = queue.clone();
        let attempts = PostgresLoginAttemptStore::new(pool.clone());
        let progress_store = progress_store.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3_600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match queue.prune_failed(Utc::now() - ChronoDuration::days(7)).await {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "failed jobs pruned"),
                    Err(err) => warn!(error = %err, "failed-job retention sweep failed"),
                }
                match attempts.prune(Utc::now() - ChronoDuration::hours(24)).await {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "stale login attempts pruned"),
                    Err(err) => warn!(error = %err, "login-attempt retention sweep failed"),
                }
                match progress_store.reconcile_all_chapters_read().await {
                    Ok(0) => {}
                    Ok(drifted) => info!(drifted, "chapters_read counters reconciled"),
                    Err(err) => warn!(error = %err, "counter reconciliation failed"),
                }
            }
        }));
    }

    let app_state = AppState {
        settings: settings.clone(),
        queue: queue.clone(),
        reconciler,
        progress,
        metadata_retry,
        limiter,
        csrf: Arc::new(CsrfPolicy::new(
            &settings.canonical_url,
            settings.csrf_allowed_origins.clone(),
            !settings.environment.is_development(),
        )),
        audit: AuditLogger::new(pool.clone()),
    };

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .context("bind")?;
    info!(addr = %settings.bind_addr, "listening");

    let shutdown = cancel.clone();
    axum::serve(listener, routes::router(app_state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("server")?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("mangatrack server stopped");
    Ok(())
}
