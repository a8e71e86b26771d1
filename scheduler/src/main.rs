// Scheduler binary entry point

use common::config::{LockBackend, Settings};
use common::content::ContentResolver;
use common::db::{DbPool, RedisPool};
use common::dispatch::{DispatchGateway, WhatsAppGateway};
use common::generation::{GenerationPipeline, OpenAiGenerator, PdfDocumentRenderer};
use common::lock::{LocalLock, RedLock, ResourceLock};
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerDeps, SequenceScheduler};
use common::sequence::SequenceCatalog;
use common::storage::{MinioClient, MinioDocumentStore};
use common::store::{EnrollmentStore, PgEnrollmentStore};
use common::telemetry::{self, LogAlertNotifier};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!("Starting outreach sequence scheduler");

    let catalog = Arc::new(SequenceCatalog::load(&settings.catalog.path)?);
    info!(
        sequences = catalog.len(),
        triggers = ?catalog.triggers().collect::<Vec<_>>(),
        path = %settings.catalog.path,
        "Sequence catalog loaded"
    );

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;
    db_pool.run_migrations().await?;
    db_pool.health_check().await?;
    info!("Database ready");

    let store: Arc<dyn EnrollmentStore> = Arc::new(PgEnrollmentStore::new(db_pool.clone()));

    let lock: Arc<dyn ResourceLock> = match (settings.scheduler.lock_backend, &settings.redis) {
        (LockBackend::Redis, Some(redis)) => {
            let redis_pool = RedisPool::new(redis).await.map_err(|e| {
                error!(error = %e, "Failed to initialize Redis pool");
                e
            })?;
            redis_pool.ping().await?;
            info!("Using Redis enrollment locks");
            Arc::new(RedLock::new(redis_pool))
        }
        (LockBackend::Redis, None) => {
            anyhow::bail!("lock_backend = redis requires a [redis] section")
        }
        (LockBackend::Local, _) => {
            info!("Using in-process enrollment locks");
            Arc::new(LocalLock::new())
        }
    };

    let minio = MinioClient::new(&settings.minio).await?;
    if let Err(e) = minio.health_check().await {
        // Only generated documents need MinIO; other steps keep flowing
        error!(error = %e, "MinIO is not reachable");
    }

    let pipeline = GenerationPipeline::new(
        Arc::new(OpenAiGenerator::new(&settings.generator)?),
        Arc::new(PdfDocumentRenderer::default()),
        Arc::new(MinioDocumentStore::new(minio)),
    );
    let resolver = Arc::new(ContentResolver::new(pipeline, store.clone())?);
    let gateway: Arc<dyn DispatchGateway> = Arc::new(WhatsAppGateway::new(&settings.whatsapp)?);

    let scheduler = SequenceScheduler::new(
        SchedulerConfig::from(&settings.scheduler),
        SchedulerDeps {
            catalog,
            store,
            resolver,
            gateway,
            lock,
            notifier: Arc::new(LogAlertNotifier),
        },
    );

    let scheduler_for_shutdown = scheduler.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        if let Err(e) = scheduler_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    if let Err(e) = scheduler.start().await {
        error!(error = %e, "Scheduler error");
        return Err(anyhow::anyhow!("Scheduler error: {}", e));
    }

    db_pool.close().await;
    telemetry::shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}
