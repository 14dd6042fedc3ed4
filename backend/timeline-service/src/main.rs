use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delivery_outbox::metrics::OutboxMetrics;
use delivery_outbox::worker::{DeliveryWorker, DeliveryWorkerConfig};
use delivery_outbox::{BackoffPolicy, SqlxOutboxRepository};
use stream_broker::{RedisTimelineBroker, TimelineBroker};
use timeline_service::workers::{ConsumerConfig, LoggingFanoutSink, StreamConsumer};
use timeline_service::{config, db};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = match config::Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting timeline-service v{}", env!("CARGO_PKG_VERSION"));

    let pool = db::create_pool(&cfg.database).await?;
    db::migrate(&pool).await?;

    // Two Redis connections: the consumer's blocking reads must not starve
    // the worker's publishes on a shared multiplexed connection.
    let publish_conn = stream_broker::connect(&cfg.broker.redis_url).await?;
    let consume_conn = stream_broker::connect(&cfg.broker.redis_url).await?;

    let broker_cfg = cfg.broker.broker_config();
    let publisher = Arc::new(RedisTimelineBroker::new(publish_conn, broker_cfg.clone()));
    let consumer_broker = Arc::new(RedisTimelineBroker::new(consume_conn, broker_cfg));

    consumer_broker.ensure_group().await?;

    let outbox = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    let metrics = OutboxMetrics::new("timeline-service");

    let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
    let mut worker_cfg = DeliveryWorkerConfig::new(worker_id);
    worker_cfg.batch_size = cfg.outbox.batch_size;
    worker_cfg.poll_interval = Duration::from_millis(cfg.outbox.poll_interval_ms);
    worker_cfg.lock_ttl = Duration::from_millis(cfg.outbox.lock_ttl_ms);
    worker_cfg.publish_concurrency = cfg.outbox.publish_concurrency;
    worker_cfg.backoff = BackoffPolicy::new(
        Duration::from_millis(cfg.outbox.backoff_base_ms),
        Duration::from_millis(cfg.outbox.backoff_max_ms),
    );

    let worker = DeliveryWorker::with_metrics(
        outbox.clone(),
        publisher.clone(),
        worker_cfg,
        metrics.clone(),
    );

    let mut consumer_cfg = ConsumerConfig::new(cfg.broker.consumer_id.clone());
    consumer_cfg.block_ms = cfg.consumer.block_ms;
    consumer_cfg.batch_size = cfg.consumer.batch_size;

    let consumer = StreamConsumer::with_metrics(
        outbox.clone(),
        consumer_broker,
        Arc::new(LoggingFanoutSink),
        consumer_cfg,
        metrics,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = JoinSet::new();
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            worker.run(shutdown).await;
        });
    }
    {
        let shutdown = shutdown_rx;
        tasks.spawn(async move {
            consumer.run(shutdown).await;
        });
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("Task join error: {e}");
        }
    }

    tracing::info!("timeline-service stopped");
    Ok(())
}
