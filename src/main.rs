//! Fraudwatch service binary: wire the engine, registry, reload loop,
//! outbox worker, and HTTP surface together, then serve until signalled.

use anyhow::{Context, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fraudwatch_backend::{
    engine::evaluator::Evaluator,
    middleware::AdmissionController,
    models::Config,
    outbox::{stream::StreamOutboxConfig, OutboxWorker, StreamOutbox},
    publish::{DecisionPublisher, NoopPublisher, PublishQueue, StreamPublisher},
    registry::{FieldRegistryService, RulesetRegistry},
    reload::HotReloadCoordinator,
    service::EvalService,
    state::AppState,
    storage::{ArtifactLoader, HttpBlobStore},
    velocity::{RedisVelocityCounter, UnavailableVelocity, VelocityCheck},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    info!(port = config.port, "🚀 Fraudwatch monitoring service starting");

    let metrics_handle = match metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder install failed; /metrics disabled");
            None
        }
    };

    // Blob storage + artifact loader.
    let blob = Arc::new(
        HttpBlobStore::new(&config.blob_endpoint, &config.blob_bucket, &config.blob_region)
            .context("Failed to build blob store client")?,
    );
    let loader = Arc::new(ArtifactLoader::new(
        blob,
        &config.blob_prefix,
        &config.blob_env,
    ));

    // Field registry starts from the builtin bootstrap; startup validation
    // swaps in the published registry or aborts.
    let fields = Arc::new(FieldRegistryService::new(loader.load_builtin()));
    let registry = Arc::new(RulesetRegistry::new(loader.clone(), fields.clone()));

    let coordinator = Arc::new(HotReloadCoordinator::new(
        loader.clone(),
        fields.clone(),
        registry.clone(),
        config.poll_interval_seconds,
        config.required_ruleset_keys.clone(),
    ));

    // Fail fast: a started process guarantees a coherent ruleset/registry
    // pair. Exit non-zero when required artifacts are missing.
    if let Err(e) = coordinator.bootstrap().await {
        error!(error = %e, "Startup artifact validation failed");
        return Err(e);
    }

    // Redis carries velocity counters, the outbox stream, and the decision
    // stream. When it is unreachable at startup the service still runs:
    // velocity reports unavailable and publishing is a no-op, both visible
    // in metrics.
    let shared_redis = connect_redis(&config.redis_url).await;
    let outbox_redis = match &shared_redis {
        Some(_) => connect_redis(&config.redis_url).await,
        None => None,
    };

    let velocity: Arc<dyn VelocityCheck> = match &shared_redis {
        Some(client) => Arc::new(RedisVelocityCounter::new(
            client.clone(),
            config.velocity_scope_prefix.clone(),
            config.velocity_default_window_seconds,
            config.velocity_default_threshold,
            config.velocity_deadline_ms,
        )),
        None => Arc::new(UnavailableVelocity),
    };

    let publisher: Arc<dyn DecisionPublisher> = match &shared_redis {
        Some(client) => Arc::new(StreamPublisher::new(
            client.clone(),
            config.decision_stream_key.clone(),
        )),
        None => Arc::new(NoopPublisher),
    };

    let evaluator = Arc::new(Evaluator::new(velocity, config.debug.clone()));
    let service = Arc::new(EvalService::new(
        config.clone(),
        fields.clone(),
        registry.clone(),
        evaluator,
    ));

    let (publish_queue, publish_handle) =
        PublishQueue::start(publisher.clone(), config.publish_queue_capacity);

    let state = AppState {
        config: config.clone(),
        service: service.clone(),
        fields,
        registry: registry.clone(),
        loader,
        admission: Arc::new(AdmissionController::new(config.max_concurrent)),
        publish: publish_queue.clone(),
        ready: Arc::new(AtomicBool::new(true)),
        metrics: metrics_handle,
    };

    // Background workers on their own tasks; neither touches request
    // latency.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reload_handle = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    let outbox_handle = match outbox_redis {
        Some(client) => {
            // Dedicated connection: XREADGROUP blocks and must not share
            // the multiplexed command connection.
            let outbox = Arc::new(StreamOutbox::new(
                client,
                StreamOutboxConfig {
                    stream_key: config.outbox_stream_key.clone(),
                    group: config.outbox_group.clone(),
                    consumer: config.outbox_consumer.clone(),
                    batch_size: config.outbox_batch_size,
                    block_ms: config.outbox_block_ms,
                    claim_idle_ms: config.outbox_claim_idle_ms,
                },
            ));
            let worker = Arc::new(OutboxWorker::new(
                outbox,
                publisher,
                service,
                Duration::from_millis(config.outbox_claim_idle_ms),
            ));
            Some(tokio::spawn(worker.run(shutdown_rx)))
        }
        None => {
            warn!("Outbox consumer disabled: Redis unavailable");
            None
        }
    };

    let app = fraudwatch_backend::api::router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "🎯 API server listening");

    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    let drain_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received; draining");
            // Readiness flips first so load balancers stop routing here,
            // then in-flight requests get the grace window.
            drain_state.set_ready(false);
            tokio::time::sleep(grace).await;
        })
        .await
        .context("Server error")?;

    // Stop background workers, then drain the publish queue.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(grace, reload_handle).await.is_err() {
        warn!("Hot-reload loop did not stop in time");
    }
    if let Some(handle) = outbox_handle {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("Outbox worker did not stop in time");
        }
    }
    // Drop the state's queue handle so the channel closes and the drain
    // below can actually finish.
    drop(state);
    publish_queue.shutdown(publish_handle, grace).await;

    if let Some(client) = shared_redis {
        let _ = fred::interfaces::ClientLike::quit(&client).await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "fraudwatch_backend=info,fraudwatch=info,tower_http=warn",
            )
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect_redis(url: &str) -> Option<fred::clients::Client> {
    use fred::interfaces::ClientLike;

    let redis_config = match fred::types::config::Config::from_url(url) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Invalid Redis URL");
            return None;
        }
    };

    let client = match fred::types::Builder::from_config(redis_config).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build Redis client");
            return None;
        }
    };

    match client.init().await {
        Ok(_) => Some(client),
        Err(e) => {
            warn!(error = %e, "Redis connection failed; running degraded");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
