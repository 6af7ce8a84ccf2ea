use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_server::{
    app::{self, AppState},
    auth::TokenVerifier,
    cache::{memory::MemoryBackend, redis::RedisBackend, CacheBackend, DistributedCache},
    config::Config,
    hub::Hub,
    ingest::Pipeline,
    metrics::MetricsRecorder,
    rate_limit::RateLimiter,
    replay::ReplayEngine,
    resume::{ResumeStore, SNAPSHOT_INTERVAL},
    store::{MessagesWrite, Storage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "info".to_string()
        }
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Courier messaging server");

    let config = Arc::new(Config::from_env()?);
    tracing::info!(
        storage = ?config.storage_driver,
        redis = config.redis_url.is_some(),
        rate_limit_disabled = config.rate_limit_disabled,
        jwt_key_configured = config.jwt_public_key.is_some() || config.jwt_secret.is_some(),
        "Configuration loaded"
    );

    let metrics_recorder = MetricsRecorder::install();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    let storage = Storage::from_config(&config).await?;
    tracing::info!("Storage initialized");

    let backend: Arc<dyn CacheBackend> = match &config.redis_url {
        Some(url) => Arc::new(RedisBackend::connect(url).await?),
        None => {
            tracing::warn!("REDIS_URL not set; using in-process cache backend");
            Arc::new(MemoryBackend::new())
        }
    };
    let cache = DistributedCache::new("courier", backend);
    tracing::info!(node = cache.node_id(), "Cache initialized");

    let resume_store = Arc::new(ResumeStore::new(cache.clone()));
    let hub = Hub::new(resume_store);
    let replay = Arc::new(ReplayEngine::new(storage.messages_read.clone()));
    let limiter = Arc::new(RateLimiter::new(
        Some(cache.clone()),
        config.rate_limit_disabled,
    ));
    let pipeline = Pipeline::new(
        storage.clone(),
        cache.clone(),
        limiter.clone(),
        hub.clone(),
    );
    let verifier = TokenVerifier::from_config(&config)?;

    // Idempotency sweep: expired reservations, hourly.
    let sweep_messages = storage.messages_write.clone();
    tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(3600));
        loop {
            timer.tick().await;
            match sweep_messages.sweep_idempotency(chrono::Utc::now()).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "idempotency sweep completed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "idempotency sweep failed"),
            }
        }
    });

    // Rate limiter window sweep, every 5 minutes.
    let sweep_limiter = limiter.clone();
    tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(300));
        loop {
            timer.tick().await;
            sweep_limiter.sweep(Duration::from_secs(600));
        }
    });

    // Resume snapshots for dirty live sessions.
    let snapshot_hub = hub.clone();
    tokio::spawn(async move {
        let mut timer = interval(SNAPSHOT_INTERVAL);
        loop {
            timer.tick().await;
            snapshot_hub.snapshot_dirty().await;
        }
    });

    let state = AppState {
        config: config.clone(),
        storage,
        cache: cache.clone(),
        hub: hub.clone(),
        pipeline,
        limiter,
        verifier,
        replay,
        metrics_handle,
    };
    let app = app::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting happened above; now drain sessions and close clients.
    tracing::info!("Shutting down: draining sessions");
    hub.shutdown(Duration::from_secs(30)).await;
    cache.dispose().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
