/*!
 * NETVIGIL KERNEL - Point d'entrée du service de télémétrie
 *
 * RÔLE : Construit explicitement chaque service (cache, writer, détecteur,
 * hub, ingestion), les regroupe dans l'AppState et sert l'API HTTP.
 *
 * ARRÊT : Ctrl-C → arrêt du serveur, des tâches périodiques, du relais
 * pub/sub, puis flush final du writer avant la sortie.
 */

use anyhow::Context;
use netvigil_kernel::cache::{backend_from_url, CacheManager};
use netvigil_kernel::config::load_config;
use netvigil_kernel::directory::DeviceDirectory;
use netvigil_kernel::flapping::FlappingDetector;
use netvigil_kernel::health::HealthTracker;
use netvigil_kernel::http::{build_router, AppState};
use netvigil_kernel::hub::{spawn_channel_relay, Hub};
use netvigil_kernel::ingest::MetricIngestor;
use netvigil_kernel::schedule::PeriodicTask;
use netvigil_kernel::writer::{BatchWriter, SqliteStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    // annuaire des équipements
    let directory = Arc::new(DeviceDirectory::from_config(&cfg));
    info!("[kernel] {} devices configured", directory.len());

    // cache : connexion en tâche de fond, le service démarre sans
    let backend = backend_from_url(&cfg.cache.url).context("invalid cache url")?;
    let cache = CacheManager::from_conf(backend, &cfg.cache);
    cache.spawn_connect();

    // store durable + writer
    let store = SqliteStore::connect(&cfg.writer.database_url)
        .await
        .with_context(|| format!("cannot open store {}", cfg.writer.database_url))?;
    let writer = BatchWriter::new(Arc::new(store), cfg.writer.clone());
    writer.start();

    // détecteur de flapping + purge périodique des historiques inactifs
    let flapping = Arc::new(FlappingDetector::new(cfg.flapping.clone()));
    let sweeper_target = flapping.clone();
    let mut sweeper = PeriodicTask::start(
        "flapping-sweep",
        Duration::from_secs(cfg.flapping.sweep_interval_secs.max(1)),
        move || {
            let detector = sweeper_target.clone();
            async move {
                detector.sweep(Instant::now());
            }
        },
    );

    // hub observateurs + relais des canaux du cache
    let hub = Hub::new();
    let relay = spawn_channel_relay(hub.clone(), cache.clone());

    let ingestor = Arc::new(MetricIngestor::new(
        directory,
        writer.clone(),
        cache.clone(),
        flapping,
        hub.clone(),
        cfg.cache.status_ttl(),
    ));

    // fabrique l'état unique pour Axum
    let health_tracker = HealthTracker::new();
    let app_state = AppState {
        ingestor,
        hub,
        cache: cache.clone(),
        writer: writer.clone(),
        health_tracker: health_tracker.clone(),
        api_key: cfg.http.api_key.clone(),
    };

    // démarre la publication auto du health
    let mut health_publisher = health_tracker
        .spawn_health_publisher(app_state.clone(), Duration::from_secs(cfg.health.publish_interval_secs.max(1)));

    // HTTP
    let app = build_router(app_state, cfg.http.max_body_bytes);
    let listener = TcpListener::bind(cfg.http.bind.as_str())
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    if let Err(e) = &served {
        error!("[kernel] http server error: {e}");
    }

    info!("[kernel] shutting down");
    health_publisher.stop().await;
    sweeper.stop().await;
    relay.abort();
    writer.shutdown().await;
    cache.shutdown();

    served.context("http server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[kernel] cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
