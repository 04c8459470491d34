use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use irrigation_orchestrator::{
    api::{self, AppState},
    config::{self, Config},
    db::{self, PgHistoryRecorder},
    engine::Engine,
    mqtt::MqttGateway,
    notify::Notifier,
    scheduler::Scheduler,
    status_store::DeviceStatusStore,
    tasks::FileTaskLoader,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent; env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(environment = %config.app_env, "Starting irrigation orchestrator");

    let devices = config::load_devices(&config.device_config_path)
        .with_context(|| format!("Failed to load devices from {}", config.device_config_path))?;
    info!(count = devices.len(), "Device configuration loaded");

    // Connect to DB and run migrations
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");
    let history = Arc::new(PgHistoryRecorder::new(pool));

    // One status store shared by the MQTT dispatcher and the engine
    let store = DeviceStatusStore::new();

    let gateway = MqttGateway::connect(config.mqtt.clone(), store.clone())
        .await
        .context("Failed to connect to MQTT broker")?;
    for device in &devices {
        gateway
            .subscribe_device(&device.id)
            .await
            .with_context(|| format!("Failed to subscribe to status topics of {}", device.id))?;
    }
    info!(devices = devices.len(), "Subscribed to device status topics");

    let notifier = Arc::new(Notifier::from_slack(
        &config.slack_bot_token,
        &config.slack_channel_id,
    ));
    let engine = Arc::new(Engine::new(
        devices,
        store.clone(),
        Arc::new(gateway.clone()),
        Arc::new(FileTaskLoader::new(&config.tasks_dir)),
        notifier,
        history.clone(),
        config.timings,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timers = Scheduler::new(engine.clone(), config.schedule_timezone).spawn(shutdown_rx);
    info!(timers = timers.len(), tz = %config.schedule_timezone, "Job clock started");

    // Start HTTP server
    let state = AppState {
        engine,
        store,
        history,
        signing_secret: config.slack_signing_secret.clone(),
        app_env: config.app_env.clone(),
    };
    if !state.verifies_slack_requests() {
        warn!("SLACK_SIGNING_SECRET is empty; /slack/events accepts unsigned requests");
    }
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for timer in timers {
        if let Err(e) = timer.await {
            error!(error = %e, "Schedule timer ended abnormally");
        }
    }
    gateway.disconnect().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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

    info!("Shutdown signal received");
}
