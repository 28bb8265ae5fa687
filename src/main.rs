//! channelgate: HTTP gateway exposing a pool of broadcast tuners as streamable virtual
//! channels with an accompanying EPG.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

mod channel;
mod config;
mod epg;
mod error;
mod logging;
mod tuner;
mod web;

use channel::ChannelRegistry;
use config::Config;
use epg::{EpgOrchestrator, EpgStore};
use tuner::arbiter::TunerArbiter;
use tuner::session::SpawnConfig;
use web::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    logging::init_logging(&config.log_dir, config.log_retention_days, config.verbose)?;

    info!("channelgate starting");
    info!(channels_conf = %config.channels_conf.display(), "loading channel collection");
    let channels = Arc::new(ChannelRegistry::load(&config.channels_conf)?);
    info!(count = channels.all().len(), "channel collection loaded");

    let device_paths = (0..config.tuner_count)
        .map(|i| format!("/dev/dvb/adapter{i}"))
        .collect();
    let arbiter = Arc::new(TunerArbiter::new(device_paths, config.enable_preemption));

    let store_existed_at_boot = EpgStore::exists(&config.store_path);
    let store = Arc::new(EpgStore::open(&config.store_path)?);

    let orchestrator = Arc::new(EpgOrchestrator::new(
        channels.clone(),
        arbiter.clone(),
        store.clone(),
        config.demod_bin.clone(),
        config.channels_conf.clone(),
        store_existed_at_boot,
    ));

    if config.enable_epg {
        orchestrator.clone().spawn();
    } else {
        info!("epg scan orchestrator disabled");
        orchestrator.mark_ready();
    }

    let spawn_config = SpawnConfig {
        demod_bin: config.demod_bin.clone(),
        transcoder_bin: config.transcoder_bin.clone(),
        channels_conf: config.channels_conf.clone(),
    };

    let (shutdown_tx, _) = broadcast::channel(16);

    let state = Arc::new(AppState {
        channels,
        arbiter,
        store,
        orchestrator,
        spawn_config,
        default_mode: config.transcode_mode,
        default_codec: config.transcode_codec,
        base_url: format!("http://localhost:{}", config.port),
        next_session_id: AtomicU64::new(1),
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = web::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    info!("channelgate stopped");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, broadcast it to every active session so they tear down
/// cooperatively, then give them a moment to finish before returning control to `axum::serve`.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
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

    info!("shutdown signal received, draining active sessions");
    let _ = shutdown_tx.send(());
    tokio::time::sleep(Duration::from_secs(3)).await;
}
