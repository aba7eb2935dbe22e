//! Headless voice-assistant entrypoint.
//!
//! Loads the config and cook-mode handoff context, runs the pipeline until
//! the session terminates (or ctrl-c), and prints dialogue to stderr via
//! tracing.

use sous::pipeline::messages::PipelineEvent;
use sous::{CookHandoff, PipelineCoordinator, VoiceConfig};
use std::path::PathBuf;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let log_dir = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sous")
        .join("logs");
    let file_appender = tracing_appender::rolling::daily(log_dir, "sous.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr.and(file_writer))
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = VoiceConfig::default_config_path();
    let config = if config_path.exists() {
        VoiceConfig::from_file(&config_path)?
    } else {
        VoiceConfig::default()
    };

    let handoff_path = handoff_path();
    let handoff = match CookHandoff::load(&handoff_path) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!("no cook handoff context ({e}); starting fresh");
            CookHandoff::default()
        }
    };

    let (event_tx, mut event_rx) = broadcast::channel::<PipelineEvent>(64);
    tokio::spawn(async move {
        while let Ok(ev) = event_rx.recv().await {
            match ev {
                PipelineEvent::MessageAppended(m) | PipelineEvent::MessagePatched(m) => {
                    tracing::info!("[{:?}/{:?}] {}", m.role, m.status, m.text);
                }
                other => tracing::debug!("{other:?}"),
            }
        }
    });

    let coordinator = PipelineCoordinator::new(config, handoff)
        .with_events(event_tx)
        .with_handoff_path(handoff_path);
    let cancel = coordinator.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            cancel.cancel();
        }
    });

    coordinator.run().await.map_err(|e| {
        tracing::error!("pipeline failed: {e}");
        anyhow::anyhow!("sous failed: {e}")
    })?;

    Ok(())
}

fn handoff_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sous")
        .join("cook_state.json")
}
