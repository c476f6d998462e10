//! Gift sale monitor
//!
//! Polls the marketplace for purchases and posts each new sale to a Telegram
//! channel. Settings come from the environment or a `.env` file.
//!
//! Usage:
//!   BOT_TOKEN=... CHANNEL_USERNAME=@channel cargo run --bin gift_monitor

use anyhow::{Context, Result};
use gift_sale_monitor::engine::config::{ChatConfig, MonitorConfig};
use gift_sale_monitor::engine::logging::init_logging;
use gift_sale_monitor::engine::market::MarketClient;
use gift_sale_monitor::engine::publisher::TelegramBot;
use gift_sale_monitor::engine::supervisor::{ExitReason, Monitor};
use gift_sale_monitor::engine::token::{CommandTokenSource, FileWatchTokenSource, TokenSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const TOKEN_FILE_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cfg = MonitorConfig::from_env();
    let _log_guard = init_logging(&cfg.log);

    match run(cfg).await {
        Ok(ExitReason::Signal) => {}
        Ok(ExitReason::TooManyFailures) => std::process::exit(2),
        Err(e) => {
            error!(err = %format!("{e:#}"), "startup failed");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cfg: MonitorConfig) -> Result<ExitReason> {
    let chat = ChatConfig::from_env()?;

    let feed = MarketClient::new(&cfg.api_url, cfg.retry_attempts, cfg.request_timeout)
        .context("marketplace client")?;
    let bot = TelegramBot::new(&chat.api_url, &chat.bot_token, cfg.request_timeout)
        .context("telegram client")?;
    let source: Arc<dyn TokenSource> = match &cfg.token_source_cmd {
        Some(cmd) => {
            info!("credentials come from TOKEN_SOURCE_CMD");
            Arc::new(CommandTokenSource::new(cmd.clone()))
        }
        None => {
            info!(
                path = %cfg.token_file.display(),
                "credentials come from the token file"
            );
            Arc::new(FileWatchTokenSource::new(&cfg.token_file, TOKEN_FILE_POLL))
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("signal received, stopping after the current step");
        let _ = stop_tx.send(true);
        // keep the sender alive so the monitor never sees a closed channel
        std::future::pending::<()>().await;
    });

    let monitor = Monitor::new(
        cfg,
        Arc::new(feed),
        Arc::new(bot),
        source,
        &chat.channel,
        stop_rx,
    );
    Ok(monitor.run().await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(err = %e, "could not install SIGTERM handler");
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
