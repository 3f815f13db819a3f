//! CLI for TopicMQ
//!
//! Runs the broker behind a WebSocket listener until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use topicmq::broker::Broker;
use topicmq::config::{Settings, load_config, load_config_from};
use topicmq::transport::{TransportOptions, bind, start_websocket_server};
use topicmq::utils::logging::{self, TracingSink};

#[derive(Parser)]
#[command(name = "topicmq", version, about)]
struct Cli {
    /// Configuration file. Defaults to `config/default.toml` when present.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let settings = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run_server(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = settings.credential_store();
    if credentials.is_empty() {
        warn!("No credentials configured; every connect will be refused");
    }

    let broker =
        Arc::new(Broker::new(credentials, settings.broker_options()).with_event_sink(TracingSink));

    let listener = bind(
        &settings.server.host,
        settings.server.listen_port,
        settings.server.connection_backlog,
    )
    .await?;

    let options = TransportOptions {
        connect_timeout: settings.connect_timeout(),
        ..TransportOptions::default()
    };

    let retry = tokio::spawn(Broker::start_retry_loop(broker.clone()));

    tokio::select! {
        _ = start_websocket_server(listener, broker.clone(), options) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    retry.abort();
    broker.shutdown();
    info!("Processed {} messages", broker.published_count());
    Ok(())
}
