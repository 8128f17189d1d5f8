//! Editorial Sync watcher
//!
//! Opens one live document set and logs every change until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Watch planning items with defaults
//! ACCESS_TOKEN=... editorial-sync --set-name planning --doc-type core/planning-item
//!
//! # Custom config, JSON logs
//! editorial-sync --config sync.toml --json-logs
//! ```

use anyhow::Context;
use clap::Parser;
use editorial_sync::{
    GetDocumentsParams, HttpTokenSource, LiveDocuments, LiveOptions, SyncConfig, SyncSession,
    WsConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "editorial-sync")]
#[command(about = "Watch a live document set on the editorial repository")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "EDITORIAL_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Access token used for socket tokens and authentication
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Socket base URL (overrides config)
    #[arg(long, env = "SOCKET_URL")]
    socket_url: Option<String>,

    /// Repository HTTP URL (overrides config)
    #[arg(long, env = "REPOSITORY_URL")]
    repository_url: Option<String>,

    /// Document set name
    #[arg(long, default_value = "planning")]
    set_name: String,

    /// Document type to fetch
    #[arg(long, default_value = "core/planning-item")]
    doc_type: String,

    /// Document types to include as deliverables
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("editorial_sync={},info", args.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args);

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(url) = &args.socket_url {
        config.session.socket_url = url.clone();
    }
    if let Some(url) = &args.repository_url {
        config.session.repository_url = url.clone();
    }
    config.validate()?;

    info!(
        socket_url = %config.session.socket_url,
        repository_url = %config.session.repository_url,
        set_name = %args.set_name,
        "Starting editorial-sync"
    );

    let tokens = HttpTokenSource::new(
        &config.session.repository_url,
        &config.session.token_path,
        config.connect_timeout(),
    )?;
    let session = SyncSession::new(
        config.to_session_config(),
        Arc::new(tokens),
        Arc::new(WsConnector::new(config.connect_timeout())),
    );

    session.on_error(|e| warn!(error = %e, "Connection error"));
    session.on_reconnect(|| info!("Reconnected to repository"));

    session.connect(&args.access_token).await.context("connecting")?;
    session.authenticate().await.context("authenticating")?;

    let params = GetDocumentsParams::new(&args.set_name, &args.doc_type)
        .with_include(args.include.clone());
    let options = LiveOptions {
        debounce: config.debounce(),
        ..Default::default()
    };
    let live = LiveDocuments::open(&session, params, options)
        .await
        .context("opening document set")?;

    info!(documents = live.documents().len(), "Document set loaded");

    let mut changes = live.subscribe();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let documents = changes.borrow_and_update().clone();
                info!(documents = documents.len(), "Document set changed");
                for doc in documents.iter() {
                    if let Some(updater) = &doc.updater {
                        info!(
                            uuid = %doc.uuid(),
                            title = %doc.document.title,
                            updater = %updater.sub,
                            at = %updater.time,
                            "Document"
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    if let Err(e) = live.close().await {
        error!(error = %e, "Failed to close document set");
    }
    session.disconnect();
    Ok(())
}
