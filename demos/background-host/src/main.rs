//! Background coordinator hosted over stdin/stdout.
//!
//! Run with: cargo run -p background-host
//!
//! Then write one frame per line, e.g.
//! `{"id":1,"origin":{"context":"panel"},"message":{"type":"PING"}}`.
//! Logs go to stderr so stdout carries only reply frames.
//!
//! No content scripts live in this process, so the page registry stays empty
//! and `EXTRACT_PAGE_TEXT` / `EXTRACT_LINKS` always answer
//! `unreachable_context`. Embedders that host content contexts register them
//! with `Router::pages().register(tab_id, page)` before spawning the router.

mod config;

use std::sync::Arc;

use aegis_session::{
    AcknowledgingResponder, ConversationManager, SessionStore, detect_install_reason,
    on_installed, storage::FileStorage,
};
use aegis_transport::{PageRegistry, Router, stdio};
use anyhow::Context;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::HostConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .init();

    let storage_path = config.storage_path();
    let storage = FileStorage::open_with_quota(&storage_path, config.quota_bytes)
        .await
        .with_context(|| format!("opening storage at {}", storage_path.display()))?;
    let store = Arc::new(
        SessionStore::load_with_history(storage, config.status_history)
            .await
            .context("loading session state")?,
    );

    let version = env!("CARGO_PKG_VERSION");
    if let Some(reason) = detect_install_reason(&store, version).await? {
        on_installed(&store, &reason, version).await?;
    }

    let conversation = ConversationManager::new(
        Arc::clone(&store),
        Arc::new(AcknowledgingResponder::new(config.responder_delay())),
    );
    // Empty: see the module docs
    let pages = PageRegistry::new();
    let (handle, router_task) = Router::new(Arc::new(conversation), pages).spawn();

    tracing::info!(storage = %storage_path.display(), "background coordinator ready");

    stdio::serve(handle, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;

    router_task.abort();
    tracing::info!("input closed; shutting down");
    Ok(())
}
