//! natterd — natter chat server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use natter_core::{MessageType, NatterConfig};
use natter_services::{
    CountInterceptor, DisplayHandler, Env, OnlineUsers, PongHandler, Registry, Server,
    SessionSettings, SessionTable, UserHandler, USER_HANDLER_CODE,
};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

fn listen_override() -> Result<Option<String>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut listen = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                i += 1;
                listen = Some(args.get(i).context("--listen requires an address")?.clone());
            }
            other => anyhow::bail!("unknown argument: {other} (usage: natterd [--listen <addr>])"),
        }
        i += 1;
    }
    Ok(listen)
}

fn build_registry(config: &NatterConfig) -> Result<Arc<Registry>> {
    let registry = Registry::new();
    registry.add_interceptor(Arc::new(CountInterceptor::new()));
    registry.add_handler(
        MessageType::Display.code(),
        Arc::new(DisplayHandler::logging()),
    )?;
    registry.add_handler(
        MessageType::Pong.code(),
        Arc::new(PongHandler::from_config(&config.liveness)),
    )?;
    registry.add_handler(
        USER_HANDLER_CODE,
        Arc::new(UserHandler::new(OnlineUsers::new())),
    )?;
    Ok(registry)
}

async fn log_sessions(sessions: SessionTable) {
    let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        ticker.tick().await;
        let remotes: Vec<String> = sessions.iter().map(|s| s.key().clone()).collect();
        tracing::debug!(count = remotes.len(), ?remotes, "session snapshot");
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = NatterConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = NatterConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NatterConfig::default()
    });
    if let Some(addr) = listen_override()? {
        config.server.listen_addr = addr;
    }

    let registry = build_registry(&config).context("failed to register handlers")?;
    let server = Server::bind(
        &config.server.listen_addr,
        registry,
        SessionSettings::from_config(&config.wire),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    tracing::info!(addr = %server.local_addr()?, "natterd started");

    let snapshot = tokio::spawn(log_sessions(server.sessions()));

    tokio::select! {
        _ = server.serve() => tracing::error!("accept loop exited"),
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
        }
    }
    snapshot.abort();
    Ok(())
}
