//! Immortal Streams Agent
//!
//! Serves the HTTP/WebSocket surface until Ctrl-C, then closes every stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use immortal_agent::cli::Args;
use immortal_agent::{http, LocalDialer, ListenerRegistry, Manager};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let directive = if args.verbose {
        "immortal_agent=debug"
    } else {
        "immortal_agent=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    if args.json_logs() {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = args.manager_config();
    info!(
        max_streams = config.max_streams,
        replay_buffer_size = config.pipe.replay_buffer_size,
        "Starting immortal streams agent on {}",
        args.bind
    );

    let dialer = LocalDialer::new(ListenerRegistry::new()).with_timeout(args.dial_timeout());
    let manager = Arc::new(Manager::new(Arc::new(dialer), config));

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };

    http::serve(listener, manager.clone(), shutdown).await?;

    if let Err(e) = manager.close().await {
        error!("Error while closing streams: {}", e);
    }
    info!("Agent stopped");
    Ok(())
}
