// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use line_relay::{config::Config, relay::Relay};

#[derive(Debug, Parser)]
#[command(name = "relay-server", version, about = "Line-protocol write relay")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let env_filter = format!(
        "h2=off,hyper=off,reqwest=off,rustls=off,{}",
        config.log_level
    );
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).context("parsing log level")?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let mut relay = Relay::start(&config).await.context("starting relay")?;
    info!(
        "Relay started with {} destinations",
        relay.registry().destinations().len()
    );

    tokio::select! {
        () = shutdown_signal() => {}
        e = relay.listener_failed() => error!("Stopping after listener failure: {e}"),
    }

    if relay.drain().await {
        info!("Relay stopped");
    } else {
        error!("Relay stopped before every queue was drained");
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Unable to listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("Termination signal received");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Termination signal received");
}
