// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_pipeline::{Config, Supervisor};

const DEFAULT_CONFIG_PATH: &str = "telemetry-pipeline.yaml";

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("TELEMETRY_PIPELINE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    if let Err(e) = init_logging(&log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("telemetry pipeline agent failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
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
    Ok(())
}

fn config_path() -> PathBuf {
    env::args_os()
        .nth(1)
        .or_else(|| env::var_os("TELEMETRY_PIPELINE_CONFIG"))
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

async fn run() -> anyhow::Result<()> {
    let path = config_path();
    let config = Config::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    let supervisor = Supervisor::start(config)
        .await
        .context("starting telemetry pipeline")?;
    if let Some(addr) = supervisor.local_addr() {
        info!("ingest listener ready on {addr}");
    }

    wait_for_signal().await?;
    let report = supervisor.shutdown().await;
    if report.pending_envelopes > 0 {
        error!(
            pending_envelopes = report.pending_envelopes,
            "stopped with envelopes that were never routed"
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")
}
