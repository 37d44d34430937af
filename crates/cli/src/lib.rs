//! # keel-cli: command-line runner for keel migrations
//!
//! Wires environment configuration, logging, and the built-in migration
//! registry to the `keel-migrate` engine.

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod migrations;

use std::sync::Arc;

use anyhow::Context;
use keel_migrate::{
    connect, mask_password, CancellationHandle, DatabasePoolConfig, MigrationConfig,
    MigrationRunner,
};
use tokio::task::JoinHandle;

use cli::{Cli, Commands};
use config::Settings;

/// Execute a parsed command against the configured database
pub async fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    if let Commands::New { name, dir } = &cli.command {
        commands::new::create(name, dir)?;
        return Ok(());
    }

    tracing::debug!(
        target: "keel::cli",
        url = %mask_password(&settings.database_url),
        ledger = %settings.ledger_table,
        "Connecting"
    );
    let pool = connect(&settings.database_url, DatabasePoolConfig::default())
        .await
        .with_context(|| format!("Failed to connect to {}", mask_password(&settings.database_url)))?;

    let registry = Arc::new(migrations::registry()?);
    let config = MigrationConfig::default()
        .with_ledger_table(settings.ledger_table.clone())
        .with_lock_timeout(settings.lock_timeout);
    let runner = MigrationRunner::new(registry, pool.clone(), config)?;

    let result = match cli.command {
        Commands::Up { to } => {
            let watcher = cancel_on_ctrl_c(runner.cancellation_handle());
            let result = commands::migrate::up(&runner, to).await;
            watcher.abort();
            result
        }
        Commands::Down(args) => {
            let watcher = cancel_on_ctrl_c(runner.cancellation_handle());
            let result = commands::migrate::down(&runner, args.target()).await;
            watcher.abort();
            result
        }
        Commands::Status { json } => commands::migrate::status(&runner, json).await,
        Commands::Seed => commands::seed::seed(&runner).await.map(|_| ()),
        Commands::New { .. } => Ok(()),
    };

    if let Err(e) = pool.close().await {
        tracing::warn!(target: "keel::cli", error = %e, "Failed to close database pool");
    }
    result
}

/// First Ctrl-C stops the batch before its next step; a second one exits
fn cancel_on_ctrl_c(handle: CancellationHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("⚠️  Interrupt received: finishing the current migration, then stopping");
        handle.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Second interrupt: exiting immediately");
            std::process::exit(130);
        }
    })
}
