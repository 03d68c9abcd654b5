//! maxbridge - a Matrix ↔ Max Messenger puppeting bridge.

mod access;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use maxbridge_core::Config;
use maxbridge_engine::{Engine, LicenseClient, LicenseSchedule};
use maxbridge_matrix::AppserviceClient;
use maxbridge_provisioning::{ProvisioningState, SessionStore};
use maxbridge_store::Store;

use crate::access::EngineAccess;

#[derive(Parser)]
#[command(name = "maxbridge")]
#[command(about = "Matrix ↔ Max Messenger puppeting bridge")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    /// Write a default config file and exit
    GenerateConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    match cli.command {
        Some(Commands::GenerateConfig { force }) => generate_config(&config_path, force),
        Some(Commands::Run) | None => {
            let config = Config::load(&config_path)
                .with_context(|| format!("failed to load config from {}", config_path.display()))?;
            init_tracing(&config);
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?
                .block_on(run(config))
        }
    }
}

fn generate_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    Config::default()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote default config to {}", path.display());
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting maxbridge");

    // License gate: fatal at startup, grace-tracked afterwards.
    let license = LicenseClient::new(config.mergechat.clone());
    if let Err(error) = license.verify_startup().await {
        tracing::error!(%error, "license verification failed");
        std::process::exit(1);
    }

    let store = Store::connect(&config.database.uri)
        .await
        .context("failed to open database")?;

    let bot_mxid = format!(
        "@{}:{}",
        config.appservice.bot_username, config.homeserver.domain
    );
    let appservice = AppserviceClient::new(
        config.homeserver.address.clone(),
        config.appservice.as_token.clone(),
        bot_mxid,
    );

    let provisioning = config.bridge.provisioning.clone();
    let engine = Engine::new(config, store, Arc::new(appservice));
    engine.start().await.context("failed to start bridge")?;

    if provisioning.enabled {
        let state = ProvisioningState {
            access: Arc::new(EngineAccess::new(Arc::clone(&engine))),
            sessions: SessionStore::new(),
            shared_secret: provisioning.shared_secret.clone(),
        };
        let listen = provisioning.listen.clone();
        let prefix = provisioning.prefix.clone();
        tokio::spawn(async move {
            if let Err(error) = maxbridge_provisioning::serve(state, &listen, &prefix).await {
                tracing::error!(%error, "provisioning server failed");
            }
        });
    }

    let schedule = LicenseSchedule::new(license);
    tokio::select! {
        () = schedule.run() => {
            // Grace period expired with the license still invalid.
            engine.stop().await;
            std::process::exit(1);
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down");
            engine.stop().await;
        }
    }
    Ok(())
}
