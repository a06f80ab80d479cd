//! `ocfetch` entry point.
//!
//! Wires the configured collaborators together and runs a recipe, lists
//! the recipe book, or serves health checks. Exits 0 on success and 1 on
//! any error, including an interrupted run.

mod health;
mod recipes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ocfetch_core::config_factory::{create_app_config, AppConfigSettings};
use ocfetch_core::credentials::CredentialSettings;
use ocfetch_core::fetcher::Fetcher;
use ocfetch_core::filters::register_filter_strategies;
use ocfetch_core::model::{FetchPlan, FetchRunContext};
use ocfetch_core::registry::StrategyRegistry;
use ocfetch_http::factories::register_http_strategies;
use ocfetch_http::manager::HttpManager;
use ocfetch_sftp::factories::register_sftp_strategies;
use ocfetch_sftp::manager::SftpManager;
use ocfetch_sftp::session::RusshConnector;
use tokio::sync::watch;
use tracing::{error, info, warn};

use recipes::{generate_run_id, RecipeBook};

#[derive(Debug, Parser)]
#[command(name = "ocfetch", version, about = "Recurrent, resumable registry data fetcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a recipe.
    Run {
        /// Recipe id from the recipe book.
        recipe_id: String,
        /// Credential backend: `aws` or `env`.
        #[arg(long, env = "OC_CREDENTIAL_PROVIDER_TYPE")]
        credentials_provider: Option<String>,
        /// Storage sink: `s3` or `file`.
        #[arg(long, env = "OC_STORAGE_TYPE")]
        storage: Option<String>,
        /// State substrate: `redis` or `memory`.
        #[arg(long = "kvstore", env = "OC_KV_STORE_TYPE")]
        kv_store: Option<String>,
        /// Worker task count.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Log filter (overridden by `RUST_LOG`).
        #[arg(long, default_value = "info")]
        log_level: String,
        /// Recipe directory (default: `OC_RECIPES_DIR` or `recipes`).
        #[arg(long)]
        recipes_dir: Option<PathBuf>,
        /// File sink root when `--storage file`.
        #[arg(long, env = "OC_STORAGE_FILE_PATH")]
        storage_file_path: Option<String>,
    },
    /// List the recipes in the recipe book.
    List {
        /// Recipe directory (default: `OC_RECIPES_DIR` or `recipes`).
        #[arg(long)]
        recipes_dir: Option<PathBuf>,
        /// Log filter (overridden by `RUST_LOG`).
        #[arg(long, default_value = "warn")]
        log_level: String,
    },
    /// Serve `/health`, `/status`, and `/heartbeat`.
    Health {
        /// Bind host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Bind port.
        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
        /// Log filter (overridden by `RUST_LOG`).
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

fn init_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .json()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run {
            recipe_id,
            credentials_provider,
            storage,
            kv_store,
            concurrency,
            log_level,
            recipes_dir,
            storage_file_path,
        } => {
            init_logging(&log_level);
            run_command(
                &recipe_id,
                credentials_provider,
                storage,
                kv_store,
                concurrency,
                recipes_dir,
                storage_file_path,
            )
            .await
        }
        Commands::List {
            recipes_dir,
            log_level,
        } => {
            init_logging(&log_level);
            list_command(recipes_dir)
        }
        Commands::Health {
            host,
            port,
            log_level,
        } => {
            init_logging(&log_level);
            health::serve(&host, port).await
        }
    };

    if let Err(err) = outcome {
        error!(error = %format!("{err:#}"), "ocfetch failed");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    recipe_id: &str,
    credentials_provider: Option<String>,
    storage: Option<String>,
    kv_store: Option<String>,
    concurrency: usize,
    recipes_dir: Option<PathBuf>,
    storage_file_path: Option<String>,
) -> anyhow::Result<()> {
    let run_id = generate_run_id(recipe_id);
    info!(run_id = %run_id, recipe_id, "ocfetch starting");

    let settings = AppConfigSettings {
        credentials: CredentialSettings {
            provider_type: credentials_provider,
            ..CredentialSettings::default()
        },
        kv_store_type: kv_store,
        storage_type: storage,
        file_path: storage_file_path,
        registry_id: std::env::var("OC_CONFIG_ID")
            .ok()
            .or_else(|| Some(recipe_id.to_owned())),
        ..AppConfigSettings::default()
    };
    let app_config = create_app_config(&settings)
        .await
        .context("building application configuration")?;

    // Shared protocol managers feed the strategy registry, so a recipe's
    // loader and locators share their endpoint's rate gates.
    let http_manager = Arc::new(HttpManager::new());
    let sftp_manager = Arc::new(SftpManager::new(Arc::new(RusshConnector::new(
        Duration::from_secs(20),
    ))));

    let mut registry = StrategyRegistry::new();
    register_http_strategies(&mut registry, Arc::clone(&http_manager));
    register_sftp_strategies(&mut registry, Arc::clone(&sftp_manager));
    register_filter_strategies(&mut registry);

    let book = RecipeBook::new(recipes_dir);
    let recipe = book
        .load(recipe_id, &registry)
        .with_context(|| format!("loading recipe '{recipe_id}'"))?;

    let context = Arc::new(FetchRunContext::new(run_id.clone(), app_config));
    let plan = FetchPlan::new(recipe, context, concurrency);

    // Ctrl-C / SIGTERM flip the shutdown flag; the scheduler stops its
    // producer first and lets in-flight loads finish.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx));

    let result = Fetcher::new()
        .run_with_shutdown(plan, shutdown_rx.clone())
        .await
        .context("fetch run failed")?;

    info!(
        run_id = %run_id,
        recipe_id,
        processed = result.processed_count,
        bundles = result.bundles_completed,
        errors = result.errors.len(),
        "fetch run summary"
    );
    for failure in &result.errors {
        warn!(
            run_id = %run_id,
            recipe_id,
            url = failure.url.as_deref().unwrap_or("-"),
            bid = failure.bid.as_deref().unwrap_or("-"),
            error_kind = failure.error_kind,
            error = %failure.message,
            "recorded failure"
        );
    }

    sftp_manager.close().await;

    if *shutdown_rx.borrow() {
        bail!("run interrupted by signal");
    }
    if !result.errors.is_empty() {
        bail!("run finished with {} error(s)", result.errors.len());
    }
    Ok(())
}

fn list_command(recipes_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let book = RecipeBook::new(recipes_dir);
    let recipes = book.list()?;
    if recipes.is_empty() {
        info!(dir = %book.dir().display(), "no recipes found");
        return Ok(());
    }
    for recipe_id in &recipes {
        // Listing is user-facing output, not diagnostics.
        #[allow(clippy::print_stdout)]
        {
            println!("{recipe_id}");
        }
    }
    info!(total = recipes.len(), "recipes listed");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, draining run");
    let _ = shutdown_tx.send(true);
}
