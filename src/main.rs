mod api;
mod avatars;

use clap::{Parser, Subcommand};
use pos_core::config::{self, Config};
use pos_core::shellexpand;
use pos_memory::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "pos",
    version,
    about = "POS: Present Operating System backend"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml", env = "POS_CONFIG")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server.
    Start,
    /// Show configuration and database status.
    Status,
    /// Print a user's avatar stats as JSON.
    Stats {
        /// The user id.
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _guard = init_logging(&cfg, matches!(cli.command, Commands::Start))?;
    if let Some(notice) = missing_config_notice(&cli.config) {
        tracing::info!("{notice}");
    }

    match cli.command {
        Commands::Start => {
            if !cfg.api.enabled {
                anyhow::bail!("API is disabled. Set [api] enabled = true in {}.", cli.config);
            }

            let store = Store::new(&cfg.memory).await?;
            let service = Arc::new(avatars::AvatarService::new(store, cfg.avatars.clone()));
            let state = api::ApiState::new(service, &cfg.api, cfg.pos.timezone.clone());

            println!("{}: starting API server...", cfg.pos.name);
            tracing::info!(
                "avatars: {} defaults, snapshot policy {:?}",
                cfg.avatars.defaults.len(),
                cfg.avatars.snapshot_policy
            );
            api::serve(&cfg.api, state).await?;
        }
        Commands::Status => {
            println!("{}: status check\n", cfg.pos.name);
            println!("Config: {}", cli.config);
            println!("Database: {}", shellexpand(&cfg.memory.db_path));

            let store = Store::new(&cfg.memory).await?;
            let size = store.db_size().await?;
            let users = store.list_users().await?;
            println!("  size: {:.1} KiB", size as f64 / 1024.0);
            println!("  active users: {}", users.len());
            println!();
            println!(
                "API: {}",
                if cfg.api.enabled {
                    format!("{}:{}", cfg.api.host, cfg.api.port)
                } else {
                    "disabled".to_string()
                }
            );
            println!("Default avatars: {}", cfg.avatars.defaults.join(", "));
        }
        Commands::Stats { user_id } => {
            let store = Store::new(&cfg.memory).await?;
            let service = avatars::AvatarService::new(store, cfg.avatars.clone());
            let overview = service.overview(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }
    }

    Ok(())
}

/// The line to log when `path` does not exist and defaults are in use.
fn missing_config_notice(path: &str) -> Option<String> {
    if Path::new(path).exists() {
        None
    } else {
        Some(format!("Config file not found at {path}, using defaults"))
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over `pos.log_level`.
///
/// With `to_file`, events are also written to `{data_dir}/logs/pos.log`,
/// rotated daily. Keep the returned guard alive to flush the file writer.
fn init_logging(cfg: &Config, to_file: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.pos.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if !to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    }

    let dir = PathBuf::from(shellexpand(&cfg.pos.data_dir)).join("logs");
    std::fs::create_dir_all(&dir)?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "pos.log"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}
