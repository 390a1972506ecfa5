use std::path::{Path, PathBuf};
use std::process::ExitCode;

use batchrun::batchrun_core::{
    OperationId, OperationStore as _, Reaper, Settings, config::LoggingSettings, utils::Ticker,
};
use batchrun::batchrun_sqlx::PgOperationStore;
use clap::{Parser, Subcommand};
use futures::StreamExt as _;

const DEFAULT_CONFIG_PATH: &str = "batchrun.toml";

/// Inspect and maintain batch operations.
#[derive(Parser)]
#[command(name = "batchrun", version, about = "Inspect and maintain batch operations")]
struct Cli {
    /// Path to the TOML config file (default: ./batchrun.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the queue name derived from the default queue URL
    QueueName,

    /// Create or upgrade the batch_operations table
    Migrate,

    /// Print one batch operation as JSON
    Status {
        /// Batch operation identifier
        id: String,
    },

    /// Fail operations stuck in `running`
    Reap {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn load_settings(explicit: Option<&Path>) -> Result<Settings, BoxError> {
    let fallback = Path::new(DEFAULT_CONFIG_PATH);
    let path = match explicit {
        Some(path) => Some(path),
        None if fallback.exists() => Some(fallback),
        None => None,
    };
    Ok(Settings::load(path)?)
}

fn init_logging(logging: &LoggingSettings) -> Result<(), BoxError> {
    let level = logging.level.parse::<tracing::Level>()?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    match logging.format.as_str() {
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn connect(settings: &Settings) -> Result<PgOperationStore, BoxError> {
    let database_url = settings.database_url.as_deref().ok_or_else(|| {
        format!(
            "database_url is not configured (set it in the config file or {})",
            Settings::ENV_DATABASE_URL
        )
    })?;
    Ok(PgOperationStore::connect(database_url).await?)
}

async fn run(cli: Cli, settings: Settings) -> Result<(), BoxError> {
    match cli.command {
        Commands::QueueName => {
            match settings.queue_config().default_queue_name() {
                Some(name) => println!("{name}"),
                None => tracing::info!("no default queue configured"),
            }
            Ok(())
        }
        Commands::Migrate => {
            let store = connect(&settings).await?;
            store.migrate().await?;
            tracing::info!("batch_operations schema is up to date");
            Ok(())
        }
        Commands::Status { id } => {
            let store = connect(&settings).await?;
            let record = store.fetch(&OperationId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Reap { once } => {
            let store = connect(&settings).await?;
            let reaper = Reaper::new(store, settings.reaper.stale_after())
                .batch_size(settings.reaper.batch_size);

            if once {
                let reaped = reaper.sweep().await?;
                tracing::info!(reaped, "reaper sweep finished");
                return Ok(());
            }

            let token = tokio_util::sync::CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %error, "Failed to listen for ctrl-c");
                }
                signal_token.cancel();
            });

            let tick = futures::stream::once(futures::future::ready(()))
                .chain(Ticker::new(settings.reaper.interval()));
            tracing::info!(
                interval_secs = settings.reaper.interval_secs,
                stale_after_secs = settings.reaper.stale_after_secs,
                "reaper started"
            );
            reaper.run(tick, token.cancelled_owned()).await;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = init_logging(&settings.logging) {
        eprintln!("error: {error}");
        return ExitCode::FAILURE;
    }

    match run(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "command failed");
            ExitCode::FAILURE
        }
    }
}
