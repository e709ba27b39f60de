use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use levels_zones::config::{default_consumer_name, StageConfig};
use levels_zones::replay::{run_replay, Fixture, ReplayOptions};

#[derive(Parser, Debug)]
#[command(name = "levels-zones")]
#[command(author, version, about = "Level achievement and zone completion stage")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Quiet period before the ingestion mode is re-checked while waiting
    #[arg(long, global = true, env = "SYNC_POLL_INTERVAL_SECS", default_value = "5")]
    sync_poll_interval_secs: u64,

    /// Hard ceiling on the wait for one downstream confirmation
    #[arg(long, global = true, env = "MAX_SYNC_WAIT_SECS", default_value = "60")]
    max_sync_wait_secs: u64,

    /// Consumer group on the input stream
    #[arg(long, global = true, env = "CONSUMER_GROUP", default_value = "03_levels_and_zones")]
    consumer_group: String,

    /// Consumer name (defaults to `{group}-{pid}`)
    #[arg(long, global = true, env = "CONSUMER_NAME")]
    consumer_name: Option<String>,

    /// JSON file with per-zone-kind tracking thresholds
    #[arg(long, global = true, env = "TRACKING_POLICY")]
    policy: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a fixture through the stage against the in-memory backend
    Replay {
        /// Fixture with statuses, zones, levels and bars
        #[arg(short, long)]
        fixture: PathBuf,

        /// Delay before the simulated downstream stage confirms a bar
        #[arg(long, default_value = "0")]
        echo_delay_ms: u64,

        /// Withhold every n-th confirmation
        #[arg(long)]
        drop_every: Option<usize>,
    },

    /// Print the effective configuration as JSON
    Config,
}

impl Args {
    fn stage_config(&self) -> Result<StageConfig> {
        let mut config = StageConfig {
            sync_poll_interval_secs: self.sync_poll_interval_secs,
            max_sync_wait_secs: self.max_sync_wait_secs,
            consumer_name: self
                .consumer_name
                .clone()
                .unwrap_or_else(|| default_consumer_name(&self.consumer_group)),
            consumer_group: self.consumer_group.clone(),
            ..Default::default()
        };

        if let Some(path) = &self.policy {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading policy {}", path.display()))?;
            config.policy = serde_json::from_str(&raw)
                .with_context(|| format!("parsing policy {}", path.display()))?;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("levels_zones=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.stage_config()?;

    match args.command {
        Commands::Replay {
            fixture,
            echo_delay_ms,
            drop_every,
        } => {
            let raw = std::fs::read_to_string(&fixture)
                .with_context(|| format!("reading fixture {}", fixture.display()))?;
            let fixture = Fixture::from_json(&raw).context("parsing fixture")?;

            info!("Listening on {}", config.input_stream);
            info!("Producing to {}", config.output_stream);
            info!("Confirmations on {}", config.notification_channel);
            info!("Consumer: {} ({})", config.consumer_name, config.consumer_group);
            info!(
                "Sync: poll {}s, ceiling {}s",
                config.sync_poll_interval_secs, config.max_sync_wait_secs
            );

            let options = ReplayOptions {
                echo_delay: Duration::from_millis(echo_delay_ms),
                drop_every,
            };
            let shutdown = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("Ctrl-C handler unavailable");
                    std::future::pending::<()>().await;
                }
            };

            let report = run_replay(fixture, config, options, shutdown).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
