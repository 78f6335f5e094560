use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use monitor_analytics::DashboardPayload;
use monitor_core::{AppConfig, FileSource, Granularity, RecordSource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chat-monitor",
    about = "Live usage and performance metrics for chat sessions",
    version,
    author
)]
struct Cli {
    /// Path to config file (default: ~/.config/chat-monitor/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dashboard server (default)
    Serve {
        #[command(flatten)]
        source: SourceArgs,
        /// Bind host
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(long)]
        port: Option<u16>,
        /// Seconds between refreshes
        #[arg(long)]
        update_interval: Option<u64>,
        /// Initial time scale for the live series (minute, hour or day)
        #[arg(long)]
        time_scale: Option<String>,
    },

    /// Run one aggregation pass and print the result as JSON
    Snapshot {
        #[command(flatten)]
        source: SourceArgs,
        /// Time scale of the time series (minute, hour or day)
        #[arg(long)]
        time_scale: Option<String>,
        /// Print the dashboard payload instead of the full snapshot
        #[arg(long)]
        dashboard: bool,
    },

    /// Show or manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Directory holding sessions.jsonl and messages.jsonl
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Query window in hours
    #[arg(long)]
    time_range: Option<u32>,
    /// Page size for message reads
    #[arg(long)]
    batch_size: Option<usize>,
}

impl SourceArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(dir) = self.data_dir {
            config.source.data_dir = Some(dir);
        }
        if let Some(hours) = self.time_range {
            config.source.time_range_hours = hours;
        }
        if let Some(size) = self.batch_size {
            config.source.batch_size = size;
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Initialize default configuration file
    Init,
    /// Print config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up tracing.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "chat_monitor=info,monitor_core=info,monitor_analytics=info,monitor_server=info,warn"
                .into()
        }))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load config.
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    match cli.command {
        Some(Commands::Serve {
            source,
            host,
            port,
            update_interval,
            time_scale,
        }) => {
            source.apply(&mut config);
            if let Some(h) = host {
                config.server.host = h;
            }
            if let Some(p) = port {
                config.server.port = p;
            }
            if let Some(secs) = update_interval {
                config.refresh.interval_secs = secs;
            }
            if let Some(scale) = time_scale {
                config.refresh.default_scale = Granularity::parse_live(&scale)?;
            }
            serve(config).await?;
        }
        Some(Commands::Snapshot {
            source,
            time_scale,
            dashboard,
        }) => {
            source.apply(&mut config);
            if let Some(scale) = time_scale {
                config.refresh.default_scale = Granularity::parse_live(&scale)?;
            }
            let source: Arc<dyn RecordSource> = Arc::new(FileSource::from_config(&config.source));
            let published = monitor_server::snapshot_once(config, source).await?;
            let json = if dashboard {
                serde_json::to_string_pretty(&DashboardPayload::from_snapshot(&published.snapshot))?
            } else {
                serde_json::to_string_pretty(published.as_ref())?
            };
            println!("{}", json);
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, &config)?;
        }
        None => {
            serve(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let source: Arc<dyn RecordSource> = Arc::new(FileSource::from_config(&config.source));
    tracing::info!(
        "Reading records from {}, window {}h, refresh every {}s, scale {}",
        config.source.resolved_data_dir().display(),
        config.source.time_range_hours,
        config.refresh.interval_secs,
        config.refresh.default_scale,
    );
    monitor_server::serve(config, source).await
}

fn handle_config_command(action: Option<ConfigAction>, config: &AppConfig) -> Result<()> {
    match action {
        Some(ConfigAction::Show) | None => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        Some(ConfigAction::Init) => {
            let path = AppConfig::default_path();
            if path.exists() {
                println!("Config already exists at: {}", path.display());
            } else {
                config.save()?;
                println!("Created default config at: {}", path.display());
            }
        }
        Some(ConfigAction::Path) => {
            println!("{}", AppConfig::default_path().display());
        }
    }
    Ok(())
}
