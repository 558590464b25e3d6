use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meterlog::api::{self, AppState};
use meterlog::clock::{self, Clock, SystemClock};
use meterlog::collector::{self, Collector, CollectorSettings, FetchSpan};
use meterlog::config::{self, Config};
use meterlog::history::{LogRecord, LogStatus};
use meterlog::modbus::{Endpoint, ModbusClient};
use meterlog::output;
use meterlog::store::MeterStore;

/// Energy meter historical-log collector
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Config file (defaults to $METERLOG_CONFIG or meterlog.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one collection cycle for all enabled meters, or one meter
    Collect {
        #[arg(long)]
        meter: Option<u32>,
    },
    /// Read records from a meter that is not in the inventory
    Fetch(FetchArgs),
    /// Check a meter clock and correct it when drift is too large
    SyncTime {
        #[arg(long)]
        meter: u32,
        #[arg(long)]
        allowed_drift: Option<u32>,
    },
    /// Print the log status block of a meter
    Status {
        #[arg(long)]
        meter: u32,
    },
    /// Run the HTTP API and scheduled collection
    Serve,
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FetchMode {
    /// Records covering the last --minutes
    Last,
    /// Every record in the log
    All,
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 502)]
    port: u16,
    #[arg(long, default_value_t = 1)]
    unit: u8,
    /// Serial number used in the CSV rows and file name
    #[arg(long, default_value = "meter")]
    serial: String,
    #[arg(long, value_enum, default_value_t = FetchMode::Last)]
    mode: FetchMode,
    #[arg(long, default_value_t = 60)]
    minutes: u32,
    /// CSV file to write (defaults to the configured output folder)
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    sync_time: bool,
    #[arg(long, default_value_t = 60)]
    allowed_drift: u32,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meterlog=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config_path = config::config_path(cli.config.as_deref());
    let config = config::load_config(&config_path)?;

    match cli.command {
        Command::Collect { meter } => run_collect(&config, meter).await,
        Command::Fetch(args) => run_fetch(&config, args).await,
        Command::SyncTime {
            meter,
            allowed_drift,
        } => {
            let collector = build_collector(&config)?;
            let allowed = allowed_drift.unwrap_or(config.collector.allowed_drift_secs);
            let outcome = collector.sync_meter_time(meter, allowed).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Status { meter } => {
            let collector = build_collector(&config)?;
            let status = collector.meter_status(meter).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Serve => serve(config).await,
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn build_collector(config: &Config) -> Result<Collector> {
    let store = MeterStore::open(&config.collector.inventory_path)?;
    Ok(Collector::new(
        Arc::new(RwLock::new(store)),
        CollectorSettings::from_config(config),
    ))
}

async fn run_collect(config: &Config, meter: Option<u32>) -> Result<()> {
    let collector = build_collector(config)?;

    if let Some(id) = meter {
        let report = collector.collect_meter(id).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let outcomes = collector.collect_all().await;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    if failed > 0 {
        bail!("{} of {} meters failed", failed, outcomes.len());
    }
    Ok(())
}

async fn run_fetch(config: &Config, args: FetchArgs) -> Result<()> {
    let settings = CollectorSettings::from_config(config);
    let endpoint = Endpoint {
        host: args.host.clone(),
        port: args.port,
        unit_id: args.unit,
        request_timeout: settings.request_timeout,
    };
    let span = match args.mode {
        FetchMode::Last => FetchSpan::Last {
            minutes: args.minutes,
        },
        FetchMode::All => FetchSpan::All,
    };

    let mut client = ModbusClient::connect(&args.serial, &endpoint).await?;
    let result = fetch_from(&mut client, &args, span, &settings).await;
    client.close().await;

    let (status, records) = result?;
    info!(
        "Log status: used={} max={} record_size={}",
        status.used_records, status.max_records, status.record_size_bytes
    );
    if records.is_empty() {
        warn!("No records retrieved");
        return Ok(());
    }

    let path = args.output.unwrap_or_else(|| {
        output::csv_path(&settings.output_dir, &args.serial, SystemClock.now())
    });
    let path = output::write_records(&path, &args.serial, &records, settings.csv_delimiter)?;
    println!("{}", path.display());
    Ok(())
}

async fn fetch_from(
    client: &mut ModbusClient,
    args: &FetchArgs,
    span: FetchSpan,
    settings: &CollectorSettings,
) -> Result<(LogStatus, Vec<LogRecord>)> {
    if args.sync_time {
        clock::check_and_sync(client, &SystemClock, args.allowed_drift).await?;
    }
    collector::fetch_once(client, span, settings).await
}

async fn serve(config: Config) -> Result<()> {
    let metrics = if config.server.metrics_enabled {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?,
        )
    } else {
        None
    };

    let collector = Arc::new(build_collector(&config)?);

    if config.collector.interval_secs > 0 {
        let period = Duration::from_secs(config.collector.interval_secs);
        tokio::spawn(collector.clone().run_schedule(period));
    } else {
        info!("Scheduled collection disabled");
    }

    let app = api::create_router(AppState { collector, metrics });
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}
