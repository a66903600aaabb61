//! CLI entry point for the instrument frontends.
//!
//! Usage:
//! ```bash
//! daq_frontends run --config config/frontend.toml
//! daq_frontends iv-sweep --output iv.txt
//! daq_frontends iv-table iv.txt
//! daq_frontends analyze data/events.csv
//! daq_frontends list-ports
//! daq_frontends config
//! ```
//!
//! `run` serves the configured equipment until Ctrl-C or `quit` on the
//! operator console. Without a real host framework attached, the frontend
//! talks to the in-process host, whose configuration tree can be inspected
//! and edited from the console.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_frontends::config::{FrontendConfig, DEFAULT_CONFIG_PATH};
use daq_frontends::frontend::{run_console, Frontend};
use daq_frontends::host::{storage, HostBus, LocalHost};
use daq_frontends::ivcurve::{self, IvSweepConfig};
use daq_frontends::{logging, transport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser)]
#[command(name = "daq_frontends")]
#[command(about = "Instrument-control frontends for a MIDAS-style DAQ host", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured equipment and serve it
    Run {
        /// Do not read operator commands from stdin
        #[arg(long)]
        no_console: bool,
    },

    /// Run an I-V sweep through the configuration tree
    IvSweep {
        /// Write the measured points to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print an I-V table
    IvTable {
        /// Table with `voltage current` lines
        path: PathBuf,
    },

    /// Summarize the events recorded by the CSV sink
    Analyze {
        /// Event file (defaults to `events.csv` in the configured data directory)
        path: Option<PathBuf>,

        /// Also print the contents of this bank
        #[arg(long)]
        bank: Option<String>,
    },

    /// List serial ports
    ListPorts,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FrontendConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).context("initializing logging")?;

    match cli.command {
        Commands::Run { no_console } => run(&config, !no_console).await,
        Commands::IvSweep { output } => iv_sweep(&config, output).await,
        Commands::IvTable { path } => iv_table(path),
        Commands::Analyze { path, bank } => {
            let path = path.unwrap_or_else(|| config.host.data_dir.join("events.csv"));
            analyze(path, bank.as_deref())
        }
        Commands::ListPorts => list_ports(),
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("serializing configuration")?;
            println!("{}", text);
            Ok(())
        }
    }
}

async fn run(config: &FrontendConfig, with_console: bool) -> Result<()> {
    let (host, mut changes) = LocalHost::new(&config.host)?;
    let host = Arc::new(host);

    let mut frontend = Frontend::from_config(config, host.clone())?;
    if frontend.equipment_names().is_empty() {
        bail!("no equipment enabled in the configuration");
    }
    if frontend.connect_all().await == 0 {
        bail!("no equipment could be connected");
    }
    info!(frontend = frontend.name(), equipment = ?frontend.equipment_names(), "serving");

    let console = with_console.then(|| {
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            run_console(host.as_ref(), stdin, tokio::io::stdout()).await
        })
    });

    let shutdown = async move {
        match console {
            Some(console) => tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = console => {}
            },
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };

    frontend.run(&mut changes, shutdown).await?;
    Ok(())
}

async fn iv_sweep(config: &FrontendConfig, output: Option<PathBuf>) -> Result<()> {
    let sweep: IvSweepConfig = config.iv_sweep.clone().unwrap_or_default();
    sweep.validate()?;

    let (host, mut changes) = LocalHost::new(&config.host)?;
    let host = Arc::new(host);
    let mut frontend = Frontend::from_config(config, host.clone())?;
    frontend.connect_all().await;

    // The frontend keeps serving while the sweep drives the tree.
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let sweep_host: &dyn HostBus = host.as_ref();
    let sweep_run = async {
        let result = ivcurve::run_sweep(sweep_host, &sweep).await;
        let _ = done_tx.send(());
        result
    };
    let shutdown = async {
        let _ = done_rx.await;
    };
    let (served, points) = tokio::join!(frontend.run(&mut changes, shutdown), sweep_run);
    served?;
    let points = points?;

    for point in &points {
        println!("{:.2} {:.4}", point.voltage, point.current);
    }
    if let Some(path) = output {
        ivcurve::write_iv_table(&path, &points)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), points = points.len(), "I-V table written");
    }
    Ok(())
}

fn iv_table(path: PathBuf) -> Result<()> {
    let points = ivcurve::read_iv_table(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    for point in points {
        println!("{:.2} {:.2}", point.voltage, point.current);
    }
    Ok(())
}

fn analyze(path: PathBuf, bank: Option<&str>) -> Result<()> {
    let events =
        storage::read_events(&path).with_context(|| format!("reading {}", path.display()))?;
    for recorded in &events {
        println!("{}", recorded);
        if let Some(data) = bank.and_then(|name| recorded.event.bank(name)) {
            let values: Vec<String> = data.data().iter().map(f64::to_string).collect();
            println!("  {}: {}", data.name(), values.join(" "));
        }
    }
    info!(path = %path.display(), events = events.len(), "analysis done");
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = transport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}
