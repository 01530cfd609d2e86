mod face;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use dotenvy::dotenv;
use gridpilot::config::FileConfig;
use gridpilot::{AdbDevice, Agent, AnthropicClient, RunSummary, TaskLogger};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const INTERRUPTED: u8 = 130;

/// Drive an Android phone toward a goal with a grid-grounded vision model.
#[derive(Parser, Debug)]
#[command(name = "agent", version)]
struct Args {
    /// What the agent should accomplish, e.g. "open Settings and enable Wi-Fi"
    #[arg(required = true, num_args = 1..)]
    task: Vec<String>,

    /// YAML config file (defaults to ./config.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_steps: Option<usize>,

    /// ADB serial of the target device
    #[arg(short, long)]
    serial: Option<String>,

    /// Local yadb helper to push when the device lacks it
    #[arg(long)]
    yadb: Option<PathBuf>,

    /// Seconds to wait after each action
    #[arg(long)]
    delay: Option<f64>,

    /// Do not save annotated or marked screenshots
    #[arg(long)]
    no_screenshots: bool,

    /// Where logs and images go (defaults to ./artifacts/logs/task_<timestamp>)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, file: &mut FileConfig) {
        if let Some(max_steps) = self.max_steps {
            file.agent.max_steps = max_steps;
        }
        if let Some(delay) = self.delay {
            file.agent.delay_after_action = delay;
        }
        if let Some(serial) = &self.serial {
            file.device.serial = Some(serial.clone());
        }
        if let Some(yadb) = &self.yadb {
            file.device.yadb_path = Some(yadb.clone());
        }
        if self.no_screenshots {
            file.agent.save_screenshots = false;
        }
        if self.verbose {
            file.agent.verbose = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();

    match run(args).await {
        Ok(summary) if summary.success => ExitCode::SUCCESS,
        Ok(summary) if summary.is_interrupted() => ExitCode::from(INTERRUPTED),
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("[Agent] Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    // 1. Configuration
    let mut file = FileConfig::load(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut file);
    init_tracing(file.agent.verbose);

    // 2. Device
    eprintln!("[Agent] Connecting to device...");
    let mut device = AdbDevice::new(file.device.serial.clone());
    if let Some(path) = &file.device.yadb_path {
        device = device.with_yadb_source(path);
    }
    let info = device.connect().await.context("Failed to connect to device")?;
    let config = file
        .resolve(info.width, info.height)
        .context("Invalid configuration")?;

    // 3. Model client and logger
    let client = AnthropicClient::from_env(config.model.clone(), config.retry, &config.grid)
        .context("Failed to create model client")?;
    let log_dir = args.log_dir.clone().unwrap_or_else(default_log_dir);
    let logger = TaskLogger::new(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let task = args.task.join(" ");
    face::print_banner(&task, &info, &config, &logger);

    // 4. Ctrl-C stops the run between steps
    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Agent] Interrupt received, stopping after the current operation...");
            watcher.cancel();
        }
    });

    let mut agent = Agent::new(&config, device, client, logger);
    let summary = agent.run(&task, &cancel).await;
    face::print_summary(&summary, agent.sink());
    Ok(summary)
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// `./artifacts/logs/task_<timestamp>`, or under the user data dir when the
/// working directory is unavailable.
fn default_log_dir() -> PathBuf {
    let stamp = format!("task_{}", Local::now().format("%Y%m%d_%H%M%S"));
    std::env::current_dir()
        .ok()
        .or_else(|| dirs::data_local_dir().map(|dir| dir.join("gridpilot")))
        .unwrap_or_default()
        .join("artifacts")
        .join("logs")
        .join(stamp)
}
