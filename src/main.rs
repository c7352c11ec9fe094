//! Fabricbench console
//!
//! Command-line front end for the test backend: inspect configurations, check
//! hardware, and drive a full bandwidth test run.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fabricbench::api;
use fabricbench::consistency::{FrequencyClass, PrecheckSummary};
use fabricbench::models::TestConfig;
use fabricbench::report::{BandwidthRecord, Report};
use fabricbench::{ConsoleConfig, HttpBackend, Stage, TestBackend, WorkflowEngine, WorkflowState};

#[derive(Parser)]
#[command(name = "fabricbench")]
#[command(about = "Run RDMA bandwidth tests across a fleet and report the results")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the console configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend URL, overrides the configuration file
    #[arg(short, long, global = true)]
    backend: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List test configurations known to the backend
    Configs,

    /// Print a test configuration
    Show {
        name: String,
    },

    /// Validate a test configuration
    Validate {
        name: String,
    },

    /// Check HCA health and consistency across the fleet
    Precheck {
        name: String,
    },

    /// Run the full test workflow (Ctrl-C aborts)
    Run {
        name: String,
    },

    /// Start the local progress API
    Serve,

    /// Generate a default configuration file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Init { output } = &cli.command {
        let config = ConsoleConfig::default();
        let output_path = output
            .clone()
            .or_else(ConsoleConfig::default_path)
            .unwrap_or_else(|| PathBuf::from("fabricbench.toml"));

        config.save_to_file(&output_path)?;
        println!("Configuration file created at: {}", output_path.display());
        println!("\nEdit this file to point at your backend, then run:");
        println!("  fabricbench --config {} configs", output_path.display());
        return Ok(());
    }

    let mut config = ConsoleConfig::resolve(cli.config.as_deref())?;
    if let Some(url) = cli.backend {
        config.backend.base_url = url;
    }
    config.validate()?;

    let backend: Arc<dyn TestBackend> = Arc::new(HttpBackend::new(&config.backend)?);
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Configs => {
            let configs = backend.list_configs(&cancel).await?;
            println!("{:<32} {:<8} {}", "NAME", "DEFAULT", "DELETABLE");
            for entry in configs {
                println!("{:<32} {:<8} {}", entry.name, entry.is_default, entry.is_deletable);
            }
        }

        Commands::Show { name } => {
            let test_config = backend.get_config(&name, &cancel).await?;
            print_topology(&test_config);
            println!();
            println!("{}", serde_json::to_string_pretty(&test_config)?);
        }

        Commands::Validate { name } => {
            match backend.validate_config(&name, &cancel).await {
                Ok(_) => println!("{} is valid", name),
                Err(fabricbench::BackendError::ValidationFailure { message, errors }) => {
                    println!("{}: {}", name, message);
                    for e in &errors {
                        println!("  - {}", e);
                    }
                    anyhow::bail!("{} has {} validation error(s)", name, errors.len());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Precheck { name } => {
            let engine = WorkflowEngine::new(backend, config.probe.clone());
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling precheck...");
                    interrupt.cancel();
                }
            });
            let summary = engine.precheck(&name, &cancel).await?;
            print_precheck(&summary);
        }

        Commands::Run { name } => {
            let engine = Arc::new(WorkflowEngine::new(backend, config.probe.clone()));
            info!(
                "Probe stage waits at most {}s ({} x {}ms)",
                config.probe.max_wait().as_secs(),
                config.probe.max_attempts,
                config.probe.interval_ms
            );

            let printer = tokio::spawn(print_progress(engine.subscribe()));

            let run = engine.run(&name);
            tokio::pin!(run);
            let state = loop {
                tokio::select! {
                    result = &mut run => break result?,
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted, aborting workflow...");
                        engine.abort();
                    }
                }
            };
            printer.abort();

            print_final(&state);
            if state.stage != Stage::Completed {
                anyhow::bail!("workflow ended in {}", state.stage);
            }
        }

        Commands::Serve => {
            let engine = Arc::new(WorkflowEngine::new(backend, config.probe.clone()));
            api::start_api_server(engine, config.api.port).await?;
        }

        Commands::Init { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Print one line per stage transition or message change
async fn print_progress(mut rx: tokio::sync::watch::Receiver<WorkflowState>) {
    let mut last = String::new();
    while rx.changed().await.is_ok() {
        let line = {
            let state = rx.borrow_and_update();
            match state.stage_status.get(&state.stage) {
                Some(report) => format!("[{}] {:?}: {}", state.stage, report.status, report.message),
                None => format!("[{}]", state.stage),
            }
        };
        if line != last {
            println!("{}", line);
            last = line;
        }
    }
}

fn print_topology(config: &TestConfig) {
    println!("Stream type: {}", config.stream_type());
    if let Some(speed) = config.speed() {
        println!("Link speed:  {} Gbps", speed);
    }
    println!("Servers:     {}", config.server_hosts().join(", "));
    println!("Clients:     {}", config.client_hosts().join(", "));
}

fn class_marker(class: FrequencyClass) -> &'static str {
    match class {
        FrequencyClass::Dominant => "",
        FrequencyClass::Neutral => " ~",
        FrequencyClass::Outlier => " !",
    }
}

fn print_precheck(summary: &PrecheckSummary) {
    println!("{:<20} {:<14} {:<10} {:<8} {:<14} {:<14} {:<16} {}",
        "HOST", "HCA", "PHYS", "STATE", "SPEED", "FW", "BOARD", "HEALTH");
    for (record, verdict) in summary.records.iter().zip(&summary.verdicts) {
        let health = match (&record.error, record.is_healthy) {
            (Some(_), _) => "ERROR",
            (None, true) => "HEALTHY",
            (None, false) => "UNHEALTHY",
        };
        println!("{:<20} {:<14} {:<10} {:<8} {:<14} {:<14} {:<16} {}",
            record.hostname,
            record.device_id,
            record.physical_state,
            record.logical_state,
            format!("{}{}", record.speed, class_marker(verdict.speed)),
            format!("{}{}", record.firmware_version, class_marker(verdict.firmware)),
            format!("{}{}", record.board_id, class_marker(verdict.board_id)),
            health,
        );
        if let Some(err) = &record.error {
            println!("    {}", err);
        }
    }
    println!();
    println!("Devices: {} total, {} healthy, {} unhealthy, {} error",
        summary.total_devices, summary.healthy_count, summary.unhealthy_count, summary.error_count);
    if summary.check_passed {
        println!("Precheck PASSED");
    } else {
        println!("Precheck FAILED: {}", summary.findings().join("; "));
    }
}

fn print_records(title: &str, records: &[BandwidthRecord]) {
    if records.is_empty() {
        return;
    }
    println!("{}:", title);
    println!("  {:<20} {:<14} {:>10} {:>12} {:>10} {:>8}  {}",
        "HOST", "HCA", "ACTUAL", "THEORETICAL", "DELTA", "DELTA%", "STATUS");
    for r in records {
        println!("  {:<20} {:<14} {:>10.2} {:>12.2} {:>10.2} {:>7.1}%  {:?}",
            r.hostname(), r.device(), r.actual_bandwidth(), r.theoretical_bandwidth(),
            r.delta(), r.delta_percent(), r.status());
    }
}

fn print_final(state: &WorkflowState) {
    println!();
    println!("Workflow {}", state.stage);
    for stage in Stage::SEQUENCE {
        if let Some(report) = state.stage_status.get(&stage) {
            println!("  {:<10} {:<8} {}", stage.label(), format!("{:?}", report.status), report.message);
        }
    }
    if let Some(err) = &state.last_error {
        println!("Error: {}", err);
    }

    match &state.report {
        Some(Report::Traditional(summary)) => {
            println!();
            println!("Theoretical bandwidth per client: {:.2} Gbps ({:.2} total / {} clients)",
                summary.theoretical_bandwidth_per_client,
                summary.total_server_bandwidth,
                summary.client_count);
            print_records("Client TX", &summary.client_records);
            print_records("Server RX", &summary.server_records);
        }
        Some(Report::PeerToPeer(summary)) => {
            println!();
            println!("  {:<20} {:<14} {:>10} {:>6}", "HOST", "HCA", "AVG", "CONNS");
            for pair in &summary.pairs {
                println!("  {:<20} {:<14} {:>10.2} {:>6}",
                    pair.hostname, pair.device, pair.average_speed, pair.connection_count);
            }
            println!("{} pair(s), average {:.2} Gbps",
                summary.total_pairs, summary.average_speed_across_pairs);
        }
        None => {}
    }
}
