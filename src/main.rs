//! Sensing Runtime CLI
//!
//! Runs a protocol on this machine with the simulated probes.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sensing_runtime::{
    config::RuntimeConfig,
    store::{CommitSink, FileSink},
    ProbeRegistry, Protocol, ProtocolConfig, ProtocolController, RuntimeContext,
    SymmetricEncryption, VERSION,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sensing-runtime")]
#[command(version = VERSION)]
#[command(about = "On-device continuous data-collection runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a protocol until Ctrl+C
    Run {
        /// Protocol document (defaults to the configured protocol path)
        #[arg(long, short)]
        protocol: Option<PathBuf>,

        /// Upload batches to the gateway configured in the data directory (requires gateway feature)
        #[arg(long)]
        gateway: bool,
    },

    /// Write a sample protocol document
    Init {
        /// Output path (defaults to the configured protocol path)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Store the document encrypted with the at-rest key
        #[arg(long)]
        encrypt: bool,

        /// Overwrite an existing document
        #[arg(long)]
        force: bool,
    },

    /// Check a protocol document against the registered probe types
    Validate {
        /// Protocol document (defaults to the configured protocol path)
        path: Option<PathBuf>,
    },

    /// Show collection status and cumulative statistics
    Status,

    /// Decrypt a committed batch file
    Decrypt {
        /// Batch file written by the file sink
        batch: PathBuf,

        /// Protocol whose key encrypted the batch (defaults to the configured protocol path)
        #[arg(long, short)]
        protocol: Option<PathBuf>,
    },

    /// Pause collection in a running instance
    Pause,

    /// Resume collection in a running instance
    Resume,

    /// Show configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RuntimeConfig::load().unwrap_or_default();
    init_tracing(&config);

    match cli.command {
        Commands::Run { protocol, gateway } => cmd_run(config, protocol, gateway),
        Commands::Init {
            output,
            encrypt,
            force,
        } => cmd_init(&config, output, encrypt, force),
        Commands::Validate { path } => cmd_validate(&config, path),
        Commands::Status => cmd_status(&config),
        Commands::Decrypt { batch, protocol } => cmd_decrypt(&config, &batch, protocol),
        Commands::Pause => cmd_set_paused(config, true),
        Commands::Resume => cmd_set_paused(config, false),
        Commands::Config => cmd_config(&config),
    }
}

fn init_tracing(config: &RuntimeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cmd_run(config: RuntimeConfig, protocol: Option<PathBuf>, gateway: bool) -> anyhow::Result<()> {
    println!("Sensing Runtime v{VERSION}");
    println!();

    let (context, main_loop) =
        RuntimeContext::for_host(&config).context("could not set up the runtime context")?;

    let path = protocol.unwrap_or_else(|| config.protocol_path.clone());
    let protocol_config = ProtocolConfig::load_any(&path, context.at_rest())
        .with_context(|| format!("could not load protocol {path:?}"))?;

    let sink = build_sink(&config, &context, gateway)?;
    println!("Protocol: {} ({})", protocol_config.name, protocol_config.id);
    println!("  Probes: {}", protocol_config.probes.len());
    println!("  Commit interval: {}ms", protocol_config.commit_interval.as_millis());
    println!("  Sink: {}", sink.name());
    if let Some(sensing) = &protocol_config.sensing {
        println!("  Sensing agent: every {}ms", sensing.action_interval.as_millis());
    }
    println!("  Device ID: {}", context.device_id());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let protocol = Protocol::build(protocol_config, &ProbeRegistry::builtin(), &context, sink)?;
    let controller = ProtocolController::new(protocol, context.clone())
        .with_health_check_interval(config.health_check_interval);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .context("could not set Ctrl+C handler")?;

    // `pause`/`resume` from another process are picked up by polling the config file.
    let mut paused = config.paused;
    if paused {
        println!("Collection is currently paused.");
        println!("Run `sensing-runtime resume` to start collecting.");
    } else {
        controller.execute_protocol()?;
    }

    let prompts = controller.prompts();
    let mut last_config_check = Instant::now();
    let mut last_health = Instant::now();

    while running.load(Ordering::SeqCst) {
        main_loop.pump(Duration::from_millis(100));

        while let Ok(prompt) = prompts.try_recv() {
            println!(
                "[{}] Prompt #{} approved by {}",
                prompt.at.format("%H:%M:%S"),
                prompt.sequence,
                prompt.agent
            );
        }

        if last_config_check.elapsed() >= Duration::from_secs(1) {
            if let Ok(current) = RuntimeConfig::load() {
                if current.paused != paused {
                    paused = current.paused;
                    if paused {
                        info!("pausing collection");
                        controller.halt_protocol()?;
                    } else {
                        info!("resuming collection");
                        controller.execute_protocol()?;
                    }
                }
            }
            last_config_check = Instant::now();
        }

        if !paused && last_health.elapsed() >= config.health_check_interval {
            let health = controller.test_health();
            if !health.is_healthy() {
                for line in health.lines() {
                    warn!("{line}");
                }
            }
            if let Err(e) = controller.report() {
                warn!("could not add protocol report: {e}");
            }
            if let Err(e) = controller.participation_report() {
                warn!("could not add participation report: {e}");
            }
            last_health = Instant::now();
        }
    }

    println!();
    println!("Stopping collection...");
    controller.halt_protocol()?;

    println!();
    for (probe_type, participation) in controller.participation() {
        println!("  {probe_type}: {:.0}% participation", participation * 100.0);
    }
    println!();
    println!("{}", context.stats().summary());
    Ok(())
}

#[cfg(feature = "gateway")]
fn build_sink(
    config: &RuntimeConfig,
    context: &RuntimeContext,
    gateway: bool,
) -> anyhow::Result<Arc<dyn CommitSink>> {
    use sensing_runtime::gateway::{GatewayConfig, GatewaySink};

    if gateway {
        let gateway_config = GatewayConfig::from_dir(&config.data_path)?;
        let sink = GatewaySink::new(gateway_config, context.device_id())?;
        match sink.test_connection() {
            Ok(true) => println!("Gateway connection: OK"),
            Ok(false) => warn!("gateway health check failed"),
            Err(e) => warn!("could not connect to gateway: {e}"),
        }
        return Ok(Arc::new(sink));
    }
    Ok(Arc::new(FileSink::new(&config.batch_path)))
}

#[cfg(not(feature = "gateway"))]
fn build_sink(
    config: &RuntimeConfig,
    _context: &RuntimeContext,
    gateway: bool,
) -> anyhow::Result<Arc<dyn CommitSink>> {
    if gateway {
        warn!("--gateway ignored (gateway feature not enabled at compile time)");
    }
    Ok(Arc::new(FileSink::new(&config.batch_path)))
}

fn cmd_init(
    config: &RuntimeConfig,
    output: Option<PathBuf>,
    encrypt: bool,
    force: bool,
) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(|| config.protocol_path.clone());
    if path.exists() && !force {
        bail!("{path:?} already exists (use --force to overwrite)");
    }

    let protocol = ProtocolConfig::sample();
    if encrypt {
        protocol.save_encrypted(&path, &SymmetricEncryption::new(&config.at_rest_key))?;
    } else {
        protocol.save(&path)?;
    }
    println!("Wrote sample protocol '{}' to {path:?}", protocol.name);
    Ok(())
}

fn cmd_validate(config: &RuntimeConfig, path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| config.protocol_path.clone());
    let protocol = load_protocol(config, &path)?;

    let registry = ProbeRegistry::builtin();
    for probe in &protocol.probes {
        registry
            .build(probe)
            .with_context(|| format!("probe '{}' is invalid", probe.probe_type))?;
    }

    println!("Protocol '{}' is valid", protocol.name);
    for probe in &protocol.probes {
        println!(
            "  {} ({})",
            probe.probe_type,
            if probe.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

fn cmd_status(config: &RuntimeConfig) -> anyhow::Result<()> {
    println!("Sensing Runtime Status");
    println!("======================");
    println!();
    println!("Configuration:");
    println!("  Protocol: {:?}", config.protocol_path);
    println!("  Batches: {:?}", config.batch_path);
    println!("  Health check interval: {}s", config.health_check_interval.as_secs());
    println!("  Paused: {}", config.paused);
    println!();

    let batches = std::fs::read_dir(&config.batch_path)
        .map(|dir| {
            dir.filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "bin"))
                .count()
        })
        .unwrap_or(0);
    println!("Committed batches on disk: {batches}");
    println!();

    let stats_path = config.stats_path();
    let stats = std::fs::read_to_string(&stats_path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok());
    match stats {
        Some(stats) => {
            println!("Cumulative Statistics:");
            for (label, key) in [
                ("Datums stored", "data_stored"),
                ("Dropped (rate limit)", "data_dropped_rate_limit"),
                ("Dropped (buffer full)", "data_dropped_overflow"),
                ("Datums committed", "data_committed"),
                ("Commits succeeded", "commits_succeeded"),
                ("Commits failed", "commits_failed"),
                ("Capture failures", "capture_failures"),
            ] {
                if let Some(value) = stats.get(key) {
                    println!("  {label}: {value}");
                }
            }
        }
        None => println!("No statistics recorded yet."),
    }
    Ok(())
}

fn cmd_decrypt(config: &RuntimeConfig, batch: &Path, protocol: Option<PathBuf>) -> anyhow::Result<()> {
    let path = protocol.unwrap_or_else(|| config.protocol_path.clone());
    let protocol = load_protocol(config, &path)?;

    let data = std::fs::read(batch).with_context(|| format!("could not read {batch:?}"))?;
    let json = SymmetricEncryption::new(&protocol.encryption_key)
        .decrypt_to_string(&data)
        .context("could not decrypt batch (wrong protocol key?)")?;

    let datums: serde_json::Value = serde_json::from_str(&json)?;
    println!("{}", serde_json::to_string_pretty(&datums)?);
    Ok(())
}

fn cmd_set_paused(mut config: RuntimeConfig, paused: bool) -> anyhow::Result<()> {
    config.paused = paused;
    config.save().context("could not save config")?;
    if paused {
        println!("Collection paused. Use 'sensing-runtime resume' to continue.");
    } else {
        println!("Collection resumed.");
    }
    Ok(())
}

fn cmd_config(config: &RuntimeConfig) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", RuntimeConfig::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn load_protocol(config: &RuntimeConfig, path: &Path) -> anyhow::Result<ProtocolConfig> {
    ProtocolConfig::load_any(path, &SymmetricEncryption::new(&config.at_rest_key))
        .with_context(|| format!("could not load protocol {path:?}"))
}
