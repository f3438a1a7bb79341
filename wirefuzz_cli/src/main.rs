mod net;

use clap::{Parser, Subcommand};
use net::NetFactory;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wirefuzz_core::codec::BehaviorCounters;
use wirefuzz_core::config::TransportKind;
use wirefuzz_core::{
    Campaign, CommandResolver, MessageInstance, WirefuzzConfig, compile_file, generate_seeds, preview,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Schema-driven network protocol fuzzer", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show how a message would be laid out on the wire.
    Preview {
        /// Protocol description (.toml or .json).
        protocol: PathBuf,
        /// Message type to set on the command field before encoding.
        #[arg(short, long)]
        message_type: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the seed messages a campaign would start from.
    Seeds { protocol: PathBuf },
    /// Fuzz a live target.
    Run {
        protocol: PathBuf,
        #[arg(short, long, value_parser)]
        config_file: Option<PathBuf>,
        /// `host:port`, overrides `[target] address`.
        #[arg(short, long)]
        target: Option<String>,
        #[arg(short, long)]
        iterations: Option<u64>,
        #[arg(short, long)]
        sessions: Option<usize>,
        /// Write the full campaign report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .init();

    match cli.command {
        Command::Preview {
            protocol,
            message_type,
            json,
        } => preview_message(&protocol, message_type.as_deref(), json),
        Command::Seeds { protocol } => list_seeds(&protocol),
        Command::Run {
            protocol,
            config_file,
            target,
            iterations,
            sessions,
            report,
        } => {
            let mut config = load_config(config_file)?;
            if let Some(target) = target {
                config.target.address = Some(target);
            }
            if let Some(iterations) = iterations {
                config.fuzzer.max_iterations = iterations;
            }
            if let Some(sessions) = sessions {
                config.fuzzer.sessions = sessions;
            }
            config.validate()?;
            run_campaign(&protocol, config, report.as_deref()).await
        }
    }
}

fn load_config(config_file: Option<PathBuf>) -> Result<WirefuzzConfig, anyhow::Error> {
    match config_file {
        Some(path) => {
            info!(path = ?path, "loading configuration");
            WirefuzzConfig::load_from_file(&path)
        }
        None => {
            let default_path = PathBuf::from("wirefuzz.toml");
            if default_path.exists() {
                info!(path = ?default_path, "no config file specified, loading default");
                WirefuzzConfig::load_from_file(&default_path)
            } else {
                info!("no config file specified and 'wirefuzz.toml' not found, using built-in defaults");
                Ok(WirefuzzConfig::default())
            }
        }
    }
}

fn preview_message(protocol: &Path, message_type: Option<&str>, json: bool) -> Result<(), anyhow::Error> {
    let descriptor = compile_file(protocol)?;
    let mut message = MessageInstance::with_defaults(Arc::clone(&descriptor));
    if let Some(message_type) = message_type {
        CommandResolver::new(&descriptor).apply(&mut message, message_type)?;
    }
    let entries = preview(&message, &BehaviorCounters::new())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    println!("{} v{}", descriptor.name(), descriptor.version());
    for entry in &entries {
        let mut flags = Vec::new();
        if entry.computed {
            flags.push(format!("size of {}", entry.references.join(", ")));
        }
        if !entry.mutable {
            flags.push("fixed".to_string());
        }
        println!(
            "  {:<16} @{:<5} {:>4}b  {:<24} {:<20} {}",
            entry.name,
            entry.bit_offset,
            entry.bit_len,
            entry.hex,
            entry.value,
            flags.join("; ")
        );
    }
    Ok(())
}

fn list_seeds(protocol: &Path) -> Result<(), anyhow::Error> {
    let descriptor = compile_file(protocol)?;
    let seeds = generate_seeds(&descriptor);
    for seed in &seeds {
        match &seed.decode_error {
            Some(err) => println!("{:<28} {}  (does not decode: {err})", seed.origin.to_string(), hex::encode(&seed.bytes)),
            None => println!("{:<28} {}", seed.origin.to_string(), hex::encode(&seed.bytes)),
        }
    }
    info!(count = seeds.len(), flagged = seeds.iter().filter(|s| s.is_flagged()).count(), "seeds generated");
    Ok(())
}

async fn run_campaign(protocol: &Path, config: WirefuzzConfig, report_path: Option<&Path>) -> Result<(), anyhow::Error> {
    let descriptor = compile_file(protocol)?;
    let address = config
        .target
        .address
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No target address: pass --target or set [target] address"))?;
    let kind = config
        .target
        .transport
        .or_else(|| descriptor.transport_hint().map(TransportKind::from))
        .unwrap_or(TransportKind::Tcp);
    info!(protocol = descriptor.name(), address = %address, transport = ?kind, "target selected");

    let seed_paths = config.corpus.initial_seed_paths.clone().unwrap_or_default();
    let factory = Arc::new(NetFactory::new(address, kind));
    let mut campaign = Campaign::new(Arc::clone(&descriptor), config, factory);
    if !seed_paths.is_empty() {
        let loaded = campaign.corpus_mut().load_seed_files(&descriptor, &seed_paths)?;
        info!(loaded, "seed files added to the corpus");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current transitions");
            on_signal.cancel();
        }
    });

    let start_time = Instant::now();
    let report = campaign.run(cancel).await;
    let elapsed_total = start_time.elapsed();

    println!("\nCampaign finished in {elapsed_total:.2?}.");
    for session in &report.sessions {
        println!(
            "  session {:>3}: {:?} in state '{}' after {} transitions, {} findings",
            session.session_id,
            session.end,
            session.final_state,
            session.iterations,
            session.findings.len()
        );
    }
    for (kind, count) in report.findings_by_kind() {
        println!("  {kind:<20} {count}");
    }
    println!(
        "Total Findings: {}, Bug Signals: {}, Failed Sessions: {}",
        report.findings().count(),
        report.bug_signals(),
        report.failed_sessions()
    );

    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", path, e))?;
        info!(path = ?path, "report written");
    }
    Ok(())
}
