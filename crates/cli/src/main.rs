use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use fhir::ClinicalDocument;
use sentinel_core::{
    chaos::inject,
    config::core_config_from_lookup,
    execute_run, map_message, ChaosRequest, DefectKind, DefectStatus, Pipeline, SharedVolume,
};
use sentinel_types::nhs_number;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Legacy feed transform-and-audit CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check an NHS number against its modulus-11 check digit
    Checksum {
        /// Ten digit NHS number
        value: String,
    },
    /// Parse a legacy message and print its segment tree as JSON
    Parse {
        /// Path to a `.hl7` file
        file: PathBuf,
    },
    /// Transform a legacy message into a resource bundle
    Transform {
        /// Path to a `.hl7` file
        file: PathBuf,
        /// Write the bundle here instead of standard output
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Transform a message, then corrupt every document with the seeded injector
    Chaos {
        /// Path to a `.hl7` file
        file: PathBuf,
        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Defects requested per document
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Restrict to one defect kind (e.g. `unit-mismatch`)
        #[arg(long, value_parser = parse_kind)]
        kind: Option<DefectKind>,
    },
    /// Run one batch against the shared volume
    Run {
        /// Shared volume root (overrides SENTINEL_DATA_DIR)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// List the defect ledger
    Ledger {
        /// Shared volume root (overrides SENTINEL_DATA_DIR)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Only show Active defects
        #[arg(long)]
        active: bool,
    },
}

fn parse_kind(value: &str) -> Result<DefectKind, String> {
    DefectKind::ALL
        .into_iter()
        .find(|kind| kind.as_str() == value)
        .ok_or_else(|| {
            let known: Vec<&str> = DefectKind::ALL.iter().map(|k| k.as_str()).collect();
            format!("unknown defect kind {value:?}; expected one of {}", known.join(", "))
        })
}

fn read_text(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

/// Volume and pipeline resolved from the environment, with an optional data directory override.
fn resolve(data_dir: Option<PathBuf>) -> anyhow::Result<(Pipeline, SharedVolume)> {
    let data_dir = data_dir.map(|p| p.to_string_lossy().into_owned());
    let config = core_config_from_lookup(|name| {
        if name == "SENTINEL_DATA_DIR" && data_dir.is_some() {
            return data_dir.clone();
        }
        std::env::var(name).ok()
    })?;
    Ok((
        Pipeline::from_config(&config)?,
        SharedVolume::from_config(&config),
    ))
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sentinel_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Checksum { value }) => {
            let value = value.trim();
            if nhs_number::validate_nhs_number(value) {
                println!("{value}: valid");
            } else {
                match value.get(..9).map(nhs_number::check_digit) {
                    Some(Ok(expected)) => {
                        println!("{value}: invalid (expected check digit {expected})")
                    }
                    Some(Err(e)) => println!("{value}: invalid ({e})"),
                    None => println!("{value}: invalid (too short)"),
                }
                std::process::exit(1);
            }
        }
        Some(Commands::Parse { file }) => {
            let message = hl7::parse(&read_text(&file)?)?;
            let (kind, trigger) = message.message_type();
            eprintln!(
                "{} {kind}^{trigger}, {} segments",
                message.control_id().unwrap_or("<no control id>"),
                message.segments().len()
            );
            println!("{}", serde_json::to_string_pretty(message.segments())?);
        }
        Some(Commands::Transform { file, out }) => {
            let message = hl7::parse(&read_text(&file)?)?;
            let bundle = map_message(&message)?;
            let json = bundle.render()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote {} documents to {}", bundle.entry.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Some(Commands::Chaos {
            file,
            seed,
            count,
            kind,
        }) => {
            let message = hl7::parse(&read_text(&file)?)?;
            let mut bundle = map_message(&message)?;
            let mut request = ChaosRequest::new(seed, count, Utc::now());
            if let Some(kind) = kind {
                request = request.only(kind);
            }

            let mut manifests = Vec::new();
            let infected: Vec<ClinicalDocument> = bundle
                .entry
                .iter()
                .map(|document| {
                    let (document, manifest) = inject(document, &request);
                    if !manifest.injected.is_empty() {
                        manifests.push(manifest);
                    }
                    document
                })
                .collect();
            bundle.entry = infected;

            println!("{}", bundle.render()?);
            eprintln!("{}", serde_json::to_string_pretty(&manifests)?);
        }
        Some(Commands::Run { data_dir }) => {
            let (pipeline, volume) = resolve(data_dir)?;
            let mut ledger = volume.load_ledger()?;
            let report = execute_run(&pipeline, &volume, &mut ledger, Utc::now())?;
            let s = &report.summary;
            println!(
                "Run {}: {} processed, {} accepted, {} rejected, {} failed ingest ({}% accepted)",
                s.run,
                s.processed,
                s.accepted,
                s.rejected,
                s.failed_ingest,
                s.acceptance_percent()
            );
            println!(
                "Defects: {} active, {} new, {} resolved, {} regressed",
                s.active_defects, s.new_this_run, s.resolved_this_run, s.regressed_this_run
            );
        }
        Some(Commands::Ledger { data_dir, active }) => {
            let (_, volume) = resolve(data_dir)?;
            let ledger = volume.load_ledger()?;
            let defects: Vec<_> = ledger
                .iter()
                .filter(|d| !active || d.status == DefectStatus::Active)
                .collect();
            if defects.is_empty() {
                println!("No defects recorded (last run {}).", ledger.last_run());
            }
            for d in defects {
                println!(
                    "{:?}\t{:?}\t{}\t{}\truns {}-{}\t{}",
                    d.status,
                    d.severity,
                    d.matching_key,
                    d.rule_id,
                    d.first_seen_run,
                    d.last_seen_run,
                    d.detail
                );
            }
        }
        None => {
            println!("Use 'sentinel --help' for commands");
        }
    }

    Ok(())
}
