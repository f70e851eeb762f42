//! fleettrace CLI - Debug tool for the telemetry aggregation engine
//!
//! Usage:
//!   fleettrace-cli run <inputs...> --max-gap-secs <secs> [--weighting <mode>] [--status <s>...] [--points-out <file>]
//!   fleettrace-cli generate <output.jsonl> [--devices <n>] [--records <n>]   (feature `synthetic`)
//!
//! Each input file (.jsonl, .ndjson, .json, .csv, .tsv) is one chunk. The tool
//! prints the run diagnostics and can write the weighted points and the
//! per-device stats as JSON.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use fleettrace::{
    source_for_path, DuplicatePolicy, EngineConfig, EngineError, Orchestrator, RowSource,
    PayloadFilter, RunReport, RunStatus, WeightingMode,
};

#[derive(Parser)]
#[command(name = "fleettrace-cli")]
#[command(about = "Aggregate fleet telemetry into dwell stats and heatmap points", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the map-reduce aggregation over input files
    Run {
        /// Input files, one chunk each
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// JSON engine config; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Largest gap between records that still counts as activity
        #[arg(long)]
        max_gap_secs: Option<u64>,

        /// Worker threads (0 = one per core)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Point weighting scheme
        #[arg(long, value_enum)]
        weighting: Option<Weighting>,

        /// Decimal places for zone weighting
        #[arg(long, default_value = "2")]
        zone_precision: u32,

        /// Scale weights into (0, 1]
        #[arg(long)]
        normalize: bool,

        /// Only map records whose `Status` is one of these (repeatable)
        #[arg(long)]
        status: Vec<String>,

        /// Duplicate (device, timestamp) handling
        #[arg(long, value_enum)]
        duplicates: Option<Duplicates>,

        /// Give up on workers that have not reported after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Write weighted points as JSON
        #[arg(long)]
        points_out: Option<PathBuf>,

        /// Write per-device stats as JSON
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },

    /// Write a synthetic fleet as JSON lines
    #[cfg(feature = "synthetic")]
    Generate {
        output: PathBuf,

        #[arg(long, default_value = "50")]
        devices: usize,

        #[arg(long, default_value = "200")]
        records: usize,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Weighting {
    PerRecord,
    DeviceDwell,
    DeviceVisits,
    Zone,
}

#[derive(Clone, Copy, ValueEnum)]
enum Duplicates {
    KeepFirst,
    Reject,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    match cli.command {
        Commands::Run {
            inputs,
            config,
            max_gap_secs,
            workers,
            weighting,
            zone_precision,
            normalize,
            status,
            duplicates,
            timeout_secs,
            points_out,
            stats_out,
        } => {
            let config = match build_config(
                config.as_deref(),
                max_gap_secs,
                workers,
                weighting,
                zone_precision,
                normalize,
                status,
                duplicates,
                timeout_secs,
            ) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return ExitCode::from(2);
                }
            };
            run(&inputs, config, points_out.as_deref(), stats_out.as_deref())
        }
        #[cfg(feature = "synthetic")]
        Commands::Generate {
            output,
            devices,
            records,
            seed,
        } => generate(&output, devices, records, seed),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    path: Option<&Path>,
    max_gap_secs: Option<u64>,
    workers: Option<usize>,
    weighting: Option<Weighting>,
    zone_precision: u32,
    normalize: bool,
    status: Vec<String>,
    duplicates: Option<Duplicates>,
    timeout_secs: Option<u64>,
) -> Result<EngineConfig, EngineError> {
    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(secs) = max_gap_secs {
        config.max_gap = Some(Duration::from_secs(secs));
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(weighting) = weighting {
        config.weighting.mode = match weighting {
            Weighting::PerRecord => WeightingMode::PerRecord,
            Weighting::DeviceDwell => WeightingMode::DeviceDwell,
            Weighting::DeviceVisits => WeightingMode::DeviceVisits,
            Weighting::Zone => WeightingMode::Zone {
                precision: zone_precision,
            },
        };
    }
    if normalize {
        config.weighting.normalize = true;
    }
    if !status.is_empty() {
        config.weighting.include = Some(PayloadFilter::new("Status", status));
    }
    if let Some(duplicates) = duplicates {
        config.duplicate_policy = match duplicates {
            Duplicates::KeepFirst => DuplicatePolicy::KeepFirst,
            Duplicates::Reject => DuplicatePolicy::Reject,
        };
    }
    if let Some(secs) = timeout_secs {
        config.run_timeout = Some(Duration::from_secs(secs));
    }

    config.validate()?;
    Ok(config)
}

/// Run the engine and print a summary
fn run(
    inputs: &[PathBuf],
    config: EngineConfig,
    points_out: Option<&Path>,
    stats_out: Option<&Path>,
) -> ExitCode {
    let mut sources: Vec<Arc<dyn RowSource>> = Vec::with_capacity(inputs.len());
    for path in inputs {
        match source_for_path(path) {
            Ok(source) => sources.push(Arc::from(source)),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::from(2);
            }
        }
    }

    let orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    let report = match orchestrator.run(sources) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Run failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    print_summary(&report);

    if let Some(path) = points_out {
        if let Err(e) = write_json(path, &report.points) {
            eprintln!("  [ERR] Failed to write {}: {}", path.display(), e);
        } else {
            println!("  Points written to {}", path.display());
        }
    }
    if let Some(path) = stats_out {
        if let Err(e) = write_json(path, &report.device_stats) {
            eprintln!("  [ERR] Failed to write {}: {}", path.display(), e);
        } else {
            println!("  Stats written to {}", path.display());
        }
    }

    match report.status {
        RunStatus::Failure => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

fn print_summary(report: &RunReport) {
    let d = &report.diagnostics;

    println!("\n{}", "=".repeat(60));
    println!("RUN SUMMARY ({:?})", report.status);
    println!("{}", "=".repeat(60));
    println!(
        "  Sources: {} planned, {} completed, {} chunks mapped",
        d.sources_planned, d.sources_completed, d.chunks_mapped
    );
    println!(
        "  Rows:    {} seen, {} accepted, {} rejected, {} duplicates",
        d.rows_seen, d.record_count, d.rejected_count, d.duplicate_count
    );
    for (kind, count) in &d.rejections_by_kind {
        println!("    {:?}: {}", kind, count);
    }
    for failure in &d.failed_sources {
        println!("  [ERR] {} - {}", failure.label, failure.reason);
    }

    println!("\n  Devices: {}", report.device_stats.len());
    for stats in report.device_stats.iter().take(10) {
        println!(
            "    {} - {} records, {} visits, dwell {:.1}h, idle {:.1}h",
            stats.device_id,
            stats.record_count,
            stats.visit_count,
            stats.total_dwell_time.as_secs_f64() / 3600.0,
            stats.total_idle_time.as_secs_f64() / 3600.0
        );
    }
    if report.device_stats.len() > 10 {
        println!("    ... {} more", report.device_stats.len() - 10);
    }
    println!("  Points:  {}", report.points.len());
    println!("  Elapsed: {:?}", d.elapsed);
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), EngineError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[cfg(feature = "synthetic")]
fn generate(output: &Path, devices: usize, records: usize, seed: u64) -> ExitCode {
    use fleettrace::synthetic::SyntheticFleet;

    let fleet = SyntheticFleet {
        device_count: devices,
        records_per_device: records,
        seed,
        ..SyntheticFleet::regina_depot()
    };
    let dataset = fleet.generate();

    let result = (|| -> Result<(), EngineError> {
        let mut writer = BufWriter::new(File::create(output)?);
        for row in &dataset.rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            println!(
                "Wrote {} rows ({} defective) to {}",
                dataset.rows.len(),
                dataset.invalid_rows,
                output.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
