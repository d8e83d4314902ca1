use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use race_figures::{
    compute_figures, EmptyDistancePolicy, Params, Race, RaceFigures, ResultTimeOrCode,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Race split figures CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute pace/speed/deficit figures for one or more race JSON files
    Figures(FiguresArgs),
    /// Report distances, grid step and per-distance aggregates for race JSON files
    Grid(GridArgs),
}

#[derive(Parser, Debug)]
struct FiguresArgs {
    /// Race JSON files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "figures.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = FormatOpt::Csv)]
    format: FormatOpt,

    /// Optional params JSON (flags below take precedence)
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Emit code-only figures at distances without any valid split instead of failing
    #[arg(long, action = ArgAction::SetTrue)]
    skip_empty_distances: bool,

    /// Fail races whose grid step cannot be resolved instead of emitting nothing
    #[arg(long, action = ArgAction::SetTrue)]
    strict_grid: bool,

    /// Treat splits never seen by the outlier classifier as unusable
    #[arg(long, action = ArgAction::SetTrue)]
    unknown_outlier_invalid: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct GridArgs {
    /// Race JSON files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "grid_report.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum FormatOpt {
    Csv,
    Json,
}

#[derive(Serialize)]
struct RaceOutput<'a> {
    race: &'a str,
    params_hash: &'a str,
    figures: &'a RaceFigures,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Figures(args) => args.verbose,
        Command::Grid(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Figures(args) => handle_figures(args),
        Command::Grid(args) => handle_grid(args),
    }
}

fn handle_figures(args: FiguresArgs) -> Result<()> {
    let params = build_params(&args)?;
    let params_hash = params.hash_sha256()?;
    debug!("Params {:?} (sha256 {})", params, params_hash);

    let t_load = Instant::now();
    let races = load_races(&args.inputs)?;
    if args.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms ({} races)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            races.len()
        );
    }

    let t_compute = Instant::now();
    let computed: Vec<(String, RaceFigures)> = races
        .par_iter()
        .map(|(label, race)| -> Result<(String, RaceFigures)> {
            let figures = compute_figures(&race.boats, &params)
                .with_context(|| format!("failed to compute figures for '{}'", label))?;
            if figures.is_empty() {
                warn!("Race '{}': grid step undefined, no figures", label);
            }
            Ok((label.clone(), figures))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms",
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }

    let rows: usize = computed
        .iter()
        .map(|(_, f)| f.boats.values().map(|d| d.len()).sum::<usize>())
        .sum();
    info!("Figures computed: {} races, {} rows", computed.len(), rows);

    let to_stdout = args.output.as_os_str() == "-";
    match (args.format, to_stdout) {
        (FormatOpt::Csv, true) => {
            let stdout = io::stdout();
            write_figures_csv(&computed, stdout.lock())?;
        }
        (FormatOpt::Csv, false) => {
            let file = File::create(&args.output)
                .with_context(|| format!("failed to create {}", args.output.display()))?;
            write_figures_csv(&computed, file)?;
        }
        (FormatOpt::Json, true) => {
            let stdout = io::stdout();
            write_figures_json(&computed, &params_hash, stdout.lock())?;
        }
        (FormatOpt::Json, false) => {
            let file = File::create(&args.output)
                .with_context(|| format!("failed to create {}", args.output.display()))?;
            write_figures_json(&computed, &params_hash, file)?;
        }
    }
    if !to_stdout {
        info!("Wrote figures: {}", args.output.display());
    }
    Ok(())
}

fn build_params(args: &FiguresArgs) -> Result<Params> {
    let mut params = match args.params.as_ref() {
        Some(path) => load_params(path)?,
        None => Params::default(),
    };
    if args.skip_empty_distances {
        params.empty_distance = EmptyDistancePolicy::Skip;
    }
    if args.strict_grid {
        params.strict_grid = true;
    }
    if args.unknown_outlier_invalid {
        params.unknown_outlier_is_valid = false;
    }
    Ok(params)
}

fn load_params(path: &Path) -> Result<Params> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read params {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid params JSON object", path.display()))
}

fn load_races(inputs: &[PathBuf]) -> Result<Vec<(String, Race)>> {
    if inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }
    inputs
        .par_iter()
        .map(|path| -> Result<(String, Race)> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let race: Race = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((race_label(&race, path), race))
        })
        .collect()
}

fn race_label(race: &Race, path: &Path) -> String {
    race.id.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("race")
            .to_string()
    })
}

fn write_figures_csv<W: Write>(computed: &[(String, RaceFigures)], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record([
        "race",
        "boat",
        "distance_m",
        "result",
        "deficit_ms",
        "pace_ms",
        "speed_mps",
        "rel_diff_to_avg_speed_pct",
    ])?;

    for (label, figures) in computed {
        for (boat, by_distance) in &figures.boats {
            for (distance, f) in by_distance {
                writer.write_record([
                    label.clone(),
                    boat.clone(),
                    distance.to_string(),
                    format_result(f.result_time_or_code.as_ref()),
                    format_opt_int(f.deficit),
                    format_opt_int(f.pace),
                    format_opt_float(f.speed),
                    format_opt_float(f.rel_diff_to_avg_speed),
                ])?;
            }
        }
    }

    writer.flush()?;
    Ok(())
}

fn write_figures_json<W: Write>(
    computed: &[(String, RaceFigures)],
    params_hash: &str,
    mut out: W,
) -> Result<()> {
    let payload: Vec<RaceOutput<'_>> = computed
        .iter()
        .map(|(race, figures)| RaceOutput {
            race,
            params_hash,
            figures,
        })
        .collect();
    serde_json::to_writer_pretty(&mut out, &payload)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn format_result(value: Option<&ResultTimeOrCode>) -> String {
    match value {
        Some(ResultTimeOrCode::Time(ms)) => ms.to_string(),
        Some(ResultTimeOrCode::Code(code)) => code.clone(),
        None => String::new(),
    }
}

fn format_opt_int(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn format_opt_float(value: Option<f64>) -> String {
    value.map(|v| format!("{:.3}", v)).unwrap_or_default()
}

fn handle_grid(args: GridArgs) -> Result<()> {
    let races = load_races(&args.inputs)?;
    // Reports always complete; empty distances show up with zero valid splits.
    let params = Params {
        empty_distance: EmptyDistancePolicy::Skip,
        ..Params::default()
    };

    let mut report = String::new();
    for (label, race) in &races {
        let figures = compute_figures(&race.boats, &params)
            .with_context(|| format!("failed to inspect '{}'", label))?;
        report.push_str(&grid_report(label, race, &figures));
    }

    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Grid report written: {}", args.output.display());
    }
    Ok(())
}

fn grid_report(label: &str, race: &Race, figures: &RaceFigures) -> String {
    let mut distances: Vec<i64> = race
        .boats
        .iter()
        .flat_map(|b| b.splits().iter().map(|s| s.distance_meter))
        .collect();
    distances.sort_unstable();
    distances.dedup();

    let mut report = String::new();
    report.push_str(&format!("RACE: {}\n", label));
    report.push_str(&format!("  boats: {}\n", race.boats.len()));
    report.push_str(&format!(
        "  distances: {}\n",
        distances
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ));
    match figures.grid_step {
        Some(step) => report.push_str(&format!("  grid_step_m: {}\n", step)),
        None => report.push_str("  grid_step_m: undefined (no figures)\n"),
    }

    if !figures.distances.is_empty() {
        report.push_str("  per_distance:\n");
        for (distance, summary) in &figures.distances {
            report.push_str(&format!(
                "    - {} m: reported={}, valid={}, consecutive={}, best_ms={}, avg_speed_mps={}\n",
                distance,
                summary.reported,
                summary.valid,
                summary.consecutive_step,
                summary
                    .best_time_ms
                    .map_or("n/a".into(), |v| v.to_string()),
                summary.avg_speed.map_or("n/a".into(), |v| format!("{:.3}", v))
            ));
        }
    }

    report.push('\n');
    report
}
