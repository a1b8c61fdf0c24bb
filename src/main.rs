use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;
use time::macros::format_description;

use smb_registry::config::{Settings, DEFAULT_CONFIG_FILE};
use smb_registry::context::format_elapsed;
use smb_registry::dataset::{stage_path, AGGREGATE_FILE_NAME};
use smb_registry::{
    run_aggregation, run_extraction, AggregateOptions, AggregationSummary, DatasetKind, ExtractOptions,
    ExtractionSummary, StageName,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Extract and aggregate the FTS SMB registry and its companion datasets")]
struct Cli {
    #[arg(long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,

    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, help = "Settings file (YAML)")]
    config: PathBuf,

    #[arg(long, global = true, help = "Data root; overrides the settings file")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decompress and normalize downloaded archives into chunked CSV files.
    Extract(ExtractArgs),
    /// Deduplicate extracted chunks into one file per dataset.
    Aggregate(AggregateArgs),
    /// Extract and aggregate all datasets.
    Process(ProcessArgs),
    /// Show or update persisted settings.
    Config(ConfigArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Smb,
    Revexp,
    Empl,
    All,
}

impl Target {
    fn kinds(self) -> Vec<DatasetKind> {
        match self {
            Target::Smb => vec![DatasetKind::Smb],
            Target::Revexp => vec![DatasetKind::Revexp],
            Target::Empl => vec![DatasetKind::Empl],
            Target::All => DatasetKind::ALL.to_vec(),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(long = "ac", num_args = 1.., help = "Activity codes (OKVED2) or group letters to keep in smb")]
    activity_codes: Vec<String>,

    #[arg(long, help = "Remove previous output before extracting")]
    clear: bool,

    #[arg(short = 'w', long, help = "Worker count; 0 uses all CPUs")]
    workers: Option<usize>,

    #[arg(long, help = "Maximum rows per chunk file")]
    chunk_size: Option<usize>,

    #[arg(long, help = "Disable the progress bar")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[arg(value_enum)]
    target: Target,

    #[arg(long, help = "Archive directory (single dataset only)")]
    in_dir: Option<PathBuf>,

    #[arg(long, help = "Chunk output directory (single dataset only)")]
    out_dir: Option<PathBuf>,

    #[arg(long, help = "Write the extraction summary as JSON")]
    report: Option<PathBuf>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Debug)]
struct AggregateArgs {
    #[arg(value_enum)]
    target: Target,

    #[arg(long, help = "Chunk directory (single dataset only)")]
    in_dir: Option<PathBuf>,

    #[arg(long, help = "Output CSV (single dataset only)")]
    out_file: Option<PathBuf>,

    #[arg(long, help = "Aggregated smb file restricting revexp/empl identifiers")]
    smb_file: Option<PathBuf>,

    #[arg(long, conflicts_with = "smb_file", help = "Keep revexp/empl identifiers absent from smb")]
    no_smb_filter: bool,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(long, help = "Keep revexp/empl identifiers absent from smb")]
    no_smb_filter: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long, help = "Print the current settings")]
    show: bool,

    #[arg(long)]
    num_workers: Option<usize>,

    #[arg(long)]
    chunk_size: Option<usize>,
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", level);
            LevelFilter::Info
        }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;
    Ok(())
}

fn single_kind_override<T>(target: Target, value: &Option<T>, flag: &str) -> Result<()> {
    if value.is_some() && target == Target::All {
        bail!("{} requires a single dataset, not 'all'", flag);
    }
    Ok(())
}

fn write_report(path: &Path, summaries: &[ExtractionSummary]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create report file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, summaries)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    info!("Extraction report written to {}", path.display());
    Ok(())
}

fn extract(
    settings: &Settings,
    kinds: &[DatasetKind],
    run: &RunArgs,
    in_dir: Option<&Path>,
    out_dir: Option<&Path>,
) -> Result<Vec<ExtractionSummary>> {
    let num_workers = match run.workers {
        Some(0) => num_cpus::get(),
        Some(n) => n,
        None => settings.effective_workers(),
    };
    let chunk_size = run.chunk_size.unwrap_or(settings.chunk_size);
    info!("Using {} worker(s), {} rows per chunk", num_workers, chunk_size);

    let mut summaries = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let options = ExtractOptions {
            in_dir: in_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| stage_path(&settings.data_dir, StageName::Download, Some(kind), None)),
            out_dir: out_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| stage_path(&settings.data_dir, StageName::Extract, Some(kind), None)),
            kind,
            num_workers,
            chunk_size,
            activity_codes: run.activity_codes.clone(),
            clear: run.clear,
            show_progress: !run.no_progress,
        };
        let summary = run_extraction(&options).with_context(|| format!("Extraction of {} failed", kind))?;
        summary.log();
        summaries.push(summary);
    }
    Ok(summaries)
}

fn aggregate(
    settings: &Settings,
    kinds: &[DatasetKind],
    args: Option<&AggregateArgs>,
    smb_filter: bool,
) -> Result<Vec<AggregationSummary>> {
    let default_smb = stage_path(&settings.data_dir, StageName::Aggregate, Some(DatasetKind::Smb), Some(AGGREGATE_FILE_NAME));
    let mut summaries = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let companion = match kind {
            DatasetKind::Smb => None,
            _ if !smb_filter => None,
            _ => Some(args.and_then(|a| a.smb_file.clone()).unwrap_or_else(|| default_smb.clone())),
        };
        let options = AggregateOptions {
            in_dir: args
                .and_then(|a| a.in_dir.clone())
                .unwrap_or_else(|| stage_path(&settings.data_dir, StageName::Extract, Some(kind), None)),
            out_file: args
                .and_then(|a| a.out_file.clone())
                .unwrap_or_else(|| stage_path(&settings.data_dir, StageName::Aggregate, Some(kind), Some(AGGREGATE_FILE_NAME))),
            kind,
            companion,
        };
        let summary = run_aggregation(&options).with_context(|| format!("Aggregation of {} failed", kind))?;
        summary.log();
        summaries.push(summary);
    }
    Ok(summaries)
}

fn configure(path: &Path, mut settings: Settings, args: &ConfigArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let changed = args.num_workers.is_some() || args.chunk_size.is_some() || data_dir.is_some();
    if let Some(n) = args.num_workers {
        settings.num_workers = n;
    }
    if let Some(n) = args.chunk_size {
        settings.chunk_size = n;
    }
    if let Some(dir) = data_dir {
        settings.data_dir = dir;
    }
    if changed {
        settings
            .save(path)
            .with_context(|| format!("Failed to save settings to {}", path.display()))?;
        info!("Settings saved to {}", path.display());
    }
    if args.show || !changed {
        let yaml = serde_yaml::to_string(&settings).context("Failed to render settings")?;
        println!("{}", yaml.trim_end());
    }
    Ok(())
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut settings = Settings::load_or_default(&cli.config);
    if let Command::Config(args) = &cli.command {
        return configure(&cli.config, settings, args, cli.data_dir.clone());
    }
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    info!("Data directory: {}", settings.data_dir.display());

    let mut failed_archives = 0;
    match &cli.command {
        Command::Extract(args) => {
            single_kind_override(args.target, &args.in_dir, "--in-dir")?;
            single_kind_override(args.target, &args.out_dir, "--out-dir")?;
            let summaries = extract(
                &settings,
                &args.target.kinds(),
                &args.run,
                args.in_dir.as_deref(),
                args.out_dir.as_deref(),
            )?;
            failed_archives = summaries.iter().map(|s| s.archives_failed).sum();
            if let Some(report) = &args.report {
                write_report(report, &summaries)?;
            }
        }
        Command::Aggregate(args) => {
            single_kind_override(args.target, &args.in_dir, "--in-dir")?;
            single_kind_override(args.target, &args.out_file, "--out-file")?;
            aggregate(&settings, &args.target.kinds(), Some(args), !args.no_smb_filter)?;
        }
        Command::Process(args) => {
            let summaries = extract(&settings, &DatasetKind::ALL, &args.run, None, None)?;
            failed_archives = summaries.iter().map(|s| s.archives_failed).sum();
            aggregate(&settings, &DatasetKind::ALL, None, !args.no_smb_filter)?;
        }
        Command::Config(_) => {}
    }

    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    if failed_archives > 0 {
        warn!("Archives with processing errors: {}", failed_archives);
    }
    info!("-------------------------------------------------------");

    if failed_archives > 0 {
        error!("Finished with failed archives");
        std::process::exit(1);
    }
    Ok(())
}
