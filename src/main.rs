use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use time::macros::format_description;

mod archive;
mod audit;
mod batch;
mod config;
mod error;
mod qr;
mod record;
mod table;
mod validate;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "qr-batch")]
#[command(about = "Renders one QR PNG per row of a spreadsheet or CSV of identity records, then bundles the output tree into a ZIP archive.")]
#[command(version)]
struct Cli {
    #[arg(help = "Input table (.xlsx, .xls or .csv)")]
    input: PathBuf,
    #[arg(
        short,
        long,
        default_value = "qr_output",
        help = "Base directory; output lands in <base>/<input file stem>"
    )]
    output: PathBuf,
    #[arg(short, long, help = "Path to a YAML config file")]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(short, long, help = "Worker pool size override (0 for auto)")]
    workers: Option<usize>,
    #[arg(short, long, help = "Hex HMAC-SHA256 signature over the input file")]
    signature: Option<String>,
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }

    init_logging(&cli.log_level, &config)?;

    info!("Starting QR batch generator");
    info!("Input: {}", cli.input.display());

    // the output directory is named after the input file, mirroring the
    // upload contract
    let stem = cli
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .map(record::sanitize_filename)
        .unwrap_or_else(|| "batch".to_string());
    let output_root = cli.output.join(&stem);
    info!("Output root: {}", output_root.display());

    match batch::run_generate(&config, &cli.input, &output_root, cli.signature.as_deref()) {
        Ok(summary) => {
            info!("-------------------- FINAL SUMMARY --------------------");
            info!("Total execution time: {}", batch::format_elapsed(start_time.elapsed()));
            info!("QR images generated: {}", summary.generated);
            info!("Rows skipped (already present): {}", summary.skipped);
            info!("Rows invalid: {}", summary.invalid);
            if !summary.errors.is_empty() {
                warn!("Rows with errors: {}", summary.errors.len());
                for message in summary.errors.iter().take(10) {
                    warn!("  - {}", message);
                }
                if summary.errors.len() > 10 {
                    warn!("  ... (and {} more)", summary.errors.len() - 10);
                }
            }
            info!("Archive: {}", summary.zip_filename);
            info!("-------------------------------------------------------");
            Ok(())
        }
        Err(e) => {
            error!("Batch failed: {}", e);
            Err(e.into())
        }
    }
}

fn init_logging(level_arg: &str, config: &AppConfig) -> Result<()> {
    let level = match level_arg.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        other => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", other);
            LevelFilter::Info
        }
    };

    let log_config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.app_log_path)
    {
        Ok(file) => loggers.push(WriteLogger::new(level, log_config, file)),
        Err(e) => eprintln!(
            "Cannot open diagnostic log {}: {}; logging to terminal only.",
            config.app_log_path.display(),
            e
        ),
    }
    CombinedLogger::init(loggers).context("failed to initialize logging")
}
