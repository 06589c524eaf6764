//! haidar: command-line background removal and vectorization.
//!
//! Three subcommands mirror the editor's workflow:
//!
//! - `refine` removes the background and refines the resulting mask
//! - `convert` vectorizes one image, optionally removing its background
//! - `batch` runs many images and writes the download layout to a
//!   directory
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin haidar -- batch photos/*.jpg --out-dir out
//! RUST_LOG=haidar_pipeline=debug haidar convert cat.png -o cat.svg --remove-background
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]
// Runs on a current-thread runtime; futures need not be Send.
#![allow(clippy::future_not_send)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use haidar_batch::{BatchControl, BatchItem, BatchOrchestrator, BatchSettings, Session};
use haidar_export::{ArchiveEntry, SvgMetadata, encode_png, to_svg};
use haidar_pipeline::{
    Backdrop, BorderKeySegmenter, DEFAULT_MAX_DIMENSION, EngineConfig, EngineSettings,
    ScanlineEngineFactory, Segmenter, load_source, refine, render,
};

/// Remove photo backgrounds and turn the result into SVG.
#[derive(Parser)]
#[command(name = "haidar", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Working resolution (max dimension in pixels after downsampling).
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_DIMENSION, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    max_dimension: u32,

    /// Engine configuration record as a JSON string.
    ///
    /// When omitted, `convert` uses the default settings (or the
    /// no-background preset with `--remove-background`) and `batch` uses
    /// the no-background preset.
    #[arg(long, global = true)]
    config_json: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Remove the background and write the refined cut-out as PNG.
    Refine {
        /// Input image (PNG, JPEG, BMP, WebP).
        image_path: PathBuf,

        /// Output PNG path.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Vectorize one image.
    Convert {
        /// Input image (PNG, JPEG, BMP, WebP).
        image_path: PathBuf,

        /// Output SVG path.
        #[arg(short, long)]
        output: PathBuf,

        /// Remove the background before vectorizing.
        #[arg(long)]
        remove_background: bool,

        /// Also write a transparent PNG rendition of the SVG.
        #[arg(long)]
        raster: Option<PathBuf>,
    },

    /// Convert many images and write `no-background/` and `vectorized/`.
    Batch {
        /// Input images, processed in order.
        #[arg(required = true)]
        image_paths: Vec<PathBuf>,

        /// Directory the results are written into.
        #[arg(long)]
        out_dir: PathBuf,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Parse `--config-json`, or fall back to `default`.
fn engine_config(cli: &Cli, default: EngineSettings) -> Result<EngineConfig, String> {
    cli.config_json.as_deref().map_or_else(
        || Ok(default.to_config()),
        |json| EngineConfig::from_record(json).map_err(|e| format!("Error parsing --config-json: {e}")),
    )
}

fn read(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Error creating {}: {e}", parent.display()))?;
    }
    std::fs::write(path, bytes).map_err(|e| format!("Error writing {}: {e}", path.display()))?;
    eprintln!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

fn write_entries(out_dir: &Path, entries: &[ArchiveEntry]) -> Result<(), String> {
    tracing::debug!(entries = entries.len(), out_dir = %out_dir.display(), "writing results");
    for entry in entries {
        write(&out_dir.join(&entry.path), &entry.bytes)?;
    }
    Ok(())
}

fn stem_of(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("haidar")
}

async fn refine_image(cli: &Cli, image_path: &Path, output: &Path) -> Result<(), String> {
    let source = load_source(&read(image_path)?, cli.max_dimension).map_err(|e| e.to_string())?;
    let segmented = BorderKeySegmenter
        .segment(&source)
        .await
        .map_err(|e| e.to_string())?;
    let refined = refine(&segmented);
    let png = encode_png(&refined).map_err(|e| e.to_string())?;
    write(output, &png)
}

async fn convert_image(
    cli: &Cli,
    image_path: &Path,
    output: &Path,
    remove_background: bool,
    raster: Option<&Path>,
) -> Result<(), String> {
    let preset = if remove_background {
        EngineSettings::no_background()
    } else {
        EngineSettings::default()
    };
    let config = engine_config(cli, preset)?;

    let mut session = Session::new();
    session
        .load_bytes(&read(image_path)?, cli.max_dimension)
        .map_err(|e| e.to_string())?;
    if remove_background {
        session
            .remove_background(&BorderKeySegmenter)
            .await
            .map_err(|e| e.to_string())?;
    }
    if !session
        .convert(&ScanlineEngineFactory, &config)
        .await
        .map_err(|e| e.to_string())?
    {
        return Err("Conversion was stopped".to_owned());
    }

    let document = session.workspace().document();
    eprintln!("Traced {} shapes at {}", document.len(), document.dimensions());

    let record = serde_json::to_string(&config).map_err(|e| e.to_string())?;
    let metadata = SvgMetadata {
        title: Some(stem_of(image_path)),
        description: None,
        config_json: Some(&record),
    };
    write(output, to_svg(document, &metadata, config.path_precision).as_bytes())?;

    if let Some(raster_path) = raster {
        let png = encode_png(&render(document, Backdrop::Transparent)).map_err(|e| e.to_string())?;
        write(raster_path, &png)?;
    }
    Ok(())
}

async fn batch(cli: &Cli, image_paths: &[PathBuf], out_dir: &Path, json: bool) -> Result<(), String> {
    let settings = BatchSettings {
        max_dimension: cli.max_dimension,
        engine: engine_config(cli, EngineSettings::no_background())?,
    };

    let mut items = Vec::with_capacity(image_paths.len());
    for path in image_paths {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("image");
        items.push(BatchItem::new(name, read(path)?));
    }

    let orchestrator = BatchOrchestrator::new(BorderKeySegmenter, ScanlineEngineFactory, settings);
    let mut session = Session::new();
    let report = orchestrator
        .run(&mut session, &items, &BatchControl::new())
        .await;

    for failure in &report.failures {
        eprintln!("Failed: {} ({})", failure.name, failure.error);
    }
    let archive = report.archive().map_err(|e| e.to_string())?;
    write_entries(out_dir, archive.entries())?;

    let summary = report.summary();
    if json {
        let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("{summary}");
    }

    if report.results.is_empty() && !report.failures.is_empty() {
        return Err("No image could be converted".to_owned());
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<(), String> {
    match &cli.command {
        Command::Refine { image_path, output } => refine_image(cli, image_path, output).await,
        Command::Convert {
            image_path,
            output,
            remove_background,
            raster,
        } => convert_image(cli, image_path, output, *remove_background, raster.as_deref()).await,
        Command::Batch {
            image_paths,
            out_dir,
            json,
        } => batch(cli, image_paths, out_dir, *json).await,
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}
