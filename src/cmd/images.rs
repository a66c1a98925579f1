//! Boot image commands
//!
//! `dragonfly images import` triggers an import and waits for it to finish;
//! `dragonfly images list` shows what the resource root currently serves.

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use dragonfly_common::{BootImage, ImportSource};
use dragonfly_images::{BootImageService, ConfigFile, HttpSynchronizer, ImportTrigger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct ImagesArgs {
    #[command(subcommand)]
    pub command: ImagesCommand,
}

#[derive(Subcommand, Debug)]
pub enum ImagesCommand {
    /// Import boot images from one or more image indexes
    Import(ImportArgs),
    /// List the boot images available for network boot
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Image index URL to import from (repeatable)
    #[arg(long = "source", value_name = "URL")]
    pub sources: Vec<String>,

    /// YAML file with a list of sources, including selections
    #[arg(long, value_name = "PATH")]
    pub sources_file: Option<PathBuf>,

    /// Keyring used to verify indexes given with --source
    #[arg(long, value_name = "PATH")]
    pub keyring: Option<PathBuf>,

    /// Proxy for plain HTTP downloads
    #[arg(long, value_name = "URL")]
    pub http_proxy: Option<String>,

    /// Proxy for HTTPS downloads
    #[arg(long, value_name = "URL")]
    pub https_proxy: Option<String>,

    /// Seconds to wait when connecting to a source or proxy
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub connect_timeout: u64,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run_images(args: ImagesArgs, config_path: &Path) -> Result<()> {
    let config = ConfigFile::new(config_path);
    debug!(config = %config.path().display(), "Using cluster config");

    let mut synchronizer = HttpSynchronizer::new();
    if let ImagesCommand::Import(import) = &args.command {
        synchronizer =
            synchronizer.with_connect_timeout(Duration::from_secs(import.connect_timeout));
    }
    let service = BootImageService::new(Arc::new(config), Arc::new(synchronizer));

    match args.command {
        ImagesCommand::Import(args) => run_import(&service, args).await,
        ImagesCommand::List(args) => run_list(&service, args).await,
    }
}

/// Collect sources from the command line and the sources file
fn collect_sources(args: &ImportArgs) -> Result<Vec<ImportSource>> {
    let mut sources = Vec::new();

    if let Some(path) = &args.sources_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sources file: {}", path.display()))?;
        let from_file: Vec<ImportSource> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse sources file: {}", path.display()))?;
        debug!(path = %path.display(), count = from_file.len(), "Loaded sources file");
        sources.extend(from_file);
    }

    for url in &args.sources {
        let mut source = ImportSource::new(url.clone());
        if let Some(keyring) = &args.keyring {
            source = source.with_keyring(keyring.clone());
        }
        sources.push(source);
    }

    if sources.is_empty() {
        bail!("No sources given; use --source or --sources-file");
    }
    Ok(sources)
}

async fn run_import(service: &BootImageService, args: ImportArgs) -> Result<()> {
    let sources = collect_sources(&args)?;
    let trigger = service
        .import_boot_images(sources, args.http_proxy, args.https_proxy)
        .context("Failed to start boot image import")?;

    let job = match trigger {
        ImportTrigger::Started(job) => job,
        ImportTrigger::Skipped => {
            println!("A boot image import is already running.");
            return Ok(());
        }
    };

    info!(started_at = %job.started_at(), "Waiting for boot image import");
    let report = job.wait().await.context("Boot image import failed")?;

    println!(
        "Imported {} product(s): {} file(s) downloaded, {} reused from cache",
        report.products, report.downloaded, report.reused
    );
    match &report.snapshot {
        Some(snapshot) => println!("Current snapshot: {}", snapshot.display()),
        None => println!("Current snapshot unchanged"),
    }
    Ok(())
}

async fn run_list(service: &BootImageService, args: ListArgs) -> Result<()> {
    let images = service
        .list_boot_images()
        .await
        .context("Failed to list boot images")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&images)?);
    } else {
        print!("{}", render_table(&images));
    }
    Ok(())
}

fn render_table(images: &[BootImage]) -> String {
    if images.is_empty() {
        return "No boot images available.\n".to_string();
    }

    let headers = ["ARCH", "SUBARCH", "RELEASE", "LABEL", "PURPOSE"];
    let rows: Vec<[String; 5]> = images
        .iter()
        .map(|i| {
            [
                i.architecture.clone(),
                i.subarchitecture.clone(),
                i.release.clone(),
                i.label.clone(),
                i.purpose.to_string(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: [&str; 5]| {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    };
    push_row(headers);
    for row in &rows {
        push_row(row.each_ref().map(String::as_str));
    }
    out
}
