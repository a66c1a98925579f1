use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::io::stderr;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry};

mod cmd;
use cmd::images::ImagesArgs;

/// Default location of the cluster configuration file
const DEFAULT_CONFIG: &str = dragonfly_images::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dragonfly boot image management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cluster configuration file
    #[arg(long, global = true, env = "DRAGONFLY_CLUSTER_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import and list network boot images
    Images(ImagesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG wins; otherwise info (or debug with --verbose) for our crates
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "dragonfly={level},dragonfly_images={level},hyper=warn,reqwest=warn,rustls=warn"
        ))
    });
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(stderr))
        .init();
    debug!("Logger initialized");

    match cli.command {
        Commands::Images(args) => {
            if let Err(e) = cmd::images::run_images(args, &cli.config).await {
                error!("Images command failed: {:#}", e);
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
