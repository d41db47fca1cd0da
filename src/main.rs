mod cli;
mod error;
mod export;
mod inputs;
mod model;
mod orchestrator;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Route logs to the log file if given, to stderr in headless modes, and
/// nowhere while the TUI owns the terminal.
fn init_logging(args: &cli::Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None if args.is_headless() || cfg!(not(feature = "tui")) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        None => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_headless = args.is_headless();
    init_logging(&args)?;

    cli::run(args).await?;
    // Explicitly exit with code 0 in headless modes; the killed worker's stdio tasks may linger.
    if is_headless {
        std::process::exit(0);
    }
    Ok(())
}
