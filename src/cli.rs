use crate::export::CsvExporter;
use crate::inputs::InputRegistry;
use crate::model::{FileBlob, InputBinding, PanelConfig, TraceFormat, TraceResult};
use crate::orchestrator::{download_all_rows, tab_titles, DownloadReport, SessionController};
use crate::worker::ProcessWorkerFactory;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TraceStyle {
    Ascii,
    Graph,
}

impl From<TraceStyle> for TraceFormat {
    fn from(style: TraceStyle) -> Self {
        match style {
            TraceStyle::Ascii => TraceFormat::Ascii,
            TraceStyle::Graph => TraceFormat::GraphStructured,
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "reasoner-panel",
    version,
    about = "Run a rule program in an isolated reasoning worker and trace derived facts"
)]
pub struct Cli {
    /// Program file to load into the worker
    pub program: PathBuf,

    /// Bind a resource name to a data file (RESOURCE=PATH, repeatable; empty PATH adds a placeholder)
    #[arg(long = "input", value_name = "RESOURCE=PATH")]
    pub inputs: Vec<String>,

    /// Worker executable launched for every run
    #[arg(long, default_value = "nemo-worker")]
    pub engine: String,

    /// Extra argument passed to the worker executable (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Deadline for a single worker request
    #[arg(long, default_value = "5m")]
    pub request_timeout: humantime::Duration,

    /// Directory for CSV downloads (defaults to the user download directory)
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// Rows fetched per worker request when downloading
    #[arg(long, default_value_t = 1000)]
    pub export_page_size: usize,

    /// Print JSON result and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Trace this fact after the run (headless modes)
    #[arg(long)]
    pub trace: Option<String>,

    /// Rendering of --trace
    #[arg(long, value_enum, default_value_t = TraceStyle::Ascii)]
    pub trace_format: TraceStyle,

    /// Download all rows of this predicate as CSV after the run (headless modes, repeatable)
    #[arg(long = "download")]
    pub downloads: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Write logs to this file (the TUI otherwise discards them)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Use --run-on-launch false to wait for `r` in the TUI
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub run_on_launch: bool,
}

impl Cli {
    pub fn is_headless(&self) -> bool {
        self.json || self.text
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text are mutually exclusive"));
    }

    if !args.is_headless() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_headless(args).await;
        }
    }

    run_headless(args).await
}

/// Build a `PanelConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> PanelConfig {
    let export_dir = args
        .export_dir
        .clone()
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    PanelConfig {
        program_path: args.program.clone(),
        engine_command: args.engine.clone(),
        engine_args: args.engine_args.clone(),
        request_timeout: Duration::from(args.request_timeout),
        export_dir,
        export_page_size: args.export_page_size,
    }
}

pub fn read_program(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read program {}", path.display()))
}

/// Load a file into a blob named after its file name.
pub fn load_blob(path: &Path) -> Result<FileBlob> {
    let data = std::fs::read(path).with_context(|| format!("read input {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(FileBlob::new(name, data))
}

/// Parse `RESOURCE=PATH`; an empty or `-` path yields a placeholder.
pub fn parse_input(spec: &str) -> Result<InputBinding> {
    let (resource, path) = spec
        .split_once('=')
        .with_context(|| format!("input {spec:?} is not RESOURCE=PATH"))?;
    let resource = resource.trim();
    if resource.is_empty() {
        return Err(anyhow::anyhow!("input {spec:?} has an empty resource name"));
    }
    let path = path.trim();
    if path.is_empty() || path == "-" {
        return Ok(InputBinding::placeholder(resource));
    }
    Ok(InputBinding::new(resource, load_blob(Path::new(path))?))
}

pub fn build_registry(args: &Cli) -> Result<InputRegistry> {
    let mut registry = InputRegistry::new();
    for spec in &args.inputs {
        registry.add(parse_input(spec)?);
    }
    Ok(registry)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeadlessReport<'a> {
    generated_utc: String,
    session: &'a crate::model::SessionState,
    tabs: Vec<String>,
    trace: Option<&'a TraceResult>,
    downloads: Vec<String>,
}

/// Run once without the TUI, print the outcome and release the worker.
async fn run_headless(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let program = read_program(&cfg.program_path)?;
    let registry = build_registry(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();

    let session = SessionController::new(Arc::new(ProcessWorkerFactory::new(&cfg)));
    let outcome = session.run(&program, registry.snapshot()).await;
    if outcome.is_ok() {
        tokio::task::yield_now().await;
        session.wait_until_idle().await;
    }

    let mut trace = None;
    if let (Ok(()), Some(fact)) = (&outcome, args.trace.as_deref()) {
        let coordinator = session.tracing();
        let traced = match TraceFormat::from(args.trace_format) {
            TraceFormat::GraphStructured => coordinator.trace_structured(fact).await,
            _ => coordinator.trace_ascii(fact).await,
        };
        match traced {
            Ok(result) => trace = Some(result),
            Err(rejected) => {
                let _ = out_tx.send(OutputLine::Stderr(format!("Cannot trace {fact}: {rejected}")));
            }
        }
    }

    let mut downloads: Vec<DownloadReport> = Vec::new();
    if outcome.is_ok() && !args.downloads.is_empty() {
        let exporter = CsvExporter::new(&cfg.export_dir, cfg.export_page_size);
        for predicate in &args.downloads {
            downloads.push(download_all_rows(&session, &exporter, predicate).await);
        }
    }

    let state = session.snapshot();
    if args.json {
        let report = HeadlessReport {
            generated_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            session: &state,
            tabs: tab_titles(&state).into_iter().map(|t| t.label).collect(),
            trace: trace.as_ref(),
            downloads: downloads.iter().map(DownloadReport::to_message).collect(),
        };
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&report)?));
    } else {
        let summary = crate::text_summary::build_text_summary(&state, trace.as_ref(), &downloads);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    session.stop();
    drop(out_tx);
    let _ = out_handle.await;

    outcome.context("run failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(extra: &[&str]) -> Cli {
        let mut argv = vec!["reasoner-panel", "prog.rls"];
        argv.extend_from_slice(extra);
        Cli::parse_from(argv)
    }

    #[test]
    fn defaults() {
        let args = cli(&[]);
        assert!(!args.is_headless());
        assert!(args.run_on_launch);
        let cfg = build_config(&args);
        assert_eq!(cfg.engine_command, "nemo-worker");
        assert_eq!(cfg.request_timeout, Duration::from_secs(300));
        assert_eq!(cfg.program_path, PathBuf::from("prog.rls"));
    }

    #[test]
    fn engine_args_accept_flags() {
        let args = cli(&["--engine", "nmo-worker", "--engine-arg", "--threads=2", "--text"]);
        let cfg = build_config(&args);
        assert_eq!(cfg.engine_args, vec!["--threads=2".to_string()]);
        assert!(args.is_headless());
    }

    #[test]
    fn input_specs_load_files_and_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.csv");
        std::fs::write(&path, "a,b\n").unwrap();

        let bound = parse_input(&format!("edges={}", path.display())).unwrap();
        assert_eq!(bound.resource, "edges");
        let file = bound.file.unwrap();
        assert_eq!(file.name, "edges.csv");
        assert_eq!(file.size(), 4);

        assert_eq!(parse_input("later=").unwrap(), InputBinding::placeholder("later"));
        assert_eq!(parse_input("later=-").unwrap(), InputBinding::placeholder("later"));
    }

    #[test]
    fn malformed_input_specs_are_rejected() {
        assert!(parse_input("no-equals-sign").is_err());
        assert!(parse_input("=file.csv").is_err());
        assert!(parse_input("r=/definitely/missing/file.csv").is_err());
    }

    #[test]
    fn trace_style_maps_to_format() {
        let args = cli(&["--trace", "p(1)", "--trace-format", "graph"]);
        assert_eq!(TraceFormat::from(args.trace_format), TraceFormat::GraphStructured);
    }
}
