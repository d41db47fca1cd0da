//! Command loop between a presentation layer and the session.
//!
//! UI layers send [`UiCommand`]s; long-running work is spawned so that a
//! `Stop` is serviced while a run or trace is still waiting on the worker.

use super::controller::SessionController;
use super::presentation::{download_all_rows, load_rows};
use crate::error::PipelineError;
use crate::export::PredicateExporter;
use crate::model::{InputBinding, TraceFormat};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Run {
        program: String,
        bindings: Vec<InputBinding>,
    },
    Stop,
    Trace {
        fact: String,
        format: TraceFormat,
    },
    LoadRows {
        predicate: String,
        offset: usize,
        limit: usize,
    },
    Download {
        predicate: String,
    },
    Quit,
}

/// Replies that do not fit in session state.
#[derive(Debug, Clone)]
pub(crate) enum UiUpdate {
    Rows {
        predicate: String,
        offset: usize,
        rows: Vec<Vec<String>>,
    },
    RowsFailed {
        predicate: String,
        message: String,
    },
    Info(String),
}

pub(crate) async fn run_dispatcher(
    session: SessionController,
    exporter: Arc<dyn PredicateExporter>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    update_tx: UnboundedSender<UiUpdate>,
) -> Result<()> {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            UiCommand::Run { program, bindings } => {
                // Reset inline so later commands in the queue act on this session.
                let generation = session.begin();
                let session = session.clone();
                let update_tx = update_tx.clone();
                tokio::spawn(async move {
                    let msg = match session.finish(generation, &program, bindings).await {
                        Ok(()) => "Run finished".to_string(),
                        Err(PipelineError::Superseded) => return,
                        Err(PipelineError::Worker(e)) => format!("Run failed: {e}"),
                    };
                    let _ = update_tx.send(UiUpdate::Info(msg));
                });
            }
            UiCommand::Stop => {
                session.stop();
                let _ = update_tx.send(UiUpdate::Info("Stopped".into()));
            }
            UiCommand::Trace { fact, format } => {
                let coordinator = session.tracing();
                let update_tx = update_tx.clone();
                tokio::spawn(async move {
                    let outcome = match format {
                        TraceFormat::GraphStructured => coordinator.trace_structured(&fact).await,
                        _ => coordinator.trace_ascii(&fact).await,
                    };
                    if let Err(rejected) = outcome {
                        let _ = update_tx.send(UiUpdate::Info(format!(
                            "Cannot trace now: {rejected}"
                        )));
                    }
                });
            }
            UiCommand::LoadRows {
                predicate,
                offset,
                limit,
            } => {
                let session = session.clone();
                let update_tx = update_tx.clone();
                tokio::spawn(async move {
                    let update = match load_rows(&session, &predicate, offset, limit).await {
                        Ok(rows) => UiUpdate::Rows {
                            predicate,
                            offset,
                            rows,
                        },
                        Err(message) => UiUpdate::RowsFailed { predicate, message },
                    };
                    let _ = update_tx.send(update);
                });
            }
            UiCommand::Download { predicate } => {
                let session = session.clone();
                let exporter = Arc::clone(&exporter);
                let update_tx = update_tx.clone();
                tokio::spawn(async move {
                    let report = download_all_rows(&session, exporter.as_ref(), &predicate).await;
                    let _ = update_tx.send(UiUpdate::Info(report.to_message()));
                });
            }
            UiCommand::Quit => break,
        }
    }

    session.stop();
    Ok(())
}
