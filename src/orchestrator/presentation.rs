//! Read-side views of a session: predicate tabs, summaries, row access and downloads.

use super::controller::SessionController;
use super::trace::TracingCoordinator;
use crate::error::ExportError;
use crate::export::PredicateExporter;
use crate::model::{Phase, SessionState};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PredicateTab {
    pub name: String,
    pub label: String,
}

/// Output predicates in lexicographic order, labelled with their counts when known.
pub(crate) fn tab_titles(state: &SessionState) -> Vec<PredicateTab> {
    let Some(info) = state.program_info.as_ref() else {
        return Vec::new();
    };
    let mut names = info.output_predicates.clone();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let label = match state.fact_counts.as_ref() {
                Some(counts) => {
                    let count = counts.output_predicates.get(&name).copied().unwrap_or(0);
                    format!("{name} ({count})")
                }
                None => name.clone(),
            };
            PredicateTab { name, label }
        })
        .collect()
}

pub(crate) fn derived_summary(state: &SessionState) -> Option<String> {
    state
        .fact_counts
        .as_ref()
        .map(|c| format!("{} facts of derived predicates", c.facts_of_derived_predicates))
}

fn ms(d: Duration) -> String {
    format!("{:.1} ms", d.as_secs_f64() * 1000.0)
}

pub(crate) fn timing_summary(state: &SessionState) -> Option<String> {
    if state.phase != Phase::Ready {
        return None;
    }
    let parsing = state
        .program_info
        .as_ref()
        .map(|i| i.parsing_duration)
        .unwrap_or_default();
    Some(format!(
        "parsing {}, initialization {}, reasoning {}",
        ms(parsing),
        ms(state.timings.initialization_duration),
        ms(state.timings.reasoning_duration)
    ))
}

/// `pred(v1,v2,..)` for a result row.
pub(crate) fn fact_text_for_row(predicate: &str, row: &[String]) -> String {
    format!("{predicate}({})", row.join(","))
}

/// Put a row into the trace input. Does not start a trace.
pub(crate) fn select_row(tracing: &TracingCoordinator, predicate: &str, row: &[String]) {
    tracing.set_pending_fact(fact_text_for_row(predicate, row));
}

/// One page of rows for the table view.
pub(crate) async fn load_rows(
    session: &SessionController,
    predicate: &str,
    offset: usize,
    limit: usize,
) -> Result<Vec<Vec<String>>, String> {
    let (_, handle) = session.query_target().map_err(|e| e.to_string())?;
    handle
        .predicate_rows(predicate, offset, limit)
        .await
        .map_err(|e| e.message().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DownloadReport {
    Saved { predicate: String, path: PathBuf },
    Failed { predicate: String, message: String },
}

impl DownloadReport {
    pub fn to_message(&self) -> String {
        match self {
            DownloadReport::Saved { predicate, path } => {
                format!("Saved {predicate}: {}", path.display())
            }
            DownloadReport::Failed { predicate, message } => {
                format!("Download of {predicate} failed: {message}")
            }
        }
    }
}

/// Export every row of `predicate` and publish the outcome as a notice.
pub(crate) async fn download_all_rows(
    session: &SessionController,
    exporter: &dyn PredicateExporter,
    predicate: &str,
) -> DownloadReport {
    let outcome = match session.query_target() {
        Ok((_, handle)) => exporter.download_predicate(handle.as_ref(), predicate).await,
        Err(rejected) => Err(ExportError::Unavailable(rejected)),
    };
    let report = match outcome {
        Ok(path) => DownloadReport::Saved {
            predicate: predicate.to_string(),
            path,
        },
        Err(e) => {
            tracing::warn!(predicate, error = %e, "download failed");
            DownloadReport::Failed {
                predicate: predicate.to_string(),
                message: e.to_string(),
            }
        }
    };
    session.notice(report.to_message());
    report
}
