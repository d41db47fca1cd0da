//! Text summary builder for CLI output.
//!
//! This module formats a finished session into human-readable lines for text mode.

use crate::model::{Phase, SessionState, TraceFormat, TraceResult};
use crate::orchestrator::{derived_summary, tab_titles, timing_summary, DownloadReport};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(
    state: &SessionState,
    trace: Option<&TraceResult>,
    downloads: &[DownloadReport],
) -> TextSummary {
    let mut lines = vec![format!("Status: {}", state.phase.label())];

    if let Some(err) = state.last_error.as_deref() {
        lines.push(format!("Error: {err}"));
    }
    if let Some(info) = state.program_info.as_ref() {
        let edb: Vec<&str> = info.edb_predicates.iter().map(String::as_str).collect();
        if !edb.is_empty() {
            lines.push(format!("Input predicates: {}", edb.join(", ")));
        }
    }
    if let Some(timings) = timing_summary(state) {
        lines.push(format!("Timings: {timings}"));
    }
    if let Some(derived) = derived_summary(state) {
        lines.push(derived);
    }

    let tabs = tab_titles(state);
    if !tabs.is_empty() {
        lines.push("Output predicates:".into());
        lines.extend(tabs.into_iter().map(|t| format!("  {}", t.label)));
    }

    if let Some(trace) = trace {
        match trace.format {
            TraceFormat::None => lines.push(format!("Trace failed: {}", trace.payload)),
            TraceFormat::Ascii | TraceFormat::GraphStructured => {
                lines.push("Trace:".into());
                lines.extend(trace.payload.lines().map(str::to_string));
            }
        }
    }

    lines.extend(downloads.iter().map(DownloadReport::to_message));

    if state.phase == Phase::Running {
        lines.push("(run did not finish)".into());
    }

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FactCounts, ProgramInfo};
    use std::collections::BTreeMap;

    #[test]
    fn ready_session_lists_counts_and_trace() {
        let state = SessionState {
            phase: Phase::Ready,
            program_info: Some(ProgramInfo {
                edb_predicates: ["edge".to_string()].into_iter().collect(),
                output_predicates: vec!["path".into()],
                ..ProgramInfo::default()
            }),
            fact_counts: Some(FactCounts {
                output_predicates: BTreeMap::from([("path".to_string(), 6)]),
                facts_of_derived_predicates: 6,
            }),
            ..SessionState::default()
        };
        let trace = TraceResult {
            format: TraceFormat::Ascii,
            payload: "path(a,c)\n  path(a,b)".into(),
        };

        let lines = build_text_summary(&state, Some(&trace), &[]).lines;
        assert_eq!(lines[0], "Status: ready");
        assert!(lines.contains(&"Input predicates: edge".to_string()));
        assert!(lines.contains(&"6 facts of derived predicates".to_string()));
        assert!(lines.contains(&"  path (6)".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("  path(a,b)"));
    }

    #[test]
    fn failed_session_shows_error() {
        let state = SessionState {
            phase: Phase::Failed,
            last_error: Some("unexpected token".into()),
            ..SessionState::default()
        };
        let failed_trace = TraceResult {
            format: TraceFormat::None,
            payload: "not derivable".into(),
        };
        let lines = build_text_summary(&state, Some(&failed_trace), &[]).lines;
        assert_eq!(
            lines,
            vec![
                "Status: failed",
                "Error: unexpected token",
                "Trace failed: not derivable"
            ]
        );
    }
}
