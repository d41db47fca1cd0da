use crate::inputs::InputRegistry;
use crate::model::{Phase, SessionState, TraceResult};
use crate::orchestrator::{tab_titles, UiUpdate};

pub const ROW_PAGE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Results,
    Inputs,
    Trace,
    Help,
}

impl Pane {
    pub const ALL: [Pane; 4] = [Pane::Results, Pane::Inputs, Pane::Trace, Pane::Help];

    pub fn title(self) -> &'static str {
        match self {
            Pane::Results => "Results",
            Pane::Inputs => "Inputs",
            Pane::Trace => "Trace",
            Pane::Help => "Help",
        }
    }

    pub fn index(self) -> usize {
        Pane::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }

    pub fn cycle(self, forward: bool) -> Pane {
        let n = Pane::ALL.len();
        let i = self.index();
        let next = if forward { (i + 1) % n } else { (i + n - 1) % n };
        Pane::ALL[next]
    }
}

/// What keystrokes currently edit, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    EditFact,
    AddBinding,
    AttachFile,
}

impl InputMode {
    pub fn prompt(self) -> &'static str {
        match self {
            InputMode::Normal => "",
            InputMode::EditFact => "Fact to trace",
            InputMode::AddBinding => "New input (RESOURCE=PATH)",
            InputMode::AttachFile => "File for selected input",
        }
    }
}

pub struct UiState {
    pub pane: Pane,
    pub info: String,
    pub mode: InputMode,
    pub edit_buffer: String,

    pub registry: InputRegistry,
    pub input_selected: usize,

    // Refreshed from the session every tick.
    pub session: SessionState,
    pub trace: TraceResult,
    pub pending_fact: String,
    pub trace_available: bool,
    pub trace_scroll: u16,

    pub predicate_selected: usize,
    pub rows_predicate: Option<String>,
    pub rows: Vec<Vec<String>>,
    pub rows_exhausted: bool,
    pub rows_requested: bool,
    pub row_selected: usize,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            pane: Pane::Results,
            info: String::new(),
            mode: InputMode::Normal,
            edit_buffer: String::new(),
            registry: InputRegistry::new(),
            input_selected: 0,
            session: SessionState::default(),
            trace: TraceResult::default(),
            pending_fact: String::new(),
            trace_available: false,
            trace_scroll: 0,
            predicate_selected: 0,
            rows_predicate: None,
            rows: Vec::new(),
            rows_exhausted: false,
            rows_requested: false,
            row_selected: 0,
        }
    }
}

/// Move `current` by `delta` inside `0..len`.
pub fn step_index(current: usize, delta: isize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let next = current as isize + delta;
    next.clamp(0, len as isize - 1) as usize
}

impl UiState {
    pub fn current_predicate(&self) -> Option<String> {
        tab_titles(&self.session)
            .into_iter()
            .nth(self.predicate_selected)
            .map(|t| t.name)
    }

    pub fn clear_rows(&mut self) {
        self.rows_predicate = None;
        self.rows.clear();
        self.rows_exhausted = false;
        self.rows_requested = false;
        self.row_selected = 0;
    }

    /// Take a fresh session snapshot; rows are dropped whenever they may be stale.
    pub fn refresh_session(&mut self, session: SessionState) {
        let was_ready = self.session.phase == Phase::Ready;
        let is_ready = session.phase == Phase::Ready;
        if was_ready != is_ready || (is_ready && self.session.fact_counts != session.fact_counts) {
            self.clear_rows();
        }
        self.session = session;
        let tabs = tab_titles(&self.session).len();
        self.predicate_selected = step_index(self.predicate_selected, 0, tabs);
    }

    /// The next page to ask for, if the table wants more rows.
    pub fn wanted_rows(&self) -> Option<(String, usize)> {
        if self.session.phase != Phase::Ready || self.rows_requested || self.rows_exhausted {
            return None;
        }
        let predicate = self.current_predicate()?;
        if self.rows_predicate.as_deref() != Some(predicate.as_str()) {
            return Some((predicate, 0));
        }
        let near_end = self.row_selected + 1 >= self.rows.len();
        near_end.then(|| (predicate, self.rows.len()))
    }

    pub fn mark_rows_requested(&mut self, predicate: &str, offset: usize) {
        if offset == 0 {
            self.clear_rows();
            self.rows_predicate = Some(predicate.to_string());
        }
        self.rows_requested = true;
    }

    pub fn apply_update(&mut self, update: UiUpdate) {
        match update {
            UiUpdate::Rows {
                predicate,
                offset,
                rows,
            } => {
                if self.rows_predicate.as_deref() != Some(predicate.as_str())
                    || offset != self.rows.len()
                {
                    return;
                }
                self.rows_requested = false;
                self.rows_exhausted = rows.len() < ROW_PAGE;
                self.rows.extend(rows);
            }
            UiUpdate::RowsFailed { predicate, message } => {
                if self.rows_predicate.as_deref() == Some(predicate.as_str()) {
                    self.rows_requested = false;
                    self.rows_exhausted = true;
                }
                self.info = format!("Loading {predicate} failed: {message}");
            }
            UiUpdate::Info(msg) => self.info = msg,
        }
    }

    pub fn select_predicate(&mut self, delta: isize) {
        let tabs = tab_titles(&self.session).len();
        let next = step_index(self.predicate_selected, delta, tabs);
        if next != self.predicate_selected {
            self.predicate_selected = next;
            self.clear_rows();
        }
    }

    pub fn selected_row(&self) -> Option<&[String]> {
        self.rows.get(self.row_selected).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FactCounts, ProgramInfo};
    use std::collections::BTreeMap;

    fn ready(outputs: &[&str]) -> SessionState {
        SessionState {
            phase: Phase::Ready,
            program_info: Some(ProgramInfo {
                output_predicates: outputs.iter().map(|s| s.to_string()).collect(),
                ..ProgramInfo::default()
            }),
            fact_counts: Some(FactCounts {
                output_predicates: BTreeMap::new(),
                facts_of_derived_predicates: 0,
            }),
            ..SessionState::default()
        }
    }

    #[test]
    fn step_index_clamps() {
        assert_eq!(step_index(0, -1, 3), 0);
        assert_eq!(step_index(2, 1, 3), 2);
        assert_eq!(step_index(1, 1, 3), 2);
        assert_eq!(step_index(5, 0, 0), 0);
    }

    #[test]
    fn first_page_requested_for_sorted_first_predicate() {
        let mut state = UiState::default();
        state.refresh_session(ready(&["zeta", "alpha"]));
        assert_eq!(state.wanted_rows(), Some(("alpha".to_string(), 0)));

        state.mark_rows_requested("alpha", 0);
        assert_eq!(state.wanted_rows(), None);
    }

    #[test]
    fn stale_row_pages_are_ignored() {
        let mut state = UiState::default();
        state.refresh_session(ready(&["a", "b"]));
        state.mark_rows_requested("a", 0);
        state.select_predicate(1);

        state.apply_update(UiUpdate::Rows {
            predicate: "a".into(),
            offset: 0,
            rows: vec![vec!["1".into()]],
        });
        assert!(state.rows.is_empty());
        assert_eq!(state.wanted_rows(), Some(("b".to_string(), 0)));
    }

    #[test]
    fn short_page_marks_table_complete() {
        let mut state = UiState::default();
        state.refresh_session(ready(&["a"]));
        state.mark_rows_requested("a", 0);
        state.apply_update(UiUpdate::Rows {
            predicate: "a".into(),
            offset: 0,
            rows: vec![vec!["1".into()], vec!["2".into()]],
        });
        assert_eq!(state.rows.len(), 2);
        assert!(state.rows_exhausted);
        assert_eq!(state.wanted_rows(), None);
    }

    #[test]
    fn leaving_ready_drops_rows() {
        let mut state = UiState::default();
        state.refresh_session(ready(&["a"]));
        state.mark_rows_requested("a", 0);
        state.apply_update(UiUpdate::Rows {
            predicate: "a".into(),
            offset: 0,
            rows: vec![vec!["1".into()]],
        });
        state.refresh_session(SessionState::default());
        assert!(state.rows.is_empty());
        assert!(state.rows_predicate.is_none());
    }

    #[test]
    fn panes_cycle_both_ways() {
        assert_eq!(Pane::Results.cycle(true), Pane::Inputs);
        assert_eq!(Pane::Results.cycle(false), Pane::Help);
    }
}
