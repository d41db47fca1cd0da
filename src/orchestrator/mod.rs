//! Application-level orchestration.
//!
//! This module owns the execution session (run/stop lifecycle, worker
//! ownership), the tracing coordinator guarded by that session, read-side
//! presentation helpers, and the command loop UI layers talk to.

mod controller;
mod dispatch;
mod presentation;
mod trace;

pub(crate) use controller::SessionController;
pub(crate) use dispatch::{run_dispatcher, UiCommand, UiUpdate};
pub(crate) use presentation::{
    derived_summary, download_all_rows, select_row, tab_titles, timing_summary, DownloadReport,
    PredicateTab,
};
pub(crate) use trace::TracingCoordinator;
