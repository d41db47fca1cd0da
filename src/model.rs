use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub program_path: PathBuf,
    pub engine_command: String,
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub export_dir: PathBuf,
    pub export_page_size: usize,
}

/// In-memory file contents handed to the worker under a resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub name: String,
    pub data: Bytes,
}

impl FileBlob {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A resource name the program can import from, optionally bound to a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputBinding {
    pub resource: String,
    pub file: Option<FileBlob>,
}

impl InputBinding {
    pub fn new(resource: impl Into<String>, file: FileBlob) -> Self {
        Self {
            resource: resource.into(),
            file: Some(file),
        }
    }

    pub fn placeholder(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Ready,
    Failed,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramInfo {
    pub edb_predicates: BTreeSet<String>,
    pub output_predicates: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub parsing_duration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTimings {
    #[serde(with = "humantime_serde")]
    pub initialization_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub reasoning_duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactCounts {
    pub output_predicates: BTreeMap<String, u64>,
    pub facts_of_derived_predicates: u64,
}

/// Everything known about the current computation attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: Phase,
    pub program_info: Option<ProgramInfo>,
    // Zero unless phase is Ready.
    pub timings: RunTimings,
    pub fact_counts: Option<FactCounts>,
    pub worker_busy: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceFormat {
    #[default]
    None,
    Ascii,
    GraphStructured,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResult {
    pub format: TraceFormat,
    pub payload: String,
}

/// Events emitted by the controller for presentation layers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged { phase: Phase },
    WorkerBusy { busy: bool },
    TraceUpdated { result: TraceResult },
    Notice(String),
}
