//! In-memory worker with canned replies, used by orchestrator tests.

use super::{BusySender, WorkerFactory, WorkerHandle};
use crate::error::WorkerError;
use crate::model::{FactCounts, ProgramInfo, RunTimings};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Parse,
    MarkExports,
    Start,
    Counts,
    Trace,
    Rows,
}

/// Holds a worker inside `step` until released.
#[derive(Clone)]
pub(crate) struct Gate {
    pub step: Step,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Script {
    pub parse: Result<ProgramInfo, WorkerError>,
    pub mark_exports: Result<(), WorkerError>,
    pub start: Result<RunTimings, WorkerError>,
    pub counts: Result<FactCounts, WorkerError>,
    pub trace: Result<String, WorkerError>,
    pub rows: BTreeMap<String, Vec<Vec<String>>>,
    pub gate: Option<Gate>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            parse: Ok(ProgramInfo::default()),
            mark_exports: Ok(()),
            start: Ok(RunTimings::default()),
            counts: Ok(FactCounts::default()),
            trace: Ok(String::new()),
            rows: BTreeMap::new(),
            gate: None,
        }
    }
}

pub(crate) struct ScriptedWorker {
    script: Script,
    busy_tx: BusySender,
    stopped: AtomicBool,
    calls: Mutex<Vec<String>>,
    started_with: Mutex<Option<BTreeMap<String, Bytes>>>,
}

impl ScriptedWorker {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn started_with(&self) -> Option<BTreeMap<String, Bytes>> {
        self.started_with.lock().clone()
    }

    pub fn push_busy(&self, busy: bool) {
        let _ = self.busy_tx.send(busy);
    }

    async fn enter(&self, step: Step, call: String) {
        self.calls.lock().push(call);
        if let Some(gate) = self.script.gate.as_ref().filter(|g| g.step == step) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }
}

#[async_trait]
impl WorkerHandle for ScriptedWorker {
    async fn parse_program(&self, text: &str) -> Result<ProgramInfo, WorkerError> {
        self.enter(Step::Parse, format!("parse:{text}")).await;
        self.script.parse.clone()
    }

    async fn mark_default_exports(&self) -> Result<(), WorkerError> {
        self.enter(Step::MarkExports, "mark_exports".into()).await;
        self.script.mark_exports.clone()
    }

    async fn start(&self, resources: BTreeMap<String, Bytes>) -> Result<RunTimings, WorkerError> {
        *self.started_with.lock() = Some(resources);
        self.enter(Step::Start, "start".into()).await;
        self.script.start.clone()
    }

    async fn get_counts(&self) -> Result<FactCounts, WorkerError> {
        self.enter(Step::Counts, "counts".into()).await;
        self.script.counts.clone()
    }

    async fn trace_fact_ascii(&self, fact: &str) -> Result<String, WorkerError> {
        self.enter(Step::Trace, format!("trace_ascii:{fact}")).await;
        self.script.trace.clone()
    }

    async fn trace_fact_structured(&self, fact: &str) -> Result<String, WorkerError> {
        self.enter(Step::Trace, format!("trace_structured:{fact}")).await;
        self.script.trace.clone()
    }

    async fn predicate_rows(
        &self,
        predicate: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>, WorkerError> {
        self.enter(Step::Rows, format!("rows:{predicate}:{offset}:{limit}"))
            .await;
        let rows = self
            .script
            .rows
            .get(predicate)
            .ok_or_else(|| WorkerError::Engine(format!("unknown predicate {predicate}")))?;
        Ok(rows.iter().skip(offset).take(limit).cloned().collect())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`ScriptedWorker`]s built from the current script and keeps them
/// for inspection.
pub(crate) struct ScriptedFactory {
    script: Mutex<Script>,
    spawned: Mutex<Vec<Arc<ScriptedWorker>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn spawned(&self) -> Vec<Arc<ScriptedWorker>> {
        self.spawned.lock().clone()
    }

    pub fn last(&self) -> Arc<ScriptedWorker> {
        match self.spawned.lock().last() {
            Some(w) => Arc::clone(w),
            None => panic!("no worker spawned yet"),
        }
    }

    pub fn live_count(&self) -> usize {
        self.spawned.lock().iter().filter(|w| !w.is_stopped()).count()
    }
}

#[async_trait]
impl WorkerFactory for ScriptedFactory {
    async fn spawn(&self, busy_tx: BusySender) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
        let worker = Arc::new(ScriptedWorker {
            script: self.script.lock().clone(),
            busy_tx,
            stopped: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            started_with: Mutex::new(None),
        });
        self.spawned.lock().push(Arc::clone(&worker));
        let handle: Arc<dyn WorkerHandle> = worker;
        Ok(handle)
    }
}
