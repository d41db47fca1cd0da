//! Boundary to the reasoning engine.
//!
//! A [`WorkerHandle`] is one isolated engine instance. The orchestrator owns at
//! most one at a time and obtains fresh ones from a [`WorkerFactory`].

mod process;
#[cfg(test)]
pub(crate) mod scripted;

use crate::error::WorkerError;
use crate::model::{FactCounts, ProgramInfo, RunTimings};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub use process::ProcessWorkerFactory;

/// Busy/idle notifications pushed by a worker outside of any request.
pub type BusySender = UnboundedSender<bool>;

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    async fn parse_program(&self, text: &str) -> Result<ProgramInfo, WorkerError>;

    async fn mark_default_exports(&self) -> Result<(), WorkerError>;

    async fn start(&self, resources: BTreeMap<String, Bytes>) -> Result<RunTimings, WorkerError>;

    async fn get_counts(&self) -> Result<FactCounts, WorkerError>;

    async fn trace_fact_ascii(&self, fact: &str) -> Result<String, WorkerError>;

    async fn trace_fact_structured(&self, fact: &str) -> Result<String, WorkerError>;

    /// One page of the rows of an output predicate, values rendered as text.
    async fn predicate_rows(
        &self,
        predicate: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>, WorkerError>;

    /// Ask the worker to terminate. Never blocks and never fails.
    fn stop(&self);
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Create a new worker that reports busy state changes on `busy_tx`.
    async fn spawn(&self, busy_tx: BusySender) -> Result<Arc<dyn WorkerHandle>, WorkerError>;
}
