//! On-demand derivation traces against the current session's worker.

use super::controller::SessionController;
use crate::error::TraceRejected;
use crate::model::{TraceFormat, TraceResult};
use tracing::{debug, instrument};

/// Per-session tracing state: the fact text being edited and the last outcome.
#[derive(Debug, Clone, Default)]
pub(crate) struct TraceSlot {
    pub pending_fact: String,
    pub result: TraceResult,
}

/// Issues trace requests, but only while a program is loaded and the worker is idle.
#[derive(Clone)]
pub(crate) struct TracingCoordinator {
    session: SessionController,
}

impl TracingCoordinator {
    pub(super) fn new(session: SessionController) -> Self {
        Self { session }
    }

    /// Whether a trace would currently be accepted.
    pub fn check(&self) -> Result<(), TraceRejected> {
        self.session.query_target().map(|_| ())
    }

    pub fn pending_fact(&self) -> String {
        self.session.with_trace(|slot| slot.pending_fact.clone())
    }

    pub fn set_pending_fact(&self, fact: impl Into<String>) {
        let fact = fact.into();
        self.session.with_trace(|slot| slot.pending_fact = fact);
    }

    pub fn result(&self) -> TraceResult {
        self.session.with_trace(|slot| slot.result.clone())
    }

    pub async fn trace_ascii(&self, fact: &str) -> Result<TraceResult, TraceRejected> {
        self.trace(fact, TraceFormat::Ascii).await
    }

    pub async fn trace_structured(&self, fact: &str) -> Result<TraceResult, TraceRejected> {
        self.trace(fact, TraceFormat::GraphStructured).await
    }

    #[instrument(skip(self))]
    async fn trace(&self, fact: &str, format: TraceFormat) -> Result<TraceResult, TraceRejected> {
        let (generation, handle) = match self.session.query_target() {
            Ok(target) => target,
            Err(rejected) => {
                debug!(%rejected, "trace rejected");
                return Err(rejected);
            }
        };

        let outcome = match format {
            TraceFormat::GraphStructured => handle.trace_fact_structured(fact).await,
            _ => handle.trace_fact_ascii(fact).await,
        };
        let result = match outcome {
            Ok(payload) => TraceResult { format, payload },
            Err(e) => TraceResult {
                format: TraceFormat::None,
                payload: e.message().to_string(),
            },
        };

        if !self.session.store_trace(generation, result.clone()) {
            debug!(generation, "dropping trace computed for a released worker");
        }
        Ok(result)
    }
}
