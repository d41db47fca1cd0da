//! Execution session lifecycle.
//!
//! Owns the single live worker, drives the parse → exports → start → counts
//! pipeline and applies busy/idle pushes from the worker.

use super::trace::{TraceSlot, TracingCoordinator};
use crate::error::{PipelineError, TraceRejected, WorkerError};
use crate::inputs::resources_for_start;
use crate::model::{InputBinding, Phase, SessionEvent, SessionState, TraceResult};
use crate::worker::{WorkerFactory, WorkerHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

const EVENT_CAPACITY: usize = 256;

struct Inner {
    /// Bumped by every reset; a pipeline only writes while its generation is current.
    generation: u64,
    state: SessionState,
    handle: Option<Arc<dyn WorkerHandle>>,
    trace: TraceSlot,
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub(crate) struct SessionController {
    inner: Arc<Mutex<Inner>>,
    factory: Arc<dyn WorkerFactory>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                generation: 0,
                state: SessionState::default(),
                handle: None,
                trace: TraceSlot::default(),
            })),
            factory,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    #[cfg(test)]
    pub fn has_worker(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    pub fn tracing(&self) -> TracingCoordinator {
        TracingCoordinator::new(self.clone())
    }

    /// Release the worker (without waiting for it) and return to a blank `Idle` session.
    pub fn stop(&self) {
        self.reset(Phase::Idle);
    }

    /// Replace the whole session in one step and hand back the new generation.
    fn reset(&self, phase: Phase) -> u64 {
        let (generation, handle) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = SessionState {
                phase,
                ..SessionState::default()
            };
            inner.trace.result = TraceResult::default();
            (inner.generation, inner.handle.take())
        };
        if let Some(handle) = handle {
            handle.stop();
            info!(generation, "worker released");
        }
        self.emit(SessionEvent::PhaseChanged { phase });
        self.emit(SessionEvent::TraceUpdated {
            result: TraceResult::default(),
        });
        generation
    }

    /// Start a fresh session with `program` over `bindings`.
    ///
    /// Returns [`PipelineError::Superseded`] when a later `stop()`/`run()`
    /// replaced this session before it finished; nothing is written in that case.
    pub async fn run(
        &self,
        program: &str,
        bindings: Vec<InputBinding>,
    ) -> Result<(), PipelineError> {
        let generation = self.begin();
        self.finish(generation, program, bindings).await
    }

    /// Synchronous half of [`run`](Self::run): replace the session with a
    /// `Running` one and return its generation. Ordering between callers is
    /// the order of `begin`/`stop` calls, not of the pipelines that follow.
    pub fn begin(&self) -> u64 {
        let generation = self.reset(Phase::Running);
        info!(generation, "run started");
        generation
    }

    /// Drive the pipeline of a session opened with [`begin`](Self::begin).
    #[instrument(skip_all, fields(generation = generation, inputs = bindings.len()))]
    pub async fn finish(
        &self,
        generation: u64,
        program: &str,
        bindings: Vec<InputBinding>,
    ) -> Result<(), PipelineError> {
        match self.drive(generation, program, &bindings).await {
            Ok(()) => {
                info!(generation, "run ready");
                Ok(())
            }
            Err(PipelineError::Worker(err)) => {
                self.commit(generation, |state| {
                    state.phase = Phase::Failed;
                    state.last_error = Some(err.message().to_string());
                })?;
                warn!(generation, error = %err, "run failed");
                Err(PipelineError::Worker(err))
            }
            Err(PipelineError::Superseded) => {
                debug!(generation, "discarding superseded run");
                Err(PipelineError::Superseded)
            }
        }
    }

    async fn drive(
        &self,
        generation: u64,
        program: &str,
        bindings: &[InputBinding],
    ) -> Result<(), PipelineError> {
        let (busy_tx, busy_rx) = mpsc::unbounded_channel();
        let handle = self.factory.spawn(busy_tx).await?;
        self.install(generation, &handle)?;
        self.listen_busy(generation, busy_rx);

        let info = self.settle(generation, handle.parse_program(program).await)?;
        self.commit(generation, |state| state.program_info = Some(info))?;

        self.settle(generation, handle.mark_default_exports().await)?;

        let resources = resources_for_start(bindings);
        let timings = self.settle(generation, handle.start(resources).await)?;
        self.commit(generation, |state| state.timings = timings)?;

        let counts = self.settle(generation, handle.get_counts().await)?;
        self.commit(generation, |state| {
            state.fact_counts = Some(counts);
            state.phase = Phase::Ready;
        })
    }

    fn install(&self, generation: u64, handle: &Arc<dyn WorkerHandle>) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            drop(inner);
            handle.stop();
            return Err(PipelineError::Superseded);
        }
        inner.handle = Some(Arc::clone(handle));
        Ok(())
    }

    /// Turn a worker reply into the pipeline's result, giving priority to supersession.
    fn settle<T>(
        &self,
        generation: u64,
        outcome: Result<T, WorkerError>,
    ) -> Result<T, PipelineError> {
        if self.inner.lock().generation != generation {
            return Err(PipelineError::Superseded);
        }
        Ok(outcome?)
    }

    fn commit<T>(
        &self,
        generation: u64,
        update: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T, PipelineError> {
        let (out, changed) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return Err(PipelineError::Superseded);
            }
            let before = inner.state.phase;
            let out = update(&mut inner.state);
            let after = inner.state.phase;
            (out, (before != after).then_some(after))
        };
        if let Some(phase) = changed {
            self.emit(SessionEvent::PhaseChanged { phase });
        }
        Ok(out)
    }

    fn listen_busy(&self, generation: u64, mut busy_rx: mpsc::UnboundedReceiver<bool>) {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(busy) = busy_rx.recv().await {
                {
                    let mut guard = inner.lock();
                    if guard.generation != generation {
                        break;
                    }
                    if guard.state.worker_busy == busy {
                        continue;
                    }
                    guard.state.worker_busy = busy;
                }
                let _ = events.send(SessionEvent::WorkerBusy { busy });
            }
            debug!(generation, "busy listener finished");
        });
    }

    /// The current worker, if the session is in a state that accepts queries.
    pub(super) fn query_target(&self) -> Result<(u64, Arc<dyn WorkerHandle>), TraceRejected> {
        let inner = self.inner.lock();
        if inner.state.program_info.is_none() {
            return Err(TraceRejected::NoProgram);
        }
        if inner.state.worker_busy {
            return Err(TraceRejected::WorkerBusy);
        }
        let handle = inner.handle.clone().ok_or(TraceRejected::NoProgram)?;
        Ok((inner.generation, handle))
    }

    pub(super) fn with_trace<T>(&self, f: impl FnOnce(&mut TraceSlot) -> T) -> T {
        f(&mut self.inner.lock().trace)
    }

    /// Store a trace outcome unless the session it was computed for is gone.
    pub(super) fn store_trace(&self, generation: u64, result: TraceResult) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return false;
            }
            inner.trace.result = result.clone();
        }
        self.emit(SessionEvent::TraceUpdated { result });
        true
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Notice(message.into()));
    }

    /// Resolve once the worker has reported itself idle.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            if !self.inner.lock().state.worker_busy {
                return;
            }
            if let Err(broadcast::error::RecvError::Closed) = rx.recv().await {
                return;
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
