//! Worker hosted in a child process, spoken to with one JSON object per line
//! over its stdin/stdout.

use super::{BusySender, WorkerFactory, WorkerHandle};
use crate::error::WorkerError;
use crate::model::{FactCounts, PanelConfig, ProgramInfo, RunTimings};
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

type PendingTx = oneshot::Sender<Result<Value, WorkerError>>;

pub struct ProcessWorkerFactory {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessWorkerFactory {
    pub fn new(cfg: &PanelConfig) -> Self {
        Self {
            command: cfg.engine_command.clone(),
            args: cfg.engine_args.clone(),
            timeout: cfg.request_timeout,
        }
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(&self, busy_tx: BusySender) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Engine(format!("failed to launch {}: {e}", self.command)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(WorkerError::Engine("worker stdio unavailable".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(Some(line)) = next_line_lossy(&mut reader, &mut buf).await {
                    tracing::debug!(target: "worker", "{line}");
                }
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Outgoing>();
        tokio::spawn(io_loop(stdin, stdout, cmd_rx, busy_tx));
        tracing::info!(command = %self.command, pid = child.id(), "worker launched");

        Ok(Arc::new(ProcessWorker {
            cmd_tx,
            timeout: self.timeout,
            child: parking_lot::Mutex::new(Some(child)),
        }))
    }
}

/// Message queued for the io loop. Requests without a reply slot are sent as
/// notifications and carry no id.
struct Outgoing {
    method: &'static str,
    params: Value,
    reply: Option<PendingTx>,
}

struct ProcessWorker {
    cmd_tx: mpsc::UnboundedSender<Outgoing>,
    timeout: Duration,
    child: parking_lot::Mutex<Option<Child>>,
}

fn worker_exited() -> WorkerError {
    WorkerError::Engine("worker exited".into())
}

impl ProcessWorker {
    async fn call(&self, method: &'static str, params: Value) -> Result<Value, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Outgoing {
                method,
                params,
                reply: Some(tx),
            })
            .map_err(|_| worker_exited())?;

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => Err(WorkerError::Engine(format!(
                "{method} timed out after {}",
                humantime::format_duration(self.timeout)
            ))),
            Ok(Err(_)) => Err(worker_exited()),
            Ok(Ok(res)) => res,
        }
    }

    async fn call_typed<T: for<'de> Deserialize<'de>>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, WorkerError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| WorkerError::Engine(format!("malformed {method} reply: {e}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProgramInfo {
    #[serde(default)]
    edb_predicates: Vec<String>,
    #[serde(default)]
    output_predicates: Vec<String>,
    #[serde(default)]
    parsing_duration_ms: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTimings {
    initialization_duration_ms: f64,
    reasoning_duration_ms: f64,
}

fn millis(ms: f64) -> Duration {
    Duration::try_from_secs_f64(ms.max(0.0) / 1000.0).unwrap_or_default()
}

fn cell_text(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    async fn parse_program(&self, text: &str) -> Result<ProgramInfo, WorkerError> {
        let wire: WireProgramInfo = self
            .call_typed("parseProgram", json!({ "text": text }))
            .await?;
        Ok(ProgramInfo {
            edb_predicates: wire.edb_predicates.into_iter().collect(),
            output_predicates: wire.output_predicates,
            parsing_duration: millis(wire.parsing_duration_ms),
        })
    }

    async fn mark_default_exports(&self) -> Result<(), WorkerError> {
        self.call("markDefaultExports", json!({})).await.map(|_| ())
    }

    async fn start(&self, resources: BTreeMap<String, Bytes>) -> Result<RunTimings, WorkerError> {
        let encoded: serde_json::Map<String, Value> = resources
            .into_iter()
            .map(|(name, data)| {
                let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
                (name, Value::String(b64))
            })
            .collect();
        let wire: WireTimings = self
            .call_typed("start", json!({ "resources": encoded }))
            .await?;
        Ok(RunTimings {
            initialization_duration: millis(wire.initialization_duration_ms),
            reasoning_duration: millis(wire.reasoning_duration_ms),
        })
    }

    async fn get_counts(&self) -> Result<FactCounts, WorkerError> {
        self.call_typed("getCounts", json!({})).await
    }

    async fn trace_fact_ascii(&self, fact: &str) -> Result<String, WorkerError> {
        self.call_typed("parseAndTraceFactAscii", json!({ "fact": fact }))
            .await
    }

    async fn trace_fact_structured(&self, fact: &str) -> Result<String, WorkerError> {
        let value = self
            .call("parseAndTraceFactStructured", json!({ "fact": fact }))
            .await?;
        // The structured trace may arrive as an embedded document rather than a string.
        Ok(cell_text(value))
    }

    async fn predicate_rows(
        &self,
        predicate: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>, WorkerError> {
        let rows: Vec<Vec<Value>> = self
            .call_typed(
                "predicateRows",
                json!({ "predicate": predicate, "offset": offset, "limit": limit }),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    fn stop(&self) {
        let _ = self.cmd_tx.send(Outgoing {
            method: "stop",
            params: json!({}),
            reply: None,
        });
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("worker kill failed: {e}");
            }
        }
    }
}

/// A decoded line from the worker.
#[derive(Debug, PartialEq)]
enum Incoming {
    Response {
        id: u64,
        result: Result<Value, WorkerError>,
    },
    Busy(bool),
}

fn parse_line(line: &str) -> Option<Incoming> {
    let val: Value = serde_json::from_str(line).ok()?;
    if let Some(id) = val.get("id").and_then(Value::as_u64) {
        let result = match val.get("error") {
            Some(err) => {
                let kind = err.get("kind").and_then(Value::as_str).unwrap_or("engine");
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("worker error")
                    .to_string();
                Err(WorkerError::from_kind(kind, message))
            }
            None => Ok(val.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Some(Incoming::Response { id, result });
    }
    if val.get("event").and_then(Value::as_str) == Some("busy") {
        return val.get("busy").and_then(Value::as_bool).map(Incoming::Busy);
    }
    None
}

/// Read one `\n`-terminated line, replacing invalid UTF-8. `Ok(None)` at EOF.
///
/// Partial input stays in `buf` when the future is dropped, so this can be
/// raced in `select!` as long as the same `buf` is passed again.
async fn next_line_lossy<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf[..])
        .trim_end_matches(['\n', '\r'])
        .to_string();
    buf.clear();
    Ok(Some(line))
}

/// Replies still owed by the worker, keyed by request id.
#[derive(Default)]
struct PendingTable {
    next_id: u64,
    slots: HashMap<u64, PendingTx>,
}

impl PendingTable {
    /// Register a reply slot and return its id. Slots whose caller gave up
    /// (timed out) are dropped here.
    fn insert(&mut self, tx: PendingTx) -> u64 {
        self.slots.retain(|_, tx| !tx.is_closed());
        self.next_id += 1;
        self.slots.insert(self.next_id, tx);
        self.next_id
    }

    fn complete(&mut self, id: u64, result: Result<Value, WorkerError>) {
        if let Some(tx) = self.slots.remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn fail_all(&mut self) {
        for (_, tx) in self.slots.drain() {
            let _ = tx.send(Err(worker_exited()));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

async fn io_loop(
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut cmd_rx: mpsc::UnboundedReceiver<Outgoing>,
    busy_tx: BusySender,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut pending = PendingTable::default();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let msg = match cmd.reply {
                    Some(tx) => {
                        let id = pending.insert(tx);
                        json!({ "id": id, "method": cmd.method, "params": cmd.params })
                    }
                    None => json!({ "method": cmd.method, "params": cmd.params }),
                };
                let mut out = msg.to_string();
                out.push('\n');
                if stdin.write_all(out.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
            line = next_line_lossy(&mut reader, &mut buf) => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("worker stdout failed: {e}");
                        break;
                    }
                };
                match parse_line(&line) {
                    Some(Incoming::Response { id, result }) => pending.complete(id, result),
                    Some(Incoming::Busy(busy)) => {
                        let _ = busy_tx.send(busy);
                    }
                    None => tracing::trace!(target: "worker", "ignored line: {line}"),
                }
            }
        }
    }

    pending.fail_all();
    tracing::debug!("worker io loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response() {
        let got = parse_line(r#"{"id":3,"result":{"x":1}}"#);
        assert_eq!(
            got,
            Some(Incoming::Response {
                id: 3,
                result: Ok(json!({"x": 1}))
            })
        );
    }

    #[test]
    fn parses_typed_error_response() {
        let got = parse_line(r#"{"id":7,"error":{"kind":"parse","message":"unexpected token"}}"#);
        assert_eq!(
            got,
            Some(Incoming::Response {
                id: 7,
                result: Err(WorkerError::Parse("unexpected token".into()))
            })
        );
    }

    #[test]
    fn parses_busy_notification() {
        assert_eq!(
            parse_line(r#"{"event":"busy","busy":true}"#),
            Some(Incoming::Busy(true))
        );
        assert_eq!(parse_line(r#"{"event":"log","text":"hi"}"#), None);
        assert_eq!(parse_line("not json"), None);
    }

    #[test]
    fn negative_or_nan_durations_clamp_to_zero() {
        assert_eq!(millis(-4.0), Duration::ZERO);
        assert_eq!(millis(f64::NAN), Duration::ZERO);
        assert_eq!(millis(1500.0), Duration::from_millis(1500));
    }

    #[test]
    fn non_string_cells_render_as_json() {
        assert_eq!(cell_text(json!("a")), "a");
        assert_eq!(cell_text(json!(42)), "42");
    }

    #[tokio::test]
    async fn missing_engine_binary_is_engine_error() {
        let factory = ProcessWorkerFactory {
            command: "/nonexistent/reasoner-worker-binary".into(),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = match factory.spawn(tx).await {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        assert!(matches!(err, WorkerError::Engine(_)));
    }

    #[tokio::test]
    async fn lines_decode_lossily_until_eof() {
        let input: &[u8] = b"\xff\xfe banner\r\n{\"a\":1}\nlast";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();

        let first = next_line_lossy(&mut reader, &mut buf).await.unwrap();
        assert_eq!(first.as_deref(), Some("\u{FFFD}\u{FFFD} banner"));
        let second = next_line_lossy(&mut reader, &mut buf).await.unwrap();
        assert_eq!(second.as_deref(), Some("{\"a\":1}"));
        let third = next_line_lossy(&mut reader, &mut buf).await.unwrap();
        assert_eq!(third.as_deref(), Some("last"));
        assert_eq!(next_line_lossy(&mut reader, &mut buf).await.unwrap(), None);
    }

    #[test]
    fn abandoned_reply_slots_are_pruned() {
        let mut pending = PendingTable::default();
        let (gone_tx, gone_rx) = oneshot::channel();
        assert_eq!(pending.insert(gone_tx), 1);
        drop(gone_rx);

        let (tx, mut rx) = oneshot::channel();
        assert_eq!(pending.insert(tx), 2);
        assert_eq!(pending.len(), 1);

        pending.complete(2, Ok(json!("done")));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!("done")));
        assert_eq!(pending.len(), 0);
    }

    #[cfg(unix)]
    fn sh_worker(script: &str, timeout: Duration) -> ProcessWorkerFactory {
        ProcessWorkerFactory {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn replies_are_routed_by_id() {
        let script = r#"
read -r a
read -r b
ida=$(printf '%s' "$a" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
idb=$(printf '%s' "$b" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
printf '{"id":%s,"result":"second"}\n' "$idb"
printf '{"id":%s,"result":"first"}\n' "$ida"
cat >/dev/null
"#;
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = sh_worker(script, Duration::from_secs(5)).spawn(tx).await.unwrap();

        let (a, b) = tokio::join!(worker.trace_fact_ascii("a"), worker.trace_fact_ascii("b"));
        assert_eq!(a.unwrap(), "first");
        assert_eq!(b.unwrap(), "second");
        worker.stop();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn undecodable_output_and_busy_events_do_not_break_the_worker() {
        let script = r#"
printf '\377\376 banner\n'
printf '\377 noise\n' >&2
printf '{"event":"busy","busy":true}\n'
while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  printf '{"id":%s,"result":{"edbPredicates":["e"],"outputPredicates":["p"],"parsingDurationMs":2}}\n' "$id"
done
"#;
        let (tx, mut busy_rx) = mpsc::unbounded_channel();
        let worker = sh_worker(script, Duration::from_secs(5)).spawn(tx).await.unwrap();

        let busy = tokio::time::timeout(Duration::from_secs(5), busy_rx.recv())
            .await
            .expect("busy event not forwarded");
        assert_eq!(busy, Some(true));

        let info = worker.parse_program("p(?x) :- e(?x) .").await.unwrap();
        assert_eq!(info.output_predicates, vec!["p".to_string()]);
        assert!(info.edb_predicates.contains("e"));
        assert_eq!(info.parsing_duration, Duration::from_millis(2));
        worker.stop();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pending_requests_fail_when_worker_exits() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = sh_worker("read -r line; exit 0", Duration::from_secs(5))
            .spawn(tx)
            .await
            .unwrap();

        let err = worker.get_counts().await.unwrap_err();
        assert_eq!(err, WorkerError::Engine("worker exited".into()));
        let again = worker.get_counts().await.unwrap_err();
        assert_eq!(again, WorkerError::Engine("worker exited".into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_worker_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = sh_worker("cat >/dev/null", Duration::from_millis(50))
            .spawn(tx)
            .await
            .unwrap();

        let err = worker.trace_fact_ascii("p(1)").await.unwrap_err();
        match err {
            WorkerError::Engine(msg) => {
                assert!(msg.starts_with("parseAndTraceFactAscii timed out"), "{msg}")
            }
            other => panic!("unexpected error {other:?}"),
        }
        worker.stop();
    }
}
