//! One multiplexed JSON-RPC connection.
//!
//! Callers only enqueue whole request lines; a writer task owns the write half
//! and puts each line on the wire in one piece, so a cancelled call can never
//! leave a truncated request behind. A reader task routes each response line
//! to the caller waiting on its `id`. When either side of the stream fails
//! every waiting caller is failed; nothing is left hanging on a dead
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxStream = Box<dyn Stream>;

/// Request lines queued ahead of the writer task.
const OUTGOING_QUEUE: usize = 1024;

/// How long `shutdown` waits for queued lines to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a call produced no result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CallError {
    /// The server answered with an error object.
    Rpc { code: Option<i64>, message: String },
    Transport(String),
    Decode(String),
}

type Reply = Result<Value, CallError>;

/// `None` once the connection is closed; registering a call then fails fast.
type PendingMap = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Reply>>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed() -> CallError {
    CallError::Transport("connection closed".to_string())
}

pub(crate) struct Connection {
    /// `None` after `shutdown`; dropping the sender stops the writer task.
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Split `stream` and start the reader and writer tasks on the current
    /// runtime.
    pub(crate) fn start(stream: BoxStream) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));
        let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTGOING_QUEUE);
        let reader = tokio::spawn(read_loop(rd, Arc::clone(&pending)));
        let writer = tokio::spawn(write_loop(wr, rx, Arc::clone(&pending)));
        Self {
            outgoing: Mutex::new(Some(tx)),
            pending,
            next_id: AtomicU64::new(0),
            reader,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        lock(&self.pending).is_some()
    }

    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.pending).as_ref().map_or(0, HashMap::len)
    }

    /// Send one request and wait for its response.
    ///
    /// Dropping the returned future unregisters the request; a late response
    /// for it is discarded by the reader. A line already queued is still
    /// written whole.
    pub(crate) async fn call(&self, method: &str, params: Value) -> Reply {
        let Some(outgoing) = lock(&self.outgoing).clone() else {
            return Err(closed());
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(map) => {
                map.insert(id, tx);
            }
            None => return Err(closed()),
        }
        let _registration = Registration {
            pending: &self.pending,
            id,
        };

        let mut line = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .map_err(|e| CallError::Decode(format!("encode {method}: {e}")))?;
        line.push(b'\n');

        outgoing.send(line).await.map_err(|_| closed())?;

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(closed()),
        }
    }

    /// Fail all waiting calls, stop the reader, then let the writer drain its
    /// queue and close the write side.
    pub(crate) async fn shutdown(&self) {
        let drained = lock(&self.pending).take();
        fail_all(drained, "connection closed by client");
        self.reader.abort();

        drop(lock(&self.outgoing).take());
        let writer = lock(&self.writer).take();
        if let Some(mut handle) = writer {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                debug!("electrum writer did not drain in time");
                handle.abort();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(handle) = lock(&self.writer).take() {
            handle.abort();
        }
    }
}

/// Removes a request's pending entry when its call future ends.
struct Registration<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(map) = lock(self.pending).as_mut() {
            map.remove(&self.id);
        }
    }
}

fn fail_all(drained: Option<HashMap<u64, oneshot::Sender<Reply>>>, reason: &str) {
    let Some(map) = drained else {
        return;
    };
    if !map.is_empty() {
        warn!(in_flight = map.len(), reason, "failing in-flight electrum calls");
    }
    for (_, tx) in map {
        let _ = tx.send(Err(CallError::Transport(reason.to_string())));
    }
}

async fn write_loop(
    mut wr: WriteHalf<BoxStream>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    pending: PendingMap,
) {
    while let Some(line) = rx.recv().await {
        let written = match wr.write_all(&line).await {
            Ok(()) => wr.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let reason = format!("write failed: {e}");
            debug!(%reason, "electrum writer stopped");
            let drained = lock(&pending).take();
            fail_all(drained, &reason);
            return;
        }
    }
    if let Err(e) = wr.shutdown().await {
        debug!(error = %e, "electrum write half shutdown failed");
    }
}

async fn read_loop(rd: ReadHalf<BoxStream>, pending: PendingMap) {
    let mut lines = BufReader::new(rd).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    dispatch(&line, &pending);
                }
            }
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };
    debug!(%reason, "electrum reader stopped");
    let drained = lock(&pending).take();
    fail_all(drained, &reason);
}

fn dispatch(line: &str, pending: &PendingMap) {
    let msg: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "undecodable electrum line ignored");
            return;
        }
    };
    let Some(id) = msg.get("id").and_then(Value::as_u64) else {
        debug!(method = ?msg.get("method"), "electrum notification ignored");
        return;
    };
    let Some(tx) = lock(pending).as_mut().and_then(|m| m.remove(&id)) else {
        debug!(id, "response for unknown or abandoned request");
        return;
    };
    let _ = tx.send(reply_of(msg));
}

fn reply_of(mut msg: Value) -> Reply {
    match msg.get("error") {
        Some(err) if !err.is_null() => {
            let code = err.get("code").and_then(Value::as_i64);
            let message = match err.get("message").and_then(Value::as_str) {
                Some(m) => m.to_string(),
                None => err.to_string(),
            };
            Err(CallError::Rpc { code, message })
        }
        _ => Ok(msg.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
    }
}
