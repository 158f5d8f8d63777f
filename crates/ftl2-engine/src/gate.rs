//! Controller-side gate client.
//!
//! A [`Gate`] owns one remote gate process, identified by `(host,
//! bundle-fingerprint)`. Two tasks service it: a writer that serializes
//! requests from a queue, and a reader that drains frames and correlates
//! them against the pending-call table. Invariants enforced here: at most
//! one in-flight request per id, exactly one `result` per `execute`,
//! events before a `result` belong to that call, and a late `result` for
//! an abandoned id is discarded via the blacklist rather than surfacing.
//!
//! [`GateManager`] keeps gates warm for the context lifetime and
//! relaunches dead ones lazily on the next call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use ftl2_protocol::{read_frame, write_frame, GateRequest, GateResponse, RequestId};

use crate::bundle::Bundle;
use crate::error::{EngineError, Result};
use crate::events::EventSink;
use crate::inventory::Host;
use crate::transport::{GateChannel, GateLauncher};

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal answer of one gate execution.
#[derive(Clone, Debug)]
pub struct ModuleReply {
    pub success: bool,
    pub changed: bool,
    pub output: Value,
    pub error: Option<String>,
}

struct PendingCall {
    result_tx: oneshot::Sender<Result<ModuleReply>>,
    /// Absent for `info`/`list_modules`, which never stream events.
    events: Option<EventSink>,
}

struct Shared {
    host: String,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    /// Abandoned ids (cancel/timeout): their late results are dropped.
    blacklist: Mutex<HashSet<RequestId>>,
    alive: AtomicBool,
}

impl Shared {
    fn fail_all(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            let _ = call
                .result_tx
                .send(Err(EngineError::TransportLost(self.host.clone())));
        }
        if !reason.is_empty() {
            tracing::warn!(host = %self.host, reason, "gate lost");
        }
    }
}

pub struct Gate {
    fingerprint: String,
    outgoing: mpsc::Sender<GateRequest>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl Gate {
    /// Spawns the writer and reader tasks over the channel and waits for
    /// the gate's `ready` frame.
    pub async fn start(host: &str, fingerprint: &str, channel: GateChannel) -> Result<Arc<Gate>> {
        let GateChannel {
            mut writer,
            mut reader,
            child,
        } = channel;

        let shared = Arc::new(Shared {
            host: host.to_string(),
            pending: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(HashSet::new()),
            alive: AtomicBool::new(true),
        });

        let (outgoing, mut outgoing_rx) = mpsc::channel::<GateRequest>(64);
        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(request) = outgoing_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &request).await {
                    writer_shared.fail_all(&format!("write failed: {e}"));
                    return;
                }
            }
            // Queue closed: shutdown path; EOF on the gate's stdin is a
            // clean exit signal.
        });

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                match read_frame::<_, GateResponse>(&mut reader).await {
                    Ok(Some(GateResponse::Ready)) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Ok(Some(GateResponse::Event { id, kind, payload })) => {
                        let pending = reader_shared.pending.lock().expect("pending lock");
                        if let Some(PendingCall {
                            events: Some(events),
                            ..
                        }) = pending.get(&id)
                        {
                            events.gate_event(kind, &payload);
                        }
                    }
                    Ok(Some(GateResponse::Result {
                        id,
                        success,
                        changed,
                        output,
                        error,
                    })) => {
                        if reader_shared
                            .blacklist
                            .lock()
                            .expect("blacklist lock")
                            .remove(&id)
                        {
                            tracing::debug!(host = %reader_shared.host, id, "discarded late result");
                            continue;
                        }
                        let call = reader_shared
                            .pending
                            .lock()
                            .expect("pending lock")
                            .remove(&id);
                        match call {
                            Some(call) => {
                                let _ = call.result_tx.send(Ok(ModuleReply {
                                    success,
                                    changed,
                                    output,
                                    error,
                                }));
                            }
                            None => {
                                // A result with no pending call is either a
                                // duplicate or an id we never issued.
                                reader_shared
                                    .fail_all(&format!("result for unknown id {id}"));
                                return;
                            }
                        }
                    }
                    Ok(Some(GateResponse::Error { id: Some(id), message })) => {
                        let call = reader_shared
                            .pending
                            .lock()
                            .expect("pending lock")
                            .remove(&id);
                        if let Some(call) = call {
                            let _ = call.result_tx.send(Err(EngineError::Protocol(message)));
                        }
                    }
                    Ok(Some(GateResponse::Error { id: None, message })) => {
                        reader_shared.fail_all(&message);
                        return;
                    }
                    Ok(None) => {
                        reader_shared.fail_all("stream closed");
                        return;
                    }
                    Err(e) => {
                        reader_shared.fail_all(&format!("frame error: {e}"));
                        return;
                    }
                }
            }
        });

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                shared.fail_all("gate never became ready");
                return Err(EngineError::TransportLost(host.to_string()));
            }
        }
        tracing::info!(host, fingerprint, "gate ready");

        Ok(Arc::new(Gate {
            fingerprint: fingerprint.to_string(),
            outgoing,
            shared,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader_task)),
            child: Mutex::new(child),
        }))
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Sends one `execute` and awaits its `result`, forwarding interleaved
    /// events to `events`. On timeout the id is blacklisted and any late
    /// result discarded. On cancellation the call may drain for up to
    /// `cancel_grace` before being abandoned the same way.
    pub async fn execute(
        &self,
        module: &str,
        params: Value,
        check_mode: bool,
        events: EventSink,
        deadline: Duration,
        cancel: &CancellationToken,
        cancel_grace: Duration,
    ) -> Result<ModuleReply> {
        if !self.is_alive() {
            return Err(EngineError::TransportLost(self.shared.host.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (result_tx, mut result_rx) = oneshot::channel();
        self.shared.pending.lock().expect("pending lock").insert(
            id,
            PendingCall {
                result_tx,
                events: Some(events),
            },
        );

        let request = GateRequest::Execute {
            id,
            module: module.to_string(),
            params,
            check_mode,
        };
        if self.outgoing.send(request).await.is_err() {
            self.shared.pending.lock().expect("pending lock").remove(&id);
            return Err(EngineError::TransportLost(self.shared.host.clone()));
        }

        tokio::select! {
            reply = &mut result_rx => {
                reply.map_err(|_| EngineError::TransportLost(self.shared.host.clone()))?
            }
            _ = tokio::time::sleep(deadline) => {
                self.abandon(id);
                Err(EngineError::Timeout)
            }
            _ = cancel.cancelled() => {
                // In-flight work may drain briefly before we walk away.
                match tokio::time::timeout(cancel_grace, &mut result_rx).await {
                    Ok(Ok(reply)) => reply,
                    _ => {
                        self.abandon(id);
                        Err(EngineError::Cancelled)
                    }
                }
            }
        }
    }

    /// Asks the gate for its build and runtime information.
    pub async fn info(&self) -> Result<Value> {
        self.plain_request(|id| GateRequest::Info { id }).await
    }

    /// Lists the modules baked into the gate's bundle.
    pub async fn list_modules(&self) -> Result<Value> {
        self.plain_request(|id| GateRequest::ListModules { id })
            .await
    }

    /// Correlated request with no event stream (`info`, `list_modules`).
    async fn plain_request(
        &self,
        build: impl FnOnce(RequestId) -> GateRequest,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(EngineError::TransportLost(self.shared.host.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (result_tx, result_rx) = oneshot::channel();
        self.shared.pending.lock().expect("pending lock").insert(
            id,
            PendingCall {
                result_tx,
                events: None,
            },
        );
        if self.outgoing.send(build(id)).await.is_err() {
            self.shared.pending.lock().expect("pending lock").remove(&id);
            return Err(EngineError::TransportLost(self.shared.host.clone()));
        }
        match tokio::time::timeout(READY_TIMEOUT, result_rx).await {
            Ok(Ok(reply)) => reply.map(|r| r.output),
            Ok(Err(_)) => Err(EngineError::TransportLost(self.shared.host.clone())),
            Err(_) => {
                self.abandon(id);
                Err(EngineError::Timeout)
            }
        }
    }

    fn abandon(&self, id: RequestId) {
        let removed = self
            .shared
            .pending
            .lock()
            .expect("pending lock")
            .remove(&id)
            .is_some();
        if removed {
            self.shared
                .blacklist
                .lock()
                .expect("blacklist lock")
                .insert(id);
        }
    }

    /// Graceful teardown: `shutdown` frame, bounded wait for the reader to
    /// observe the gate exit, then reap the process.
    pub async fn shutdown(&self) {
        let _ = self.outgoing.send(GateRequest::Shutdown).await;
        let reader = self.reader.lock().expect("reader lock").take();
        if let Some(reader) = reader {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, reader).await.is_err() {
                tracing::warn!(host = %self.shared.host, "gate did not exit in time");
            }
        }
        let child = self.child.lock().expect("child lock").take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
        self.shared.alive.store(false, Ordering::SeqCst);
    }
}

type GateKey = (String, String);

/// Per-(host, fingerprint) gate singletons, created on first dispatch and
/// kept warm until context exit.
pub struct GateManager {
    local: Arc<dyn GateLauncher>,
    ssh: Arc<dyn GateLauncher>,
    gates: tokio::sync::Mutex<HashMap<GateKey, Arc<Gate>>>,
    launching: tokio::sync::Mutex<HashMap<GateKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl GateManager {
    pub fn new(local: Arc<dyn GateLauncher>, ssh: Arc<dyn GateLauncher>) -> Self {
        Self {
            local,
            ssh,
            gates: tokio::sync::Mutex::new(HashMap::new()),
            launching: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the healthy gate for `(host, bundle)`, staging and
    /// launching one when absent or dead. The relaunch after a transport
    /// loss happens here, on the next call that needs the gate.
    pub async fn ensure(
        &self,
        host: &Host,
        bundle: &Bundle,
        interpreter: &str,
    ) -> Result<Arc<Gate>> {
        let key = (host.name.clone(), bundle.fingerprint.clone());

        // Serialize launches per key without holding the whole map across
        // an SSH round trip.
        let key_lock = {
            let mut launching = self.launching.lock().await;
            Arc::clone(
                launching
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = key_lock.lock().await;

        if let Some(gate) = self.gates.lock().await.get(&key) {
            if gate.is_alive() {
                return Ok(Arc::clone(gate));
            }
        }

        let launcher = if host.is_local() {
            &self.local
        } else {
            &self.ssh
        };
        launcher.stage(host, bundle).await?;
        let channel = launcher.launch(host, &bundle.fingerprint, interpreter).await?;
        let gate = Gate::start(&host.name, &bundle.fingerprint, channel).await?;
        self.gates.lock().await.insert(key, Arc::clone(&gate));
        Ok(gate)
    }

    /// Graceful shutdown of every live gate. Errors are logged, never
    /// propagated: teardown must not mask the primary exit reason.
    pub async fn shutdown_all(&self) {
        let gates: Vec<Arc<Gate>> = self.gates.lock().await.drain().map(|(_, g)| g).collect();
        for gate in gates {
            gate.shutdown().await;
        }
    }
}
