//! In-process event bus.
//!
//! Everything observable about a run flows through here as structured
//! events: call lifecycle, progress, log lines, raw output streams.
//! Delivery is single-consumer: one task drains the channel and invokes
//! the user callback, so events arrive in channel order. Within one call
//! that order is the emission order; across concurrent calls there is no
//! ordering guarantee and consumers key on `host`.

use serde_json::Value;
use tokio::sync::mpsc;

use ftl2_protocol::EventKind;

/// A structured event delivered to the user callback.
#[derive(Clone, Debug)]
pub enum Event {
    ModuleStart {
        host: String,
        module: String,
    },
    ModuleComplete {
        host: String,
        module: String,
        success: bool,
        changed: bool,
        duration_s: f64,
        replayed: bool,
    },
    Progress {
        host: String,
        module: String,
        percent: Option<f64>,
        message: String,
        current: Option<u64>,
        total: Option<u64>,
        task_id: Option<String>,
    },
    Log {
        host: String,
        module: String,
        level: String,
        message: String,
    },
    Data {
        host: String,
        module: String,
        stream: String,
        bytes: String,
    },
}

impl Event {
    pub fn host(&self) -> &str {
        match self {
            Event::ModuleStart { host, .. }
            | Event::ModuleComplete { host, .. }
            | Event::Progress { host, .. }
            | Event::Log { host, .. }
            | Event::Data { host, .. } => host,
        }
    }
}

pub type EventCallback = Box<dyn FnMut(Event) + Send>;

/// Owns the channel and the single consumer task.
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    consumer: Option<tokio::task::JoinHandle<()>>,
}

impl EventBus {
    /// Starts the consumer task. With no callback, events are drained and
    /// dropped so emitters never block or error.
    pub fn start(callback: Option<EventCallback>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let consumer = tokio::spawn(async move {
            let mut callback = callback;
            while let Some(event) = rx.recv().await {
                if let Some(cb) = callback.as_mut() {
                    cb(event);
                }
            }
        });
        Self {
            tx,
            consumer: Some(consumer),
        }
    }

    /// A sink bound to one call's identity.
    pub fn sink(&self, host: &str, module: &str) -> EventSink {
        self.handle().sink(host, module)
    }

    /// A cloneable handle for components that outlive the borrow of the
    /// bus itself (the executor holds one).
    pub fn handle(&self) -> EventsHandle {
        EventsHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drops the sender side and waits for the consumer to drain.
    pub async fn close(mut self) {
        drop(self.tx);
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.await;
        }
    }
}

/// Cloneable sender side of the bus.
#[derive(Clone)]
pub struct EventsHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventsHandle {
    pub fn sink(&self, host: &str, module: &str) -> EventSink {
        EventSink {
            host: host.to_string(),
            module: module.to_string(),
            tx: self.tx.clone(),
        }
    }
}

/// Emits events on behalf of one (host, module) call.
#[derive(Clone)]
pub struct EventSink {
    host: String,
    module: String,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn module_start(&self) {
        let _ = self.tx.send(Event::ModuleStart {
            host: self.host.clone(),
            module: self.module.clone(),
        });
    }

    pub fn module_complete(&self, success: bool, changed: bool, duration_s: f64, replayed: bool) {
        let _ = self.tx.send(Event::ModuleComplete {
            host: self.host.clone(),
            module: self.module.clone(),
            success,
            changed,
            duration_s,
            replayed,
        });
    }

    pub fn progress(&self, percent: Option<f64>, message: impl Into<String>) {
        let _ = self.tx.send(Event::Progress {
            host: self.host.clone(),
            module: self.module.clone(),
            percent,
            message: message.into(),
            current: None,
            total: None,
            task_id: None,
        });
    }

    pub fn log(&self, level: impl Into<String>, message: impl Into<String>) {
        let _ = self.tx.send(Event::Log {
            host: self.host.clone(),
            module: self.module.clone(),
            level: level.into(),
            message: message.into(),
        });
    }

    pub fn data(&self, stream: impl Into<String>, bytes: impl Into<String>) {
        let _ = self.tx.send(Event::Data {
            host: self.host.clone(),
            module: self.module.clone(),
            stream: stream.into(),
            bytes: bytes.into(),
        });
    }

    /// Maps a gate event frame onto the bus.
    pub fn gate_event(&self, kind: EventKind, payload: &Value) {
        match kind {
            EventKind::Progress => {
                let _ = self.tx.send(Event::Progress {
                    host: self.host.clone(),
                    module: self.module.clone(),
                    percent: payload.get("percent").and_then(Value::as_f64),
                    message: payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    current: payload.get("current").and_then(Value::as_u64),
                    total: payload.get("total").and_then(Value::as_u64),
                    task_id: payload
                        .get("task_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            EventKind::Log => self.log(
                payload
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info"),
                payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            ),
            EventKind::Data => self.data(
                payload
                    .get("stream")
                    .and_then(Value::as_str)
                    .unwrap_or("stdout"),
                payload
                    .get("bytes")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_bus() -> (EventBus, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let bus = EventBus::start(Some(Box::new(move |event| {
            sink.lock().unwrap().push(event);
        })));
        (bus, seen)
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order_per_call() {
        let (bus, seen) = collecting_bus();
        let sink = bus.sink("web01", "file");
        sink.module_start();
        sink.progress(Some(50.0), "halfway");
        sink.module_complete(true, true, 0.1, false);
        bus.close().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0], Event::ModuleStart { .. }));
        assert!(matches!(seen[1], Event::Progress { .. }));
        assert!(matches!(seen[2], Event::ModuleComplete { .. }));
        assert_eq!(seen[0].host(), "web01");
    }

    #[tokio::test]
    async fn no_callback_drains_quietly() {
        let bus = EventBus::start(None);
        let sink = bus.sink("h", "m");
        sink.log("info", "noop");
        bus.close().await;
    }

    #[tokio::test]
    async fn gate_event_mapping() {
        let (bus, seen) = collecting_bus();
        let sink = bus.sink("h1", "deploy");
        sink.gate_event(
            EventKind::Progress,
            &serde_json::json!({"percent": 25.0, "message": "unpacking", "total": 4}),
        );
        sink.gate_event(
            EventKind::Data,
            &serde_json::json!({"stream": "stdout", "bytes": "line\n"}),
        );
        bus.close().await;

        let seen = seen.lock().unwrap();
        match &seen[0] {
            Event::Progress {
                percent,
                message,
                total,
                ..
            } => {
                assert_eq!(*percent, Some(25.0));
                assert_eq!(message, "unpacking");
                assert_eq!(*total, Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &seen[1] {
            Event::Data { stream, bytes, .. } => {
                assert_eq!(stream, "stdout");
                assert_eq!(bytes, "line\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
