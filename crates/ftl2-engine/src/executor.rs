//! Per-call execution pipeline.
//!
//! Every `(host, module, params)` call walks the same gauntlet, in order:
//! replay check, policy gate, secret injection, dispatch, audit record.
//! Policy sees pre-injection parameters, so decisions never observe secret
//! values, and the audit record always stores the redacted form of what
//! the user originally passed.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, ExecutionRecord, ReplayCursor, Slot};
use crate::bundle::{BundleBuilder, TargetProfile};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EventsHandle;
use crate::gate::GateManager;
use crate::inventory::Host;
use crate::modules::run_supervised;
use crate::policy::{Decision, Policy};
use crate::registry::{ModuleKind, ModuleRegistry};
use crate::secrets::SecretResolver;

/// The per-host result of one call.
#[derive(Clone, Debug)]
pub struct CallOutcome {
    pub host: String,
    pub module: String,
    pub success: bool,
    pub changed: bool,
    pub output: Value,
    pub error: Option<String>,
    pub replayed: bool,
    pub duration_s: f64,
}

pub struct Executor {
    pub registry: Arc<ModuleRegistry>,
    pub policy: Arc<Policy>,
    pub secrets: Arc<SecretResolver>,
    pub audit: Arc<AuditLog>,
    pub replay: Arc<Mutex<ReplayCursor>>,
    pub bundles: Arc<BundleBuilder>,
    pub gates: Arc<GateManager>,
    pub events: EventsHandle,
    pub config: EngineConfig,
    pub check_mode: bool,
}

impl Executor {
    /// Runs the full pipeline for one host. The audit slot was reserved by
    /// the fan-out driver at emission time; calls that never execute
    /// (deny, cancellation, resolution failure) release it instead of
    /// writing a record.
    pub async fn execute(
        &self,
        host: &Host,
        module: &str,
        params: Value,
        slot: Slot,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome> {
        if cancel.is_cancelled() {
            self.audit.skip(slot);
            return Err(EngineError::Cancelled);
        }

        let original_params = params.clone();
        let sink = self.events.sink(&host.name, module);

        // Replay short-circuits everything else: the prior run already did
        // the work, so no module executes and the record is zero-duration.
        let replayed = {
            let mut cursor = self.replay.lock().expect("replay lock");
            cursor.try_replay(module, &host.name)
        };
        if let Some(prior) = replayed {
            sink.module_complete(true, prior.changed, 0.0, true);
            self.audit.fill(
                slot,
                ExecutionRecord {
                    timestamp: Utc::now(),
                    host: host.name.clone(),
                    module: module.to_string(),
                    params: self.secrets.redact(&original_params, module),
                    success: true,
                    changed: prior.changed,
                    output: prior.output.clone(),
                    duration_s: 0.0,
                    replayed: true,
                },
            );
            return Ok(CallOutcome {
                host: host.name.clone(),
                module: module.to_string(),
                success: true,
                changed: prior.changed,
                output: prior.output,
                error: None,
                replayed: true,
                duration_s: 0.0,
            });
        }

        if let Decision::Deny(reason) =
            self.policy
                .evaluate(module, &host.name, &self.config.environment, &params)
        {
            self.audit.skip(slot);
            return Err(EngineError::PolicyDenied(reason));
        }

        // Injected secrets never override explicit user parameters.
        let mut merged = params;
        let injected = self.secrets.bindings_for(module);
        if !injected.is_empty() {
            if merged.is_null() {
                merged = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = merged.as_object_mut() {
                for (param, value) in injected {
                    map.entry(param).or_insert(Value::String(value));
                }
            }
        }

        let descriptor = match self.registry.resolve(module) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.audit.skip(slot);
                return Err(e);
            }
        };

        sink.module_start();
        let started = Instant::now();
        let dispatched = match &descriptor.kind {
            ModuleKind::Native(native) => {
                let supervised = run_supervised(
                    Arc::clone(native),
                    merged,
                    self.check_mode,
                    sink.clone(),
                    self.config.call_timeout,
                );
                tokio::select! {
                    outcome = supervised => outcome.map(|o| (o.success, o.changed, o.output, None)),
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
            ModuleKind::Bundled(_) => {
                self.dispatch_remote(host, &descriptor.fqcn, merged, &sink, cancel)
                    .await
            }
        };
        let duration_s = started.elapsed().as_secs_f64();

        match dispatched {
            Ok((success, changed, output, error)) => {
                sink.module_complete(success, changed, duration_s, false);
                self.audit.fill(
                    slot,
                    ExecutionRecord {
                        timestamp: Utc::now(),
                        host: host.name.clone(),
                        module: module.to_string(),
                        params: self.secrets.redact(&original_params, module),
                        success,
                        changed,
                        output: output.clone(),
                        duration_s,
                        replayed: false,
                    },
                );
                Ok(CallOutcome {
                    host: host.name.clone(),
                    module: module.to_string(),
                    success,
                    changed,
                    output,
                    error,
                    replayed: false,
                    duration_s,
                })
            }
            Err(e) => {
                sink.module_complete(false, false, duration_s, false);
                self.audit.skip(slot);
                Err(e)
            }
        }
    }

    async fn dispatch_remote(
        &self,
        host: &Host,
        fqcn: &str,
        params: Value,
        sink: &crate::events::EventSink,
        cancel: &CancellationToken,
    ) -> Result<(bool, bool, Value, Option<String>)> {
        let interpreter = host
            .vars
            .get("ansible_python_interpreter")
            .and_then(Value::as_str)
            .unwrap_or("python3")
            .to_string();
        let profile = TargetProfile {
            interpreter: interpreter.clone(),
            platform: "linux".into(),
        };
        let bundle = self.bundles.build(&[fqcn.to_string()], &profile).await?;
        let gate = self.gates.ensure(host, &bundle, &interpreter).await?;
        let reply = gate
            .execute(
                fqcn,
                params,
                self.check_mode,
                sink.clone(),
                self.config.call_timeout,
                cancel,
                self.config.cancel_grace,
            )
            .await?;
        Ok((reply.success, reply.changed, reply.output, reply.error))
    }
}
