//! Fan-out driver: one logical call, N per-host executions.
//!
//! Hosts run concurrently under a semaphore capped at
//! `max_parallel_hosts`. Audit slots are reserved in selector order before
//! anything runs, so record order always equals emission order no matter
//! which host finishes first. Under fail-fast, the first per-host failure
//! cancels the rest cooperatively: not-yet-started calls are skipped,
//! in-flight remote calls drain for at most `cancel_grace`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::error::{EngineError, Result};
use crate::executor::{CallOutcome, Executor};
use crate::inventory::Host;

/// One host's slot in the aggregate result, in selector order.
#[derive(Debug)]
pub struct HostCallResult {
    pub host: String,
    pub outcome: Result<CallOutcome>,
}

impl HostCallResult {
    pub fn is_failure(&self) -> bool {
        match &self.outcome {
            Ok(outcome) => !outcome.success,
            Err(_) => true,
        }
    }
}

/// Aggregate of one fan-out call.
#[derive(Debug)]
pub struct CallReport {
    pub module: String,
    pub results: Vec<HostCallResult>,
}

impl CallReport {
    pub fn successful(&self) -> usize {
        self.results.len() - self.failed()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Output of the first host, for single-host ergonomics.
    pub fn first_output(&self) -> Option<&Value> {
        self.results.first().and_then(|r| match &r.outcome {
            Ok(outcome) => Some(&outcome.output),
            Err(_) => None,
        })
    }

    /// Removes and returns the first failure in selector order as an
    /// engine error, for fail-fast escalation.
    pub fn take_first_error(&mut self) -> Option<EngineError> {
        let index = self.results.iter().position(|r| r.is_failure())?;
        let result = self.results.remove(index);
        let host = result.host;
        Some(match result.outcome {
            Err(e) => e,
            Ok(outcome) => {
                let mut output = outcome.output;
                if let Some(map) = output.as_object_mut() {
                    map.entry("host".to_string())
                        .or_insert(Value::String(host));
                }
                EngineError::ModuleFailed(output)
            }
        })
    }
}

pub struct FanOut {
    executor: Arc<Executor>,
    audit: Arc<AuditLog>,
    max_parallel_hosts: usize,
}

impl FanOut {
    pub fn new(executor: Arc<Executor>, audit: Arc<AuditLog>, max_parallel_hosts: usize) -> Self {
        Self {
            executor,
            audit,
            max_parallel_hosts: max_parallel_hosts.max(1),
        }
    }

    /// Executes `module` on every host, aggregating per-host outcomes in
    /// the order the hosts were given.
    pub async fn run(
        &self,
        hosts: Vec<Host>,
        module: &str,
        params: Value,
        fail_fast: bool,
    ) -> CallReport {
        // Reserve every slot up front, in selector order.
        let slots: Vec<_> = hosts.iter().map(|_| self.audit.reserve()).collect();

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_hosts));
        let cancel = CancellationToken::new();

        let mut handles = Vec::with_capacity(hosts.len());
        for (host, slot) in hosts.into_iter().zip(slots) {
            let executor = Arc::clone(&self.executor);
            let audit = Arc::clone(&self.audit);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let module = module.to_string();
            let params = params.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.expect("semaphore open"),
                    _ = cancel.cancelled() => {
                        audit.skip(slot);
                        return HostCallResult {
                            host: host.name,
                            outcome: Err(EngineError::Cancelled),
                        };
                    }
                };
                let outcome = executor
                    .execute(&host, &module, params, slot, &cancel)
                    .await;
                drop(permit);

                let result = HostCallResult {
                    host: host.name,
                    outcome,
                };
                if fail_fast && result.is_failure() {
                    cancel.cancel();
                }
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "per-host task aborted");
                    results.push(HostCallResult {
                        host: String::new(),
                        outcome: Err(EngineError::Cancelled),
                    });
                }
            }
        }

        CallReport {
            module: module.to_string(),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ReplayCursor;
    use crate::bundle::BundleBuilder;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::gate::GateManager;
    use crate::policy::Policy;
    use crate::registry::ModuleRegistry;
    use crate::secrets::SecretResolver;
    use crate::transport::LocalLauncher;
    use std::sync::Mutex;
    use std::time::Duration;

    fn harness(bus: &EventBus, audit: Arc<AuditLog>, max_parallel: usize) -> FanOut {
        let cache = std::env::temp_dir().join(format!("ftl2-fanout-test-{}", std::process::id()));
        let launcher = Arc::new(LocalLauncher::new(cache.clone()));
        let executor = Arc::new(Executor {
            registry: Arc::new(ModuleRegistry::new(Vec::new(), None)),
            policy: Arc::new(Policy::empty()),
            secrets: Arc::new(SecretResolver::empty()),
            audit: Arc::clone(&audit),
            replay: Arc::new(Mutex::new(ReplayCursor::disengaged())),
            bundles: Arc::new(BundleBuilder::new(Vec::new(), cache)),
            gates: Arc::new(GateManager::new(launcher.clone(), launcher)),
            events: bus.handle(),
            config: EngineConfig {
                cancel_grace: Duration::from_millis(200),
                ..EngineConfig::default()
            },
            check_mode: false,
        });
        FanOut::new(executor, audit, max_parallel)
    }

    fn local_hosts(names: &[&str]) -> Vec<Host> {
        names
            .iter()
            .map(|name| {
                let mut host = Host::localhost();
                host.name = name.to_string();
                host
            })
            .collect()
    }

    #[tokio::test]
    async fn results_and_records_follow_selector_order() {
        let bus = EventBus::start(None);
        let audit = Arc::new(AuditLog::new(None));
        let fanout = harness(&bus, Arc::clone(&audit), 10);

        let hosts = local_hosts(&["web01", "web02", "web03"]);
        let report = fanout
            .run(hosts, "file", serde_json::json!({"path": "/tmp/ftl2-fanout-order", "state": "touch"}), false)
            .await;
        assert!(report.is_success());
        let record_hosts: Vec<_> = audit.records().iter().map(|r| r.host.clone()).collect();
        assert_eq!(record_hosts, ["web01", "web02", "web03"]);
        let result_hosts: Vec<_> = report.results.iter().map(|r| r.host.clone()).collect();
        assert_eq!(result_hosts, ["web01", "web02", "web03"]);
        let _ = std::fs::remove_file("/tmp/ftl2-fanout-order");
        bus.close().await;
    }

    #[tokio::test]
    async fn without_fail_fast_all_hosts_attempt() {
        let bus = EventBus::start(None);
        let audit = Arc::new(AuditLog::new(None));
        let fanout = harness(&bus, Arc::clone(&audit), 1);

        let hosts = local_hosts(&["a", "b", "c"]);
        let report = fanout
            .run(
                hosts,
                "ping",
                serde_json::json!({"data": "crash"}),
                false,
            )
            .await;
        assert_eq!(report.failed(), 3);
        assert_eq!(report.results.len(), 3);
        // Every host produced a real (failed) record.
        assert_eq!(audit.records().len(), 3);
        bus.close().await;
    }

    #[tokio::test]
    async fn fail_fast_cancels_pending_hosts() {
        let bus = EventBus::start(None);
        let audit = Arc::new(AuditLog::new(None));
        // Width 1 so the failing first host is done before others start.
        let fanout = harness(&bus, Arc::clone(&audit), 1);

        let hosts = local_hosts(&["first", "second", "third", "fourth"]);
        let started = tokio::time::Instant::now();
        let report = fanout
            .run(hosts, "ping", serde_json::json!({"data": "crash"}), true)
            .await;
        assert!(started.elapsed() < Duration::from_secs(5), "cancellation must be prompt");

        assert!(report.results[0].is_failure());
        let cancelled = report
            .results
            .iter()
            .filter(|r| matches!(r.outcome, Err(EngineError::Cancelled)))
            .count();
        assert!(cancelled >= 1, "pending hosts must be cancelled, got {report:?}");
        // Cancelled hosts leave no audit record.
        assert!(audit.records().len() < 4);
        bus.close().await;
    }

    #[tokio::test]
    async fn take_first_error_prefers_selector_order() {
        let bus = EventBus::start(None);
        let audit = Arc::new(AuditLog::new(None));
        let fanout = harness(&bus, Arc::clone(&audit), 10);

        let hosts = local_hosts(&["h1", "h2"]);
        let mut report = fanout
            .run(hosts, "ping", serde_json::json!({"data": "crash"}), false)
            .await;
        let err = report.take_first_error().unwrap();
        assert!(matches!(err, EngineError::ModuleFailed(_)));
        bus.close().await;
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_semaphore() {
        let bus = EventBus::start(None);
        let audit = Arc::new(AuditLog::new(None));
        let fanout = harness(&bus, Arc::clone(&audit), 2);

        let hosts = local_hosts(&["a", "b", "c", "d"]);
        let started = tokio::time::Instant::now();
        let report = fanout
            .run(
                hosts,
                "shell",
                serde_json::json!({"cmd": "sleep 0.15"}),
                false,
            )
            .await;
        assert!(report.is_success());
        // 4 hosts at width 2 with 150ms sleeps: at least two waves.
        assert!(started.elapsed() >= Duration::from_millis(280));
        bus.close().await;
    }
}
