//! Automation context: the controller API surface.
//!
//! Scoped acquisition around a run: [`AutomationContext::enter`] performs
//! every context-entry step (inventory load + dynamic-host merge, secret
//! resolution fail-closed, policy load, prior-audit load for replay) and
//! [`AutomationContext::close`] guarantees gate shutdown and state/audit
//! flush on the way out. Teardown failures are logged, never allowed to
//! mask the primary outcome of the run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::audit::{AuditLog, ExecutionRecord, ReplayCursor};
use crate::bundle::BundleBuilder;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventCallback};
use crate::executor::Executor;
use crate::fanout::FanOut;
pub use crate::fanout::{CallReport, HostCallResult};
use crate::gate::GateManager;
use crate::inventory::{Host, Inventory, Selector};
use crate::policy::Policy;
use crate::registry::ModuleRegistry;
use crate::secrets::{HttpKvBackend, KvBackend, SecretResolver, SecretSpec};
use crate::state::StateStore;
use crate::transport::{GateLauncher, LocalLauncher, SshLauncher};

/// Everything configurable about a context, builder style.
#[derive(Default)]
pub struct AutomationOptions {
    inventory: Option<PathBuf>,
    module_dirs: Vec<PathBuf>,
    collection_root: Option<PathBuf>,
    state_file: Option<PathBuf>,
    policy_file: Option<PathBuf>,
    policy: Option<Policy>,
    environment: String,
    secrets: SecretSpec,
    kv_backend: Option<Arc<dyn KvBackend>>,
    record: Option<PathBuf>,
    replay: Option<PathBuf>,
    fail_fast: bool,
    check_mode: bool,
    max_parallel_hosts: Option<usize>,
    call_timeout: Option<Duration>,
    cache_dir: Option<PathBuf>,
    on_event: Option<EventCallback>,
    gate_launcher: Option<Arc<dyn GateLauncher>>,
}

impl AutomationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inventory(mut self, path: impl Into<PathBuf>) -> Self {
        self.inventory = Some(path.into());
        self
    }

    pub fn module_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_dirs.push(path.into());
        self
    }

    pub fn collection_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.collection_root = Some(path.into());
        self
    }

    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_file = Some(path.into());
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn environment(mut self, label: impl Into<String>) -> Self {
        self.environment = label.into();
        self
    }

    pub fn secrets(mut self, spec: SecretSpec) -> Self {
        self.secrets = spec;
        self
    }

    pub fn kv_backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.kv_backend = Some(backend);
        self
    }

    /// Record an audit trail to this path.
    pub fn record(mut self, path: impl Into<PathBuf>) -> Self {
        self.record = Some(path.into());
        self
    }

    /// Replay a prior run's audit trail from this path.
    pub fn replay(mut self, path: impl Into<PathBuf>) -> Self {
        self.replay = Some(path.into());
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn check_mode(mut self, enabled: bool) -> Self {
        self.check_mode = enabled;
        self
    }

    pub fn max_parallel_hosts(mut self, n: usize) -> Self {
        self.max_parallel_hosts = Some(n);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    pub fn on_event(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Replaces both gate launchers; used by tests to script gates.
    pub fn gate_launcher(mut self, launcher: Arc<dyn GateLauncher>) -> Self {
        self.gate_launcher = Some(launcher);
        self
    }
}

/// One captured per-host failure, kept for `errors()`.
#[derive(Clone, Debug)]
pub struct CallError {
    pub host: String,
    pub module: String,
    pub error: String,
}

pub struct AutomationContext {
    inventory: RwLock<Inventory>,
    state: Option<Arc<StateStore>>,
    secrets: Arc<SecretResolver>,
    audit: Arc<AuditLog>,
    events: Mutex<Option<EventBus>>,
    fanout: FanOut,
    gates: Arc<GateManager>,
    fail_fast: bool,
    errors: Mutex<Vec<CallError>>,
    closed: AtomicBool,
}

impl AutomationContext {
    /// Performs all context-entry work. Fatal errors here (malformed
    /// inventory or state, unresolved secrets, malformed replay audit)
    /// abort before any module can run.
    pub async fn enter(options: AutomationOptions) -> Result<AutomationContext> {
        let mut config = EngineConfig::default();
        if let Some(n) = options.max_parallel_hosts {
            config.max_parallel_hosts = n;
        }
        if let Some(timeout) = options.call_timeout {
            config.call_timeout = timeout;
        }
        if let Some(dir) = options.cache_dir {
            config.cache_dir = dir;
        }
        config.environment = options.environment.clone();

        let mut inventory = match &options.inventory {
            Some(path) => Inventory::load(path).await?,
            None => Inventory::localhost(),
        };

        let state = match &options.state_file {
            Some(path) => Some(Arc::new(StateStore::load(path)?)),
            None => None,
        };
        if let Some(store) = &state {
            // Dynamic hosts from prior runs rejoin the inventory.
            for (name, attrs) in store.snapshot().hosts {
                inventory.add_host(&name, &attrs)?;
            }
        }

        let kv_backend: Option<Arc<dyn KvBackend>> = if options.secrets.kv.is_empty() {
            options.kv_backend
        } else {
            match options.kv_backend {
                Some(backend) => Some(backend),
                None => Some(Arc::new(HttpKvBackend::from_env()?)),
            }
        };
        let secrets = Arc::new(
            SecretResolver::resolve(&options.secrets, kv_backend.as_deref()).await?,
        );

        let policy = match (&options.policy, &options.policy_file) {
            (Some(policy), _) => policy.clone(),
            (None, Some(path)) => Policy::from_file(path)?,
            (None, None) => Policy::empty(),
        };

        let replay = match &options.replay {
            Some(path) => ReplayCursor::new(AuditLog::load_prior(path)?),
            None => ReplayCursor::disengaged(),
        };

        let audit = Arc::new(AuditLog::new(options.record.clone()));
        let events = EventBus::start(options.on_event);

        let registry = Arc::new(ModuleRegistry::new(
            options.module_dirs.clone(),
            options.collection_root.clone(),
        ));
        let bundles = Arc::new(BundleBuilder::new(
            registry.search_paths(),
            config.cache_dir.clone(),
        ));
        let gates = Arc::new(match options.gate_launcher {
            Some(launcher) => GateManager::new(Arc::clone(&launcher), launcher),
            None => GateManager::new(
                Arc::new(LocalLauncher::new(config.cache_dir.join("gates"))),
                Arc::new(SshLauncher::new(config.remote_cache_dir.clone())),
            ),
        });

        let executor = Arc::new(Executor {
            registry,
            policy: Arc::new(policy),
            secrets: Arc::clone(&secrets),
            audit: Arc::clone(&audit),
            replay: Arc::new(Mutex::new(replay)),
            bundles,
            gates: Arc::clone(&gates),
            events: events.handle(),
            config: config.clone(),
            check_mode: options.check_mode,
        });
        let fanout = FanOut::new(executor, Arc::clone(&audit), config.max_parallel_hosts);

        Ok(AutomationContext {
            inventory: RwLock::new(inventory),
            state,
            secrets,
            audit,
            events: Mutex::new(Some(events)),
            fanout,
            gates,
            fail_fast: options.fail_fast,
            errors: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Executes `module` on every host the selector matches. Under
    /// fail-fast the first per-host error cancels the rest and is raised
    /// here; otherwise all hosts are attempted and failures land in
    /// `errors()`.
    pub async fn call(
        &self,
        selector: impl Into<Selector>,
        module: &str,
        params: Value,
    ) -> Result<CallReport> {
        let hosts = self.inventory.read().expect("inventory lock").hosts(&selector.into())?;
        let mut report = self.fanout.run(hosts, module, params, self.fail_fast).await;

        {
            let mut errors = self.errors.lock().expect("errors lock");
            for result in &report.results {
                if result.is_failure() {
                    let error = match &result.outcome {
                        Ok(outcome) => outcome
                            .error
                            .clone()
                            .or_else(|| {
                                outcome
                                    .output
                                    .get("msg")
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                            })
                            .unwrap_or_else(|| "module reported failure".to_string()),
                        Err(e) => e.to_string(),
                    };
                    errors.push(CallError {
                        host: result.host.clone(),
                        module: module.to_string(),
                        error,
                    });
                }
            }
        }

        if let Err(e) = self.audit.flush() {
            tracing::warn!(error = %e, "audit flush after call failed");
        }

        if self.fail_fast {
            if let Some(e) = report.take_first_error() {
                return Err(e);
            }
        }
        Ok(report)
    }

    /// A handle scoped to one selector, so scripts can write
    /// `ftl.group("web").call("file", params)`. Sugar over [`Self::call`].
    pub fn group(&self, selector: impl Into<Selector>) -> GroupHandle<'_> {
        GroupHandle {
            context: self,
            selector: selector.into(),
        }
    }

    /// Single-host convenience for inventory-less scripts: runs on
    /// `localhost` and returns the module output.
    pub async fn call_local(&self, module: &str, params: Value) -> Result<Value> {
        let mut report = self.call("localhost", module, params).await?;
        if let Some(e) = report.take_first_error() {
            return Err(e);
        }
        Ok(report.first_output().cloned().unwrap_or(Value::Null))
    }

    /// All hosts currently known, in declaration order.
    pub fn hosts(&self) -> Vec<Host> {
        self.inventory.read().expect("inventory lock").all_hosts()
    }

    pub fn groups(&self) -> Vec<String> {
        self.inventory.read().expect("inventory lock").group_names()
    }

    /// Provisions a host dynamically. The host is visible to the next
    /// call immediately and persisted to the state store before this
    /// returns, so a later crash cannot lose it.
    pub fn add_host(&self, name: &str, attrs: &BTreeMap<String, Value>) -> Result<Host> {
        let host = self
            .inventory
            .write()
            .expect("inventory lock")
            .add_host(name, attrs)?;
        if let Some(store) = &self.state {
            store.put_host(name, host.to_attrs());
            store.flush()?;
        }
        Ok(host)
    }

    /// User key-value state, persisted with the snapshot.
    pub fn state_put(&self, key: &str, value: Value) -> Result<()> {
        let store = self.state.as_ref().ok_or_else(|| {
            EngineError::StateInvalid("no state file configured".into())
        })?;
        store.put_var(key, value);
        Ok(())
    }

    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.state.as_ref()?.get_var(key)
    }

    pub fn secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).map(str::to_string)
    }

    /// Every execution record emitted so far, in audit order.
    pub fn results(&self) -> Vec<ExecutionRecord> {
        self.audit.records()
    }

    pub fn failed(&self) -> bool {
        !self.errors.lock().expect("errors lock").is_empty()
    }

    pub fn errors(&self) -> Vec<CallError> {
        self.errors.lock().expect("errors lock").clone()
    }

    /// Graceful teardown: gate shutdown, audit flush, state flush, event
    /// drain. Idempotent. The first flush error is returned once all
    /// teardown steps have run.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.gates.shutdown_all().await;

        let mut first_error = None;
        if let Err(e) = self.audit.flush() {
            tracing::error!(error = %e, "audit flush on close failed");
            first_error = Some(e);
        }
        if let Some(store) = &self.state {
            if let Err(e) = store.flush() {
                tracing::error!(error = %e, "state flush on close failed");
                first_error = first_error.or(Some(e));
            }
        }
        let events = self.events.lock().expect("events lock").take();
        if let Some(events) = events {
            events.close().await;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Selector-scoped view of a context.
pub struct GroupHandle<'a> {
    context: &'a AutomationContext,
    selector: Selector,
}

impl GroupHandle<'_> {
    pub async fn call(&self, module: &str, params: Value) -> Result<CallReport> {
        self.context
            .call(self.selector.clone(), module, params)
            .await
    }

    pub fn hosts(&self) -> Result<Vec<Host>> {
        self.context
            .inventory
            .read()
            .expect("inventory lock")
            .hosts(&self.selector)
    }
}

impl Drop for AutomationContext {
    fn drop(&mut self) {
        // Best-effort flush when close() was skipped; gate processes are
        // reaped by kill_on_drop.
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.audit.flush() {
                tracing::warn!(error = %e, "audit flush on drop failed");
            }
        }
    }
}
