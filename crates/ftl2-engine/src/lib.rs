//! FTL2 engine: declarative module execution across a fleet of hosts.
//!
//! A user program drives the engine through [`AutomationContext`]: name a
//! module, supply parameters, optionally scope to a host group, and the
//! engine performs the work on every matching host concurrently. Each call
//! flows through the same per-host pipeline: replay check, policy gate,
//! secret injection, dispatch (in-process for native modules, through a
//! remote gate for bundled ones), and audit recording.
//!
//! ```ignore
//! let options = AutomationOptions::new()
//!     .inventory("hosts.yml")
//!     .record(".ftl2-audit.json");
//! let ftl = AutomationContext::enter(options).await?;
//! ftl.call("web", "file", json!({"path": "/tmp/t", "state": "touch"})).await?;
//! ftl.close().await?;
//! ```

pub mod audit;
pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod fanout;
pub mod gate;
pub mod inventory;
pub mod modules;
pub mod policy;
pub mod registry;
pub mod secrets;
pub mod state;
pub mod transport;

pub use audit::{AuditLog, ExecutionRecord, ReplayCursor, Slot};
pub use bundle::{Bundle, BundleBuilder, ModuleMetadata, TargetProfile};
pub use config::EngineConfig;
pub use context::{AutomationContext, AutomationOptions, CallError, GroupHandle};
pub use error::{EngineError, Result};
pub use events::{Event, EventBus, EventCallback, EventSink, EventsHandle};
pub use executor::{CallOutcome, Executor};
pub use fanout::{CallReport, FanOut, HostCallResult};
pub use gate::{Gate, GateManager, ModuleReply};
pub use inventory::{Host, HostGroup, Inventory, Selector, Transport};
pub use modules::{ModuleOutput, NativeModule, ParamDoc};
pub use policy::{Decision, Policy, PolicyRule};
pub use registry::{ModuleDescriptor, ModuleDocs, ModuleKind, ModuleRegistry};
pub use secrets::{HttpKvBackend, KvBackend, SecretResolver, SecretSpec};
pub use state::{StateSnapshot, StateStore};
pub use transport::{GateChannel, GateLauncher, LocalLauncher, SshLauncher};
