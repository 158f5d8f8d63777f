//! Native fast-path modules.
//!
//! These run in the controller's process, skipping bundling and transport
//! entirely. They must not be able to crash the controller: dispatch goes
//! through [`run_supervised`], which spawns the module on its own task,
//! converts a panic into a failed result, and enforces the per-call
//! deadline.
//!
//! Module I/O contract: params in as one JSON object, output out as one
//! JSON object plus a `(success, changed)` pair. Events stream through the
//! call's [`EventSink`].

mod command;
mod copy;
mod file;
mod ping;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::events::EventSink;

pub use command::{CommandModule, ShellModule};
pub use copy::CopyModule;
pub use file::FileModule;
pub use ping::PingModule;

/// Parameter shape documentation, surfaced by the registry's `describe`.
#[derive(Clone, Copy, Debug)]
pub struct ParamDoc {
    pub name: &'static str,
    pub required: bool,
    pub type_name: &'static str,
    pub doc: &'static str,
}

/// Result of one module invocation.
#[derive(Clone, Debug)]
pub struct ModuleOutput {
    pub success: bool,
    pub changed: bool,
    pub output: Value,
}

impl ModuleOutput {
    pub fn ok(changed: bool, output: Value) -> Self {
        Self {
            success: true,
            changed,
            output,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            success: false,
            changed: false,
            output: serde_json::json!({"failed": true, "msg": msg}),
        }
    }
}

/// A module executable in the controller's process.
#[async_trait]
pub trait NativeModule: Send + Sync {
    fn fqcn(&self) -> &'static str;
    fn params(&self) -> &'static [ParamDoc];
    fn docs(&self) -> &'static str;
    async fn run(&self, params: &Value, check_mode: bool, events: &EventSink) -> ModuleOutput;
}

/// The built-in native module table.
pub fn builtin_modules() -> Vec<Arc<dyn NativeModule>> {
    vec![
        Arc::new(PingModule),
        Arc::new(FileModule),
        Arc::new(CopyModule),
        Arc::new(CommandModule),
        Arc::new(ShellModule),
    ]
}

/// Runs a native module inside a supervised boundary: its own task, panic
/// capture, and a deadline. A panic becomes a failed output rather than a
/// controller crash; a deadline overrun aborts the task and surfaces
/// `Timeout`.
pub async fn run_supervised(
    module: Arc<dyn NativeModule>,
    params: Value,
    check_mode: bool,
    events: EventSink,
    deadline: Duration,
) -> Result<ModuleOutput> {
    let name = module.fqcn();
    let handle =
        tokio::spawn(async move { module.run(&params, check_mode, &events).await });
    let aborter = handle.abort_handle();

    match tokio::time::timeout(deadline, handle).await {
        Err(_) => {
            aborter.abort();
            Err(EngineError::Timeout)
        }
        Ok(Ok(output)) => Ok(output),
        Ok(Err(join_err)) if join_err.is_panic() => {
            tracing::error!(module = name, "native module panicked");
            Ok(ModuleOutput::failed(format!("module {name} panicked")))
        }
        Ok(Err(_)) => Err(EngineError::Cancelled),
    }
}

pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required parameter '{key}'"))
}
