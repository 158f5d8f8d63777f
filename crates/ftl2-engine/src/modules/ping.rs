//! Connectivity check module.

use async_trait::async_trait;
use serde_json::Value;

use super::{ModuleOutput, NativeModule, ParamDoc};
use crate::events::EventSink;

/// Echoes back `data` (default `pong`). Never reports changed.
pub struct PingModule;

#[async_trait]
impl NativeModule for PingModule {
    fn fqcn(&self) -> &'static str {
        "ping"
    }

    fn params(&self) -> &'static [ParamDoc] {
        &[ParamDoc {
            name: "data",
            required: false,
            type_name: "str",
            doc: "value to echo back; 'crash' forces a failure for testing",
        }]
    }

    fn docs(&self) -> &'static str {
        "Verify the execution path to a host without touching anything."
    }

    async fn run(&self, params: &Value, _check_mode: bool, _events: &EventSink) -> ModuleOutput {
        let data = params
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or("pong");
        if data == "crash" {
            return ModuleOutput::failed("ping was asked to crash");
        }
        ModuleOutput::ok(false, serde_json::json!({"ping": data}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[tokio::test]
    async fn default_pong() {
        let bus = EventBus::start(None);
        let out = PingModule
            .run(&serde_json::json!({}), false, &bus.sink("h", "ping"))
            .await;
        assert!(out.success);
        assert!(!out.changed);
        assert_eq!(out.output["ping"], "pong");
        bus.close().await;
    }

    #[tokio::test]
    async fn crash_data_fails() {
        let bus = EventBus::start(None);
        let out = PingModule
            .run(
                &serde_json::json!({"data": "crash"}),
                false,
                &bus.sink("h", "ping"),
            )
            .await;
        assert!(!out.success);
        bus.close().await;
    }
}
