//! Content deployment module.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use super::{required_str, ModuleOutput, NativeModule, ParamDoc};
use crate::events::EventSink;

/// Copies a source file or literal `content` to `dest`. Compares bytes
/// first so an unchanged destination reports `changed: false`.
pub struct CopyModule;

#[async_trait]
impl NativeModule for CopyModule {
    fn fqcn(&self) -> &'static str {
        "copy"
    }

    fn params(&self) -> &'static [ParamDoc] {
        &[
            ParamDoc {
                name: "dest",
                required: true,
                type_name: "path",
                doc: "destination path",
            },
            ParamDoc {
                name: "src",
                required: false,
                type_name: "path",
                doc: "source file (mutually exclusive with content)",
            },
            ParamDoc {
                name: "content",
                required: false,
                type_name: "str",
                doc: "literal file content (mutually exclusive with src)",
            },
        ]
    }

    fn docs(&self) -> &'static str {
        "Place a file at a destination, only rewriting when bytes differ."
    }

    async fn run(&self, params: &Value, check_mode: bool, events: &EventSink) -> ModuleOutput {
        let dest = match required_str(params, "dest") {
            Ok(d) => d,
            Err(msg) => return ModuleOutput::failed(msg),
        };
        let src = params.get("src").and_then(Value::as_str);
        let content = params.get("content").and_then(Value::as_str);

        let bytes = match (src, content) {
            (Some(_), Some(_)) => {
                return ModuleOutput::failed("src and content are mutually exclusive")
            }
            (None, None) => return ModuleOutput::failed("one of src or content is required"),
            (Some(src), None) => match tokio::fs::read(src).await {
                Ok(bytes) => bytes,
                Err(e) => return ModuleOutput::failed(format!("cannot read {src}: {e}")),
            },
            (None, Some(content)) => content.as_bytes().to_vec(),
        };

        let dest_path = Path::new(dest);
        let current = tokio::fs::read(dest_path).await.ok();
        if current.as_deref() == Some(bytes.as_slice()) {
            return ModuleOutput::ok(false, serde_json::json!({"dest": dest}));
        }

        if !check_mode {
            if let Some(parent) = dest_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ModuleOutput::failed(format!("cannot create {}: {e}", parent.display()));
                }
            }
            if let Err(e) = tokio::fs::write(dest_path, &bytes).await {
                return ModuleOutput::failed(format!("cannot write {dest}: {e}"));
            }
        }
        events.progress(Some(100.0), format!("wrote {} bytes", bytes.len()));
        ModuleOutput::ok(
            true,
            serde_json::json!({"dest": dest, "size": bytes.len()}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    async fn run(params: Value, check_mode: bool) -> ModuleOutput {
        let bus = EventBus::start(None);
        let out = CopyModule
            .run(&params, check_mode, &bus.sink("h", "copy"))
            .await;
        bus.close().await;
        out
    }

    #[tokio::test]
    async fn content_write_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.conf");
        let params = serde_json::json!({"dest": dest, "content": "port = 8080\n"});

        let first = run(params.clone(), false).await;
        assert!(first.success && first.changed);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "port = 8080\n");

        let second = run(params, false).await;
        assert!(second.success && !second.changed);
    }

    #[tokio::test]
    async fn src_copy_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("nested/dest.bin");
        std::fs::write(&src, b"payload").unwrap();

        let out = run(serde_json::json!({"src": src, "dest": dest}), false).await;
        assert!(out.success && out.changed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn check_mode_reports_change_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dry.conf");
        let out = run(serde_json::json!({"dest": dest, "content": "x"}), true).await;
        assert!(out.success && out.changed);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn src_and_content_conflict() {
        let out = run(
            serde_json::json!({"dest": "/tmp/x", "src": "/tmp/a", "content": "b"}),
            false,
        )
        .await;
        assert!(!out.success);
    }
}
