//! Filesystem state module.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use super::{required_str, ModuleOutput, NativeModule, ParamDoc};
use crate::events::EventSink;

/// Ensures a path is in a desired state: `touch`, `directory`, `absent`,
/// or `file` (assert existence). Idempotent: `changed` reflects whether
/// anything was actually created or removed.
pub struct FileModule;

#[async_trait]
impl NativeModule for FileModule {
    fn fqcn(&self) -> &'static str {
        "file"
    }

    fn params(&self) -> &'static [ParamDoc] {
        &[
            ParamDoc {
                name: "path",
                required: true,
                type_name: "path",
                doc: "target path",
            },
            ParamDoc {
                name: "state",
                required: false,
                type_name: "str",
                doc: "touch | directory | absent | file (default touch)",
            },
        ]
    }

    fn docs(&self) -> &'static str {
        "Create, remove, or assert filesystem entries."
    }

    async fn run(&self, params: &Value, check_mode: bool, _events: &EventSink) -> ModuleOutput {
        let path_str = match required_str(params, "path") {
            Ok(p) => p,
            Err(msg) => return ModuleOutput::failed(msg),
        };
        let state = params
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("touch");
        let path = Path::new(path_str);
        let exists = path.exists();

        let result = match state {
            "touch" => {
                if exists {
                    Ok(false)
                } else if check_mode {
                    Ok(true)
                } else {
                    tokio::fs::write(path, b"").await.map(|_| true)
                }
            }
            "directory" => {
                if path.is_dir() {
                    Ok(false)
                } else if check_mode {
                    Ok(true)
                } else {
                    tokio::fs::create_dir_all(path).await.map(|_| true)
                }
            }
            "absent" => {
                if !exists {
                    Ok(false)
                } else if check_mode {
                    Ok(true)
                } else if path.is_dir() {
                    tokio::fs::remove_dir_all(path).await.map(|_| true)
                } else {
                    tokio::fs::remove_file(path).await.map(|_| true)
                }
            }
            "file" => {
                if path.is_file() {
                    Ok(false)
                } else {
                    return ModuleOutput::failed(format!("{path_str} is not an existing file"));
                }
            }
            other => return ModuleOutput::failed(format!("unknown state '{other}'")),
        };

        match result {
            Ok(changed) => ModuleOutput::ok(
                changed,
                serde_json::json!({"path": path_str, "state": state}),
            ),
            Err(e) => ModuleOutput::failed(format!("{path_str}: {e}")),
        }
    }
}
