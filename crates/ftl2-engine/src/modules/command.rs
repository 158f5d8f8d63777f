//! Process execution modules.
//!
//! `command` executes an argv directly; `shell` hands the line to
//! `/bin/sh -c`. Both stream captured output as `data` events and report
//! `changed: true` whenever they actually ran, following the convention
//! that arbitrary process execution cannot prove idempotence.

use async_trait::async_trait;
use serde_json::Value;

use super::{required_str, ModuleOutput, NativeModule, ParamDoc};
use crate::events::EventSink;

async fn run_process(
    program: &str,
    args: &[String],
    check_mode: bool,
    events: &EventSink,
) -> ModuleOutput {
    if check_mode {
        return ModuleOutput::ok(
            false,
            serde_json::json!({"skipped": true, "msg": "check mode: command not run"}),
        );
    }

    let output = match tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => return ModuleOutput::failed(format!("failed to start {program}: {e}")),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !stdout.is_empty() {
        events.data("stdout", stdout.clone());
    }
    if !stderr.is_empty() {
        events.data("stderr", stderr.clone());
    }

    let rc = output.status.code().unwrap_or(-1);
    let body = serde_json::json!({"rc": rc, "stdout": stdout, "stderr": stderr});
    if output.status.success() {
        ModuleOutput::ok(true, body)
    } else {
        ModuleOutput {
            success: false,
            changed: true,
            output: body,
        }
    }
}

/// Runs an argv without a shell. `cmd` is split on whitespace; use `argv`
/// for arguments that contain spaces.
pub struct CommandModule;

#[async_trait]
impl NativeModule for CommandModule {
    fn fqcn(&self) -> &'static str {
        "command"
    }

    fn params(&self) -> &'static [ParamDoc] {
        &[
            ParamDoc {
                name: "cmd",
                required: false,
                type_name: "str",
                doc: "command line, split on whitespace",
            },
            ParamDoc {
                name: "argv",
                required: false,
                type_name: "list[str]",
                doc: "explicit argv; takes precedence over cmd",
            },
        ]
    }

    fn docs(&self) -> &'static str {
        "Execute a program directly, without shell interpretation."
    }

    async fn run(&self, params: &Value, check_mode: bool, events: &EventSink) -> ModuleOutput {
        let argv: Vec<String> = match params.get("argv").and_then(Value::as_array) {
            Some(list) => {
                let mut argv = Vec::with_capacity(list.len());
                for item in list {
                    match item.as_str() {
                        Some(s) => argv.push(s.to_string()),
                        None => return ModuleOutput::failed("argv entries must be strings"),
                    }
                }
                argv
            }
            None => match required_str(params, "cmd") {
                Ok(cmd) => cmd.split_whitespace().map(str::to_string).collect(),
                Err(_) => return ModuleOutput::failed("one of cmd or argv is required"),
            },
        };
        let Some((program, args)) = argv.split_first() else {
            return ModuleOutput::failed("empty command");
        };
        run_process(program, args, check_mode, events).await
    }
}

/// Runs a command line through `/bin/sh -c`.
pub struct ShellModule;

#[async_trait]
impl NativeModule for ShellModule {
    fn fqcn(&self) -> &'static str {
        "shell"
    }

    fn params(&self) -> &'static [ParamDoc] {
        &[ParamDoc {
            name: "cmd",
            required: true,
            type_name: "str",
            doc: "command line, interpreted by /bin/sh",
        }]
    }

    fn docs(&self) -> &'static str {
        "Execute a command line through the shell (pipes, globs, redirection)."
    }

    async fn run(&self, params: &Value, check_mode: bool, events: &EventSink) -> ModuleOutput {
        let cmd = match required_str(params, "cmd") {
            Ok(cmd) => cmd.to_string(),
            Err(msg) => return ModuleOutput::failed(msg),
        };
        run_process("/bin/sh", &["-c".to_string(), cmd], check_mode, events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn command_captures_stdout_and_rc() {
        let bus = EventBus::start(None);
        let out = CommandModule
            .run(
                &serde_json::json!({"cmd": "echo hello"}),
                false,
                &bus.sink("h", "command"),
            )
            .await;
        bus.close().await;
        assert!(out.success && out.changed);
        assert_eq!(out.output["rc"], 0);
        assert_eq!(out.output["stdout"].as_str().unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_output() {
        let bus = EventBus::start(None);
        let out = ShellModule
            .run(
                &serde_json::json!({"cmd": "exit 3"}),
                false,
                &bus.sink("h", "shell"),
            )
            .await;
        bus.close().await;
        assert!(!out.success);
        assert_eq!(out.output["rc"], 3);
    }

    #[tokio::test]
    async fn shell_interprets_pipes() {
        let bus = EventBus::start(None);
        let out = ShellModule
            .run(
                &serde_json::json!({"cmd": "echo a-b-c | tr '-' ' '"}),
                false,
                &bus.sink("h", "shell"),
            )
            .await;
        bus.close().await;
        assert_eq!(out.output["stdout"].as_str().unwrap().trim(), "a b c");
    }

    #[tokio::test]
    async fn stdout_becomes_data_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_ref = Arc::clone(&seen);
        let bus = EventBus::start(Some(Box::new(move |e| sink_ref.lock().unwrap().push(e))));
        CommandModule
            .run(
                &serde_json::json!({"argv": ["echo", "streamed"]}),
                false,
                &bus.sink("h", "command"),
            )
            .await;
        bus.close().await;
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|e| matches!(
            e,
            Event::Data { stream, bytes, .. } if stream == "stdout" && bytes.contains("streamed")
        )));
    }

    #[tokio::test]
    async fn check_mode_skips_execution() {
        let bus = EventBus::start(None);
        let out = CommandModule
            .run(
                &serde_json::json!({"cmd": "echo side-effect"}),
                true,
                &bus.sink("h", "command"),
            )
            .await;
        bus.close().await;
        assert!(out.success && !out.changed);
        assert_eq!(out.output["skipped"], true);
    }
}
