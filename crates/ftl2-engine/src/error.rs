//! Engine error taxonomy.
//!
//! Every failure mode is a tagged variant, never a bare string wrapped at
//! the call site. Context-entry failures (inventory, secrets, prior audit,
//! state) abort the context; per-call failures are captured into the
//! aggregate result and only escalate under fail-fast.

use serde_json::Value;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed inventory document or host attributes. Fatal at entry.
    #[error("invalid inventory: {0}")]
    InventoryInvalid(String),

    /// A deny rule matched. Per-call; never retried.
    #[error("denied by policy: {0}")]
    PolicyDenied(String),

    /// A declared secret could not be resolved. Fatal at entry (fail closed).
    #[error("secret not resolved: {0}")]
    SecretMissing(String),

    /// Dependency resolution or packaging failed. Per-call; not retried.
    #[error("bundle build failed: {0}")]
    BundleBuildFailed(String),

    /// SSH session or gate process died. The gate restarts on the next call;
    /// the call that observed the loss is surfaced as failed.
    #[error("transport lost to host {0}")]
    TransportLost(String),

    /// Malformed frame or duplicated id. The gate is killed and restarted.
    #[error("gate protocol error: {0}")]
    Protocol(String),

    /// Per-call deadline exceeded.
    #[error("call timed out")]
    Timeout,

    /// Cooperative cancellation (fail-fast or context teardown).
    #[error("call cancelled")]
    Cancelled,

    /// The module ran and reported failure. Recorded, not retried.
    #[error("module failed: {}", summarize(.0))]
    ModuleFailed(Value),

    /// Malformed state file. Fatal at entry.
    #[error("invalid state file: {0}")]
    StateInvalid(String),

    /// A replay file was configured but could not be parsed. Fatal at entry.
    #[error("invalid audit file for replay: {0}")]
    AuditInvalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error aborts the whole context rather than one call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InventoryInvalid(_)
                | EngineError::SecretMissing(_)
                | EngineError::StateInvalid(_)
                | EngineError::AuditInvalid(_)
        )
    }
}

fn summarize(output: &Value) -> String {
    output
        .get("msg")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| output.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_failed_prefers_msg_field() {
        let err = EngineError::ModuleFailed(serde_json::json!({
            "failed": true,
            "msg": "path not writable"
        }));
        assert_eq!(err.to_string(), "module failed: path not writable");
    }

    #[test]
    fn fatal_classification() {
        assert!(EngineError::SecretMissing("API_TOKEN".into()).is_fatal());
        assert!(EngineError::AuditInvalid("truncated".into()).is_fatal());
        assert!(!EngineError::Timeout.is_fatal());
        assert!(!EngineError::PolicyDenied("no".into()).is_fatal());
    }
}
