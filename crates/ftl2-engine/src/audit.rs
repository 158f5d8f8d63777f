//! Audit log and positional replay.
//!
//! The log is an ordered, append-only sequence of execution records,
//! serialized as one JSON array. Record order equals the order in which the
//! fan-out driver emitted calls, not completion order: the driver reserves
//! a slot per host at emission time and fills it when the call finishes.
//! Flushes write only the filled prefix, so a crash never leaves a gap that
//! would misalign positional replay.
//!
//! Replay is positional: a cursor walks the prior log and reuses a record
//! when the next call matches its module and host and the record succeeded.
//! Any divergence disengages the cursor for the rest of the run, so
//! subsequent calls execute normally.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::state::write_json_atomic;

/// Flush to disk every this many filled records, in addition to on-exit.
const FLUSH_INTERVAL: usize = 8;

/// One module call on one host, as recorded. Params are stored redacted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub module: String,
    pub params: Value,
    pub success: bool,
    pub changed: bool,
    pub output: Value,
    pub duration_s: f64,
    #[serde(default)]
    pub replayed: bool,
}

/// Reservation handle returned at call-emission time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot(usize);

pub struct AuditLog {
    path: Option<PathBuf>,
    inner: Mutex<Slots>,
}

enum SlotState {
    Pending,
    /// Reserved but never executed (policy deny, cancellation): the slot
    /// is released so later records are not blocked behind it.
    Skipped,
    Filled(ExecutionRecord),
}

#[derive(Default)]
struct Slots {
    records: Vec<SlotState>,
    filled: usize,
}

impl AuditLog {
    /// A log that records in memory and, when `path` is set, persists to
    /// disk on flush.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            inner: Mutex::new(Slots::default()),
        }
    }

    /// Reserves the next position in emission order.
    pub fn reserve(&self) -> Slot {
        let mut inner = self.inner.lock().expect("audit lock");
        inner.records.push(SlotState::Pending);
        Slot(inner.records.len() - 1)
    }

    /// Finalizes a reserved slot. Periodically flushes the filled prefix.
    pub fn fill(&self, slot: Slot, record: ExecutionRecord) {
        let flush_due = {
            let mut inner = self.inner.lock().expect("audit lock");
            debug_assert!(
                matches!(inner.records[slot.0], SlotState::Pending),
                "slot finalized twice"
            );
            inner.records[slot.0] = SlotState::Filled(record);
            inner.filled += 1;
            inner.filled % FLUSH_INTERVAL == 0
        };
        if flush_due {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "periodic audit flush failed");
            }
        }
    }

    /// Releases a reserved slot that will never produce a record.
    pub fn skip(&self, slot: Slot) {
        let mut inner = self.inner.lock().expect("audit lock");
        if matches!(inner.records[slot.0], SlotState::Pending) {
            inner.records[slot.0] = SlotState::Skipped;
        }
    }

    /// Reserve-and-fill in one step, for records that complete synchronously.
    pub fn append(&self, record: ExecutionRecord) {
        let slot = self.reserve();
        self.fill(slot, record);
    }

    /// All finalized records, in emission order, stopping at the first
    /// still-pending slot.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        let inner = self.inner.lock().expect("audit lock");
        let mut out = Vec::new();
        for state in &inner.records {
            match state {
                SlotState::Pending => break,
                SlotState::Skipped => continue,
                SlotState::Filled(record) => out.push(record.clone()),
            }
        }
        out
    }

    /// Writes the filled prefix as a JSON array with an atomic rename.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records = self.records();
        write_json_atomic(path, &records)?;
        tracing::debug!(count = records.len(), path = %path.display(), "audit flushed");
        Ok(())
    }

    /// Loads a prior run's log for replay. A missing file is an error here:
    /// the caller asked to replay something that does not exist. A malformed
    /// file refuses to start rather than silently executing everything.
    pub fn load_prior(path: &Path) -> Result<Vec<ExecutionRecord>> {
        let bytes = std::fs::read(path).map_err(|e| {
            EngineError::AuditInvalid(format!("{}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::AuditInvalid(format!("{}: {e}", path.display())))
    }
}

/// Positional cursor over a prior run's records.
pub struct ReplayCursor {
    records: Vec<ExecutionRecord>,
    position: usize,
    engaged: bool,
}

impl ReplayCursor {
    pub fn new(records: Vec<ExecutionRecord>) -> Self {
        Self {
            records,
            position: 0,
            engaged: true,
        }
    }

    /// A cursor that never replays, for runs without a replay file.
    pub fn disengaged() -> Self {
        Self {
            records: Vec::new(),
            position: 0,
            engaged: false,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Returns the prior record when the next call lines up with it.
    /// Divergence (different module, different host, or a prior failure)
    /// disengages the cursor permanently.
    pub fn try_replay(&mut self, module: &str, host: &str) -> Option<ExecutionRecord> {
        if !self.engaged {
            return None;
        }
        let Some(record) = self.records.get(self.position) else {
            self.engaged = false;
            return None;
        };
        if record.module == module && record.host == host && record.success {
            self.position += 1;
            return Some(record.clone());
        }
        tracing::info!(
            position = self.position,
            expected_module = %record.module,
            got_module = %module,
            "replay diverged; executing remaining calls"
        );
        self.engaged = false;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, module: &str, success: bool) -> ExecutionRecord {
        ExecutionRecord {
            timestamp: Utc::now(),
            host: host.into(),
            module: module.into(),
            params: serde_json::json!({}),
            success,
            changed: false,
            output: serde_json::json!({"ok": success}),
            duration_s: 0.01,
            replayed: false,
        }
    }

    #[test]
    fn records_follow_reservation_order_not_completion_order() {
        let log = AuditLog::new(None);
        let first = log.reserve();
        let second = log.reserve();
        // Second call completes before the first.
        log.fill(second, record("h2", "ping", true));
        log.fill(first, record("h1", "ping", true));
        let hosts: Vec<_> = log.records().iter().map(|r| r.host.clone()).collect();
        assert_eq!(hosts, ["h1", "h2"]);
    }

    #[test]
    fn records_stop_at_pending_slot() {
        let log = AuditLog::new(None);
        let first = log.reserve();
        let second = log.reserve();
        log.fill(second, record("h2", "ping", true));
        // First slot still pending: nothing is observable yet.
        assert!(log.records().is_empty());
        log.fill(first, record("h1", "ping", true));
        assert_eq!(log.records().len(), 2);
    }

    #[test]
    fn skipped_slots_release_the_order() {
        let log = AuditLog::new(None);
        let denied = log.reserve();
        let executed = log.reserve();
        log.fill(executed, record("h2", "ping", true));
        assert!(log.records().is_empty());
        // Once the denied call releases its slot, later records surface.
        log.skip(denied);
        let hosts: Vec<_> = log.records().iter().map(|r| r.host.clone()).collect();
        assert_eq!(hosts, ["h2"]);
    }

    #[test]
    fn flush_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        let log = AuditLog::new(Some(path.clone()));
        log.append(record("web01", "file", true));
        log.append(record("web02", "file", true));
        log.flush().unwrap();

        let loaded = AuditLog::load_prior(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].host, "web01");
        assert_eq!(loaded[1].host, "web02");
    }

    #[test]
    fn malformed_prior_log_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(&path, b"[{\"host\": trunc").unwrap();
        let err = AuditLog::load_prior(&path).unwrap_err();
        assert!(matches!(err, EngineError::AuditInvalid(_)));
    }

    #[test]
    fn missing_prior_log_refuses_to_start() {
        let err = AuditLog::load_prior(Path::new("/nonexistent/audit.json")).unwrap_err();
        assert!(matches!(err, EngineError::AuditInvalid(_)));
    }

    #[test]
    fn replay_hits_in_order() {
        let mut cursor = ReplayCursor::new(vec![
            record("localhost", "file", true),
            record("localhost", "command", true),
        ]);
        assert!(cursor.try_replay("file", "localhost").is_some());
        assert!(cursor.try_replay("command", "localhost").is_some());
        // Past the end: disengage quietly.
        assert!(cursor.try_replay("file", "localhost").is_none());
        assert!(!cursor.is_engaged());
    }

    #[test]
    fn replay_disengages_on_module_mismatch() {
        let mut cursor = ReplayCursor::new(vec![
            record("localhost", "file", true),
            record("localhost", "command", true),
        ]);
        assert!(cursor.try_replay("shell", "localhost").is_none());
        assert!(!cursor.is_engaged());
        // Even a later exact match stays live execution.
        assert!(cursor.try_replay("command", "localhost").is_none());
    }

    #[test]
    fn replay_disengages_on_host_mismatch() {
        let mut cursor = ReplayCursor::new(vec![record("web01", "file", true)]);
        assert!(cursor.try_replay("file", "web02").is_none());
        assert!(!cursor.is_engaged());
    }

    #[test]
    fn replay_disengages_on_prior_failure() {
        let mut cursor = ReplayCursor::new(vec![
            record("localhost", "file", true),
            record("localhost", "command", false),
            record("localhost", "file", true),
        ]);
        assert!(cursor.try_replay("file", "localhost").is_some());
        // The failed record must re-execute, and everything after it too.
        assert!(cursor.try_replay("command", "localhost").is_none());
        assert!(cursor.try_replay("file", "localhost").is_none());
    }

    #[test]
    fn disengaged_cursor_never_replays() {
        let mut cursor = ReplayCursor::disengaged();
        assert!(cursor.try_replay("file", "localhost").is_none());
    }
}
