//! Mutation audit trail: one JSON line per write attempt, in `audit.log.jsonl`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::clock::{ms_to_rfc3339, SharedClock};
use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub user: String,
    pub role: String,
    pub action: String,
    pub ok: bool,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub payload: Value,
}

pub struct AuditTrail {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    clock: SharedClock,
}

impl AuditTrail {
    pub fn new(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self { path: path.into(), write_lock: tokio::sync::Mutex::new(()), clock }
    }

    /// Appends one entry. Failures are logged and swallowed.
    pub async fn record(&self, who: &Identity, action: &str, ok: bool, note: &str, payload: Value) {
        let entry = AuditEntry {
            ts: ms_to_rfc3339(self.clock.now_ms()).unwrap_or_default(),
            user: who.user.clone(),
            role: who.role.to_string(),
            action: action.to_string(),
            ok,
            note: note.to_string(),
            payload,
        };
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.append(&entry).await {
            warn!("[audit] failed to append {}: {}", action, e);
        }
    }

    async fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Last `limit` entries, newest first. Unreadable lines are skipped.
    pub async fn tail(&self, limit: usize) -> Vec<AuditEntry> {
        let Ok(raw) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        raw.lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Role;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::new(dir.path().join("audit.log.jsonl"), Arc::new(ManualClock::new(1_000)));
        let who = Identity::new("alice", Role::Admin);

        trail.record(&who, "triage.set", true, "", json!({"key": "a"})).await;
        trail.record(&who, "fix.start", false, "rate limited", Value::Null).await;

        let entries = trail.tail(10).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "fix.start");
        assert!(!entries[0].ok);
        assert_eq!(entries[1].role, "admin");
        assert_eq!(entries[1].payload["key"], "a");
        assert_eq!(trail.tail(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::new(dir.path().join("nope.jsonl"), Arc::new(ManualClock::new(0)));
        assert!(trail.tail(5).await.is_empty());
    }
}
