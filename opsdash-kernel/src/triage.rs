/**
 * TRIAGE STORE - Human disposition of alerts and recommendations
 *
 * ROLE :
 * Records what an operator decided about a derived item (ack, investigating,
 * resolved...) under a stable key, so the decision survives re-aggregation
 * and restarts.
 *
 * FONCTIONNEMENT :
 * - key = "<kind>:<itemKey>", kind in {alert, intel}
 * - set = read-modify-write merge, omitted fields keep their previous value
 * - after each set: full snapshot rewritten (temp file + rename) then one
 *   operator event emitted
 * - snapshot writes are serialized; a failed write is logged, memory wins
 * - records are never deleted
 */

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::clock::{ms_to_rfc3339, SharedClock};
use crate::error::{OpsError, OpsResult};
use crate::events::{EventLevel, NewEvent, OperatorEventLog};
use crate::identity::Identity;
use crate::state::{new_rw_state, SharedRw};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageKind {
    Alert,
    Intel,
}

impl TriageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriageKind::Alert => "alert",
            TriageKind::Intel => "intel",
        }
    }

    pub fn parse(raw: &str) -> OpsResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "alert" => Ok(TriageKind::Alert),
            "intel" => Ok(TriageKind::Intel),
            other => Err(OpsError::Validation(format!("unknown triage kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageStatus {
    #[default]
    New,
    Ack,
    Investigating,
    Resolved,
    Ignored,
}

impl TriageStatus {
    pub const ALL: [TriageStatus; 5] = [
        TriageStatus::New,
        TriageStatus::Ack,
        TriageStatus::Investigating,
        TriageStatus::Resolved,
        TriageStatus::Ignored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriageStatus::New => "new",
            TriageStatus::Ack => "ack",
            TriageStatus::Investigating => "investigating",
            TriageStatus::Resolved => "resolved",
            TriageStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for TriageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageRecord {
    pub key: String,
    pub status: TriageStatus,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub due_at: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub updated_at: String,
    pub updated_by: String,
}

/// Partial update. `dueAt: null` clears the due date, an absent `dueAt` keeps it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriagePatch {
    #[serde(default)]
    pub status: Option<TriageStatus>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub due_at: Option<Option<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn present<'de, D>(d: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(d).map(Some)
}

impl TriagePatch {
    pub fn status(status: TriageStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

fn merge(key: String, prev: Option<&TriageRecord>, patch: TriagePatch, actor: &str, now: String) -> TriageRecord {
    let due_at = match patch.due_at {
        Some(None) => None,
        Some(Some(due)) if !due.is_empty() => Some(due),
        _ => prev.and_then(|p| p.due_at.clone()),
    };
    TriageRecord {
        key,
        status: patch.status.or(prev.map(|p| p.status)).unwrap_or_default(),
        owner: non_empty(patch.owner).or_else(|| prev.map(|p| p.owner.clone())).unwrap_or_default(),
        due_at,
        notes: non_empty(patch.notes).or_else(|| prev.map(|p| p.notes.clone())).unwrap_or_default(),
        updated_at: now,
        updated_by: actor.to_string(),
    }
}

pub struct TriageStore {
    records: SharedRw<BTreeMap<String, TriageRecord>>,
    path: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
    events: Arc<OperatorEventLog>,
    clock: SharedClock,
}

impl TriageStore {
    pub fn in_memory(events: Arc<OperatorEventLog>, clock: SharedClock) -> Self {
        Self {
            records: new_rw_state(BTreeMap::new()),
            path: None,
            persist_lock: tokio::sync::Mutex::new(()),
            events,
            clock,
        }
    }

    /// Loads the snapshot at `path`. Missing or unreadable file => empty store.
    pub async fn load(path: impl Into<PathBuf>, events: Arc<OperatorEventLog>, clock: SharedClock) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, TriageRecord>>(&raw).unwrap_or_else(|e| {
                warn!("[triage] ignoring unreadable snapshot {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        info!("[triage] loaded {} records", records.len());
        Self {
            records: new_rw_state(records),
            path: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
            events,
            clock,
        }
    }

    pub fn store_key(kind: TriageKind, item_key: &str) -> String {
        format!("{}:{}", kind.as_str(), item_key.trim())
    }

    pub fn get(&self, kind: TriageKind, item_key: &str) -> Option<TriageRecord> {
        self.records.read().get(&Self::store_key(kind, item_key)).cloned()
    }

    pub async fn set(
        &self,
        kind: TriageKind,
        item_key: &str,
        patch: TriagePatch,
        actor: &Identity,
    ) -> OpsResult<TriageRecord> {
        if item_key.trim().is_empty() {
            return Err(OpsError::Validation("missing triage key".into()));
        }
        let key = Self::store_key(kind, item_key);
        let now = ms_to_rfc3339(self.clock.now_ms()).unwrap_or_default();

        let record = {
            let mut records = self.records.write();
            let record = merge(key.clone(), records.get(&key), patch, &actor.user, now);
            records.insert(key.clone(), record.clone());
            record
        };

        self.persist().await;

        let mut details = record.status.to_string();
        if !record.owner.is_empty() {
            details.push_str(&format!(" · owner={}", record.owner));
        }
        self.events.log(
            NewEvent::new("triage", EventLevel::Info, format!("Triage updated: {key}"))
                .actor(actor.user.clone())
                .details(details)
                .meta(json!({ "key": key, "status": record.status })),
        );
        Ok(record)
    }

    /// Records whose key starts with `kind:`, or everything without filter.
    pub fn list(&self, kind: Option<TriageKind>) -> BTreeMap<String, TriageRecord> {
        let records = self.records.read();
        match kind {
            Some(kind) => {
                let prefix = format!("{}:", kind.as_str());
                records
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
            None => records.clone(),
        }
    }

    /// Record count per status, every status present.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<&'static str, usize> =
            TriageStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for record in self.records.read().values() {
            *counts.entry(record.status.as_str()).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn persist(&self) {
        let Some(path) = &self.path else { return };
        let _guard = self.persist_lock.lock().await;
        // snapshot taken under the persist lock so the last writer wins on disk
        let snapshot = match serde_json::to_string_pretty(&*self.records.read()) {
            Ok(s) => s,
            Err(e) => {
                warn!("[triage] failed to serialize snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = write_atomic(path, snapshot.as_bytes()).await {
            warn!("[triage] failed to persist {:?}: {}", path, e);
        }
    }
}

async fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}
