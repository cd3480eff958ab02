/**
 * OPERATOR EVENT LOG - Bounded journal of operationally significant events
 *
 * ROLE :
 * Cross-cutting audit trail: triage changes, fix-operation transitions and
 * operator notes all land here. Feeds operatorNow, the timeline and the weekly
 * review.
 *
 * FONCTIONNEMENT :
 * - in-memory ring of 500 events, oldest evicted first
 * - each event is mirrored as one JSON line appended to operator-events.jsonl
 * - appends go through a channel to a single writer task (tokio::fs), so log()
 *   never blocks; a failed append is logged and the in-memory event stays visible
 * - flush() waits until every event logged before it is on disk
 * - at startup only the last 400 lines of the file are replayed
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::state::{new_state, Shared};

pub const RING_CAPACITY: usize = 500;
pub const REPLAY_LINES: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    #[default]
    Info,
    Ok,
    Warn,
    Error,
}

impl EventLevel {
    /// Lenient parse for operator input, unknown values fall back to info.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ok" | "success" => EventLevel::Ok,
            "warn" | "warning" => EventLevel::Warn,
            "error" | "critical" => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Ok => "ok",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorEvent {
    pub id: String,
    pub ts: i64,
    pub kind: String,
    #[serde(default)]
    pub level: EventLevel,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub meta: Value,
}

/// Input of `OperatorEventLog::log`. Missing kind is "system", missing title is the kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewEvent {
    pub kind: Option<String>,
    pub level: EventLevel,
    pub actor: Option<String>,
    pub title: Option<String>,
    pub details: Option<String>,
    pub meta: Option<Value>,
}

impl NewEvent {
    pub fn new(kind: &str, level: EventLevel, title: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.to_string()),
            level,
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

enum JournalMsg {
    Append(String),
    Flush(oneshot::Sender<()>),
}

pub struct OperatorEventLog {
    ring: Shared<VecDeque<OperatorEvent>>,
    journal: Option<mpsc::UnboundedSender<JournalMsg>>,
    clock: SharedClock,
}

impl OperatorEventLog {
    /// Memory-only log, nothing mirrored to disk.
    pub fn in_memory(clock: SharedClock) -> Self {
        Self { ring: new_state(VecDeque::with_capacity(RING_CAPACITY)), journal: None, clock }
    }

    /// Opens the journal at `path`, replaying its tail into memory and
    /// starting the writer task. Must be called inside a tokio runtime.
    pub async fn open(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let path = path.into();
        let replayed = replay_tail(&path, REPLAY_LINES).await;
        debug!("[events] replayed {} events from {:?}", replayed.len(), path);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_journal(path, rx));

        let mut ring = VecDeque::with_capacity(RING_CAPACITY);
        ring.extend(replayed);
        Self { ring: new_state(ring), journal: Some(tx), clock }
    }

    pub fn log(&self, input: NewEvent) -> OperatorEvent {
        let kind = input.kind.filter(|k| !k.trim().is_empty()).unwrap_or_else(|| "system".into());
        let event = OperatorEvent {
            id: Uuid::new_v4().to_string(),
            ts: self.clock.now_ms(),
            title: input.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| kind.clone()),
            kind,
            level: input.level,
            actor: input.actor.unwrap_or_else(|| "system".into()),
            details: input.details.unwrap_or_default(),
            meta: input.meta.unwrap_or_else(|| Value::Object(Default::default())),
        };

        {
            let mut ring = self.ring.lock();
            ring.push_back(event.clone());
            while ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }

        if let Some(journal) = &self.journal {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if journal.send(JournalMsg::Append(line)).is_err() {
                        warn!("[events] journal writer is gone, event {} kept in memory only", event.id);
                    }
                }
                Err(e) => warn!("[events] failed to encode event {}: {}", event.id, e),
            }
        }
        event
    }

    /// Waits for every event logged so far to reach the journal file.
    pub async fn flush(&self) {
        let Some(journal) = &self.journal else { return };
        let (tx, rx) = oneshot::channel();
        if journal.send(JournalMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// The `n` most recent events, newest first.
    pub fn recent(&self, n: usize) -> Vec<OperatorEvent> {
        self.ring.lock().iter().rev().take(n).cloned().collect()
    }

    /// Events with `ts >= since_ms`, oldest first.
    pub fn since(&self, since_ms: i64) -> Vec<OperatorEvent> {
        self.ring.lock().iter().filter(|e| e.ts >= since_ms).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_journal(path: PathBuf, mut rx: mpsc::UnboundedReceiver<JournalMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            JournalMsg::Append(line) => {
                if let Err(e) = append_line(&path, &line).await {
                    warn!("[events] failed to append to {:?}: {}", path, e);
                }
            }
            JournalMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("[events] journal writer for {:?} stopped", path);
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

async fn replay_tail(path: &Path, max_lines: usize) -> Vec<OperatorEvent> {
    let Ok(raw) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..]
        .iter()
        .filter_map(|line| serde_json::from_str::<OperatorEvent>(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_defaults_for_missing_fields() {
        let log = OperatorEventLog::in_memory(Arc::new(ManualClock::new(5)));
        let ev = log.log(NewEvent::default());
        assert_eq!(ev.kind, "system");
        assert_eq!(ev.title, "system");
        assert_eq!(ev.level, EventLevel::Info);
        assert_eq!(ev.ts, 5);
        assert!(ev.meta.is_object());
    }

    #[test]
    fn test_ring_is_bounded_and_recent_is_newest_first() {
        let clock = Arc::new(ManualClock::new(0));
        let log = OperatorEventLog::in_memory(clock.clone());
        for i in 0..(RING_CAPACITY + 20) {
            clock.advance(Duration::from_millis(1));
            log.log(NewEvent::new("test", EventLevel::Info, format!("e{i}")));
        }
        assert_eq!(log.len(), RING_CAPACITY);
        let recent = log.recent(3);
        assert_eq!(recent[0].title, format!("e{}", RING_CAPACITY + 19));
        assert_eq!(recent[2].title, format!("e{}", RING_CAPACITY + 17));
        // the 20 oldest were evicted
        assert_eq!(log.since(0)[0].title, "e20");
    }

    #[tokio::test]
    async fn test_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let clock = Arc::new(ManualClock::new(100));

        let log = OperatorEventLog::open(&path, clock.clone()).await;
        log.log(NewEvent::new("triage", EventLevel::Ok, "first").actor("alice"));
        log.log(NewEvent::new("ai-fix", EventLevel::Error, "second"));
        log.flush().await;
        drop(log);

        let reopened = OperatorEventLog::open(&path, clock).await;
        let recent = reopened.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].title, "second");
        assert_eq!(recent[1].actor, "alice");
    }

    #[tokio::test]
    async fn test_replay_keeps_only_the_tail_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let clock = Arc::new(ManualClock::new(1));
        {
            let log = OperatorEventLog::open(&path, clock.clone()).await;
            for i in 0..(REPLAY_LINES + 10) {
                log.log(NewEvent::new("test", EventLevel::Info, format!("e{i}")));
            }
            log.flush().await;
        }
        append_line(&path, "not json").await.unwrap();

        let reopened = OperatorEventLog::open(&path, clock).await;
        assert_eq!(reopened.len(), REPLAY_LINES - 1);
        assert_eq!(reopened.recent(1)[0].title, format!("e{}", REPLAY_LINES + 9));
    }

    #[tokio::test]
    async fn test_log_returns_before_the_write_and_flush_waits_for_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let log = OperatorEventLog::open(&path, Arc::new(ManualClock::new(7))).await;
        let ev = log.log(NewEvent::new("cron", EventLevel::Warn, "Cron deleted"));
        assert_eq!(log.recent(1)[0].id, ev.id);

        log.flush().await;
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let written: OperatorEvent = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(written, ev);
    }

    #[tokio::test]
    async fn test_flush_on_memory_log_is_a_no_op() {
        let log = OperatorEventLog::in_memory(Arc::new(ManualClock::new(1)));
        log.log(NewEvent::default());
        log.flush().await;
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_level_parse_is_lenient() {
        assert_eq!(EventLevel::parse("WARNING"), EventLevel::Warn);
        assert_eq!(EventLevel::parse("ok"), EventLevel::Ok);
        assert_eq!(EventLevel::parse("???"), EventLevel::Info);
    }
}
