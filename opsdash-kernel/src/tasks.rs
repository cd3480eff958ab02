//! Active task view: fix operations merged with live chat and sub-agent sessions.
//!
//! Session-backed tasks carry no real progress signal; their step and
//! percentage are estimated from the session age alone.

use serde::Serialize;
use std::cmp::Ordering;

use crate::clock::{human_duration, ms_to_rfc3339};
use crate::events::EventLevel;
use crate::fix_ops::{FixEvent, FixOperation, FixStatus};
use crate::signals::Session;

const FIX_RECENT_MS: i64 = 15 * 60_000;
const CHAT_MAX_AGE_MS: i64 = 6 * 60_000;
const SUBAGENT_MAX_AGE_MS: i64 = 30 * 60_000;
const SUBAGENT_RUNNING_MS: i64 = 3 * 60_000;
const MAX_CHAT_TASKS: usize = 12;
const MAX_SUBAGENT_TASKS: usize = 10;
const MAX_TASKS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    AiFix,
    TelegramLive,
    SubagentLive,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::AiFix => "ai-fix",
            TaskType::TelegramLive => "telegram-live",
            TaskType::SubagentLive => "subagent-live",
        }
    }

    /// Age after which a running task of this type is reported as slow.
    pub fn sla_ms(&self) -> i64 {
        match self {
            TaskType::AiFix => 4 * 60_000,
            TaskType::SubagentLive => 8 * 60_000,
            TaskType::TelegramLive => 2 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    pub id: String,
    pub task_type: TaskType,
    pub source: String,
    pub kind: String,
    pub title: String,
    pub status: FixStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_by: String,
    pub error: Option<String>,
    pub result_text: Option<String>,
    pub step: String,
    pub progress_percent: u8,
    pub eta_ms: Option<i64>,
    pub eta_at: Option<String>,
    pub events: Vec<FixEvent>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_percent: Option<f64>,
}

impl ActiveTask {
    pub fn is_running(&self) -> bool {
        self.status == FixStatus::Running
    }
}

fn ev(ts: i64, level: EventLevel, text: impl Into<String>) -> FixEvent {
    FixEvent { ts, level, text: text.into() }
}

pub fn from_fix(op: &FixOperation) -> ActiveTask {
    let view = op.view();
    ActiveTask {
        id: view.id,
        task_type: TaskType::AiFix,
        source: view.source,
        kind: view.kind,
        title: view.title,
        status: view.status,
        created_at_ms: view.created_at_ms,
        updated_at_ms: view.updated_at_ms,
        started_by: view.started_by,
        error: view.error,
        result_text: view.result_text,
        step: view.step.to_string(),
        progress_percent: view.progress_percent,
        eta_ms: view.eta_ms,
        eta_at: view.eta_at,
        events: view.events,
        active: op.is_running(),
        session_key: None,
        agent_id: None,
        model: None,
        chat_target: None,
        context_percent: None,
    }
}

fn session_task(s: &Session, task_type: TaskType, source: &str, title: String, now: i64) -> ActiveTask {
    let at = s.updated_at_ms.unwrap_or(now);
    ActiveTask {
        id: format!("{source}:{}", s.key),
        task_type,
        source: source.to_string(),
        kind: "session".into(),
        title,
        status: FixStatus::Running,
        created_at_ms: at,
        updated_at_ms: at,
        started_by: "system".into(),
        error: None,
        result_text: None,
        step: String::new(),
        progress_percent: 0,
        eta_ms: None,
        eta_at: None,
        events: Vec::new(),
        active: true,
        session_key: Some(s.key.clone()),
        agent_id: Some(s.agent_id.clone()),
        model: Some(s.model.clone()),
        chat_target: None,
        context_percent: None,
    }
}

/// Chat conversation touched in the last 6 minutes.
pub fn from_chat_session(s: &Session, now: i64) -> Option<ActiveTask> {
    if s.age_ms > CHAT_MAX_AGE_MS {
        return None;
    }
    let (step, pct, eta, done) = if s.age_ms <= 25_000 {
        ("tg-responding", 86, 20_000, false)
    } else if s.age_ms <= 90_000 {
        ("tg-thinking", 64, 60_000, false)
    } else {
        ("tg-finished", 100, 0, true)
    };

    let mut task = session_task(s, TaskType::TelegramLive, "telegram", format!("{}: chat conversation", s.agent_id), now);
    let at = task.updated_at_ms;
    task.step = step.into();
    task.progress_percent = pct;
    task.eta_ms = Some(eta);
    task.eta_at = ms_to_rfc3339(now + eta);
    task.chat_target = s.chat_target();
    task.context_percent = s.percent_used.map(|p| p.clamp(0.0, 100.0));
    if done {
        task.status = FixStatus::Done;
        task.active = false;
    }

    let context = task.context_percent.map(|p| format!("{p}%")).unwrap_or_else(|| "n/a".into());
    let mut events = Vec::new();
    if let Some(target) = &task.chat_target {
        events.push(ev(at, EventLevel::Info, format!("Chat: {target}")));
    }
    if done {
        events.push(ev(at, EventLevel::Ok, "Trace: delivered"));
    }
    events.extend([
        ev(at - s.age_ms.min(60_000), EventLevel::Info, "Trace: inbound received"),
        ev(at - s.age_ms.min(35_000), EventLevel::Info, "Trace: agent is composing a reply"),
        ev(at - s.age_ms.min(10_000), EventLevel::Info, "Trace: send attempted"),
        ev(at, EventLevel::Info, format!("Last activity {} ago", human_duration(s.age_ms))),
        ev(at, EventLevel::Info, format!("Model: {}", s.model)),
        ev(at, EventLevel::Info, format!("Context: {context}")),
    ]);
    task.events = events;
    Some(task)
}

/// Sub-agent session touched in the last 30 minutes; running for the first 3.
pub fn from_subagent_session(s: &Session, now: i64) -> Option<ActiveTask> {
    if s.age_ms > SUBAGENT_MAX_AGE_MS {
        return None;
    }
    let running = s.age_ms <= SUBAGENT_RUNNING_MS;
    let mut task = session_task(s, TaskType::SubagentLive, "subagent", format!("{}: sub-agent", s.agent_id), now);
    let at = task.updated_at_ms;

    if running {
        let eta = (180_000 - s.age_ms).max(30_000);
        task.step = "subagent-running".into();
        task.progress_percent = (85 - s.age_ms / 7_000).max(35) as u8;
        task.eta_ms = Some(eta);
        task.eta_at = ms_to_rfc3339(now + eta);
    } else {
        task.step = "subagent-finished".into();
        task.progress_percent = 100;
        task.status = FixStatus::Done;
        task.active = false;
        task.eta_ms = Some(0);
        task.eta_at = ms_to_rfc3339(now);
    }

    let mut events = Vec::new();
    if !running {
        events.push(ev(at, EventLevel::Ok, "Sub-agent finished its active phase"));
    }
    if let Some(thread) = s.thread_id() {
        events.push(ev(at, EventLevel::Info, format!("Thread: {thread}")));
    }
    events.push(ev(at, EventLevel::Info, format!("Last activity {} ago", human_duration(s.age_ms))));
    events.push(ev(at, EventLevel::Info, format!("Model: {}", s.model)));
    task.events = events;
    Some(task)
}

/// Running-first, then most recently updated, at most 30.
pub fn collect_active_tasks(ops: &[FixOperation], sessions: &[Session], now: i64) -> Vec<ActiveTask> {
    let fixes = ops
        .iter()
        .filter(|op| op.is_running() || now - op.updated_at_ms < FIX_RECENT_MS)
        .map(from_fix);
    let chats = sessions
        .iter()
        .filter(|s| s.is_chat())
        .filter_map(|s| from_chat_session(s, now))
        .take(MAX_CHAT_TASKS);
    let subagents = sessions
        .iter()
        .filter(|s| s.is_subagent())
        .filter_map(|s| from_subagent_session(s, now))
        .take(MAX_SUBAGENT_TASKS);

    let mut items: Vec<ActiveTask> = fixes.chain(chats).chain(subagents).collect();
    items.sort_by(|a, b| match (a.is_running(), b.is_running()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => b.updated_at_ms.cmp(&a.updated_at_ms),
    });
    items.truncate(MAX_TASKS);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{RawSession, Session};

    fn session(key: &str, age_ms: f64) -> Session {
        Session::from_raw(&RawSession {
            key: key.into(),
            age: Some(age_ms),
            updated_at: Some(1_000_000.0),
            percent_used: Some(40.0),
            ..Default::default()
        })
    }

    #[test]
    fn test_chat_session_phases() {
        let now = 2_000_000;
        let t = from_chat_session(&session("agent:main:telegram:direct:42", 10_000.0), now).unwrap();
        assert_eq!((t.step.as_str(), t.progress_percent), ("tg-responding", 86));
        assert_eq!(t.chat_target.as_deref(), Some("42"));
        assert_eq!(t.id, "telegram:agent:main:telegram:direct:42");

        let t = from_chat_session(&session("agent:main:telegram:direct:42", 60_000.0), now).unwrap();
        assert_eq!((t.step.as_str(), t.progress_percent), ("tg-thinking", 64));

        let t = from_chat_session(&session("agent:main:telegram:direct:42", 120_000.0), now).unwrap();
        assert_eq!(t.status, FixStatus::Done);
        assert_eq!(t.progress_percent, 100);

        assert!(from_chat_session(&session("agent:main:telegram:direct:42", 400_000.0), now).is_none());
    }

    #[test]
    fn test_subagent_progress_estimate() {
        let now = 2_000_000;
        let t = from_subagent_session(&session("agent:ops:thread:t1", 70_000.0), now).unwrap();
        assert!(t.is_running());
        assert_eq!(t.progress_percent, 75);
        assert_eq!(t.eta_ms, Some(110_000));

        let t = from_subagent_session(&session("agent:ops:spawn:x", 179_000.0), now).unwrap();
        assert_eq!(t.progress_percent, 60);

        let t = from_subagent_session(&session("agent:ops:spawn:x", 600_000.0), now).unwrap();
        assert_eq!(t.status, FixStatus::Done);
        assert!(from_subagent_session(&session("agent:ops:spawn:x", 31.0 * 60_000.0), now).is_none());
    }

    #[test]
    fn test_running_tasks_sort_first() {
        let now = 2_000_000;
        let sessions = vec![
            session("agent:main:telegram:direct:1", 200_000.0),
            session("agent:ops:thread:t1", 10_000.0),
            session("agent:main:direct:plain", 10.0),
        ];
        let items = collect_active_tasks(&[], &sessions, now);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_running());
        assert_eq!(items[0].task_type, TaskType::SubagentLive);
        assert!(!items[1].is_running());
    }
}
