//! Operator-facing rollups built on the event log: "now", timeline, weekly review.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::clock::ms_to_rfc3339;
use crate::events::{EventLevel, OperatorEvent, OperatorEventLog};
use crate::tasks::ActiveTask;
use crate::triage::TriageStore;

const NOW_ACTIVE: usize = 10;
const NOW_RECENT: usize = 30;
const TIMELINE_EVENTS: usize = 120;
const TIMELINE_TASKS: usize = 20;
const TIMELINE_TASK_EVENTS: usize = 8;
const TIMELINE_ROWS: usize = 200;
const WEEK_MS: i64 = 7 * 24 * 3_600_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorNow {
    pub active: Vec<ActiveTask>,
    pub recent: Vec<OperatorEvent>,
    pub updated_at: Option<String>,
}

pub fn operator_now(tasks: &[ActiveTask], events: &OperatorEventLog, now_ms: i64) -> OperatorNow {
    OperatorNow {
        active: tasks.iter().filter(|t| t.is_running()).take(NOW_ACTIVE).cloned().collect(),
        recent: events.recent(NOW_RECENT),
        updated_at: ms_to_rfc3339(now_ms),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRow {
    pub ts: i64,
    pub source: String,
    pub level: EventLevel,
    pub title: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub entries: Vec<TimelineRow>,
    pub updated_at: Option<String>,
}

/// Operator events and per-task progress events, newest first.
pub fn timeline(events: &OperatorEventLog, tasks: &[ActiveTask], now_ms: i64) -> Timeline {
    let mut rows: Vec<TimelineRow> = events
        .recent(TIMELINE_EVENTS)
        .into_iter()
        .map(|ev| TimelineRow {
            ts: ev.ts,
            source: "operator".into(),
            level: ev.level,
            title: ev.title,
            details: ev.details,
            meta: Some(ev.meta),
            task_id: None,
        })
        .collect();

    for task in tasks.iter().take(TIMELINE_TASKS) {
        let skip = task.events.len().saturating_sub(TIMELINE_TASK_EVENTS);
        for ev in &task.events[skip..] {
            rows.push(TimelineRow {
                ts: ev.ts,
                source: task.task_type.as_str().to_string(),
                level: ev.level,
                title: task.title.clone(),
                details: ev.text.clone(),
                meta: None,
                task_id: Some(task.id.clone()),
            });
        }
    }

    rows.sort_by(|a, b| b.ts.cmp(&a.ts));
    rows.truncate(TIMELINE_ROWS);
    Timeline { entries: rows, updated_at: ms_to_rfc3339(now_ms) }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyReview {
    pub window: &'static str,
    pub events_total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_level: BTreeMap<String, usize>,
    pub triage: BTreeMap<&'static str, usize>,
    pub updated_at: Option<String>,
}

pub fn weekly_review(events: &OperatorEventLog, triage: &TriageStore, now_ms: i64) -> WeeklyReview {
    let window = events.since(now_ms - WEEK_MS);
    let mut by_kind = BTreeMap::new();
    let mut by_level = BTreeMap::new();
    for ev in &window {
        *by_kind.entry(ev.kind.clone()).or_insert(0) += 1;
        *by_level.entry(ev.level.as_str().to_string()).or_insert(0) += 1;
    }
    WeeklyReview {
        window: "7d",
        events_total: window.len(),
        by_kind,
        by_level,
        triage: triage.status_counts(),
        updated_at: ms_to_rfc3339(now_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::NewEvent;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_weekly_review_counts_last_seven_days() {
        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(OperatorEventLog::in_memory(clock.clone()));
        let triage = TriageStore::in_memory(events.clone(), clock.clone());

        events.log(NewEvent::new("ai-fix", EventLevel::Info, "too old"));
        clock.advance(Duration::from_secs(8 * 24 * 3600));
        events.log(NewEvent::new("ai-fix", EventLevel::Ok, "done"));
        events.log(NewEvent::new("operator-note", EventLevel::Warn, "note"));

        let review = weekly_review(&events, &triage, clock.now_ms());
        assert_eq!(review.events_total, 2);
        assert_eq!(review.by_kind["ai-fix"], 1);
        assert_eq!(review.by_level["warn"], 1);
        assert_eq!(review.triage["new"], 0);
    }

    #[test]
    fn test_timeline_is_newest_first() {
        let clock = Arc::new(ManualClock::new(1_000));
        let events = OperatorEventLog::in_memory(clock.clone());
        events.log(NewEvent::new("a", EventLevel::Info, "first"));
        clock.advance(Duration::from_secs(1));
        events.log(NewEvent::new("b", EventLevel::Info, "second"));

        let tl = timeline(&events, &[], clock.now_ms());
        assert_eq!(tl.entries.len(), 2);
        assert_eq!(tl.entries[0].title, "second");
        assert_eq!(tl.entries[0].source, "operator");
    }
}
