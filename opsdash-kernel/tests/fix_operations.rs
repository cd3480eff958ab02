use opsdash_devkit::TestHarness;
use opsdash_kernel::fix_ops::{FixRequest, FixStatus, FixStep, FixTarget};
use opsdash_kernel::OpsError;
use serde_json::json;
use std::time::Duration;

fn cron_fix(title: &str) -> FixRequest {
    FixRequest::for_item(
        "alert",
        FixTarget { kind: Some("cron".into()), title: Some(title.into()), cron_id: Some("c1".into()), ..Default::default() },
    )
}

#[tokio::test]
async fn duplicate_start_reuses_the_running_operation() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    let core = h.core().await;
    let alice = TestHarness::operator("alice");

    let first = core.start_fix(&alice, cron_fix("X")).await.unwrap();
    let second = core.start_fix(&alice, cron_fix("X")).await.unwrap();
    assert_eq!(first.id, second.id);

    let running: Vec<_> = core.fix_list().into_iter().filter(|op| op.status == FixStatus::Running).collect();
    assert_eq!(running.len(), 1);

    let other = core.start_fix(&alice, cron_fix("Y")).await.unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn start_logs_an_operator_event() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    let core = h.core().await;

    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    assert_eq!(view.status, FixStatus::Running);
    assert!(view.progress_percent >= 12);

    let events = core.events().recent(10);
    let started = events.iter().find(|e| e.title == "AI fix started: X").unwrap();
    assert_eq!(started.actor, "alice");
    assert_eq!(started.meta["opId"], json!(view.id));
}

#[tokio::test]
async fn hung_operation_is_failed_on_read_after_timeout() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    let core = h.core().await;

    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    h.advance(Duration::from_secs(8 * 60));
    assert_eq!(core.fix_status(&view.id).unwrap().status, FixStatus::Running);

    h.advance(Duration::from_secs(61 + 60));
    let settled = core.fix_status(&view.id).unwrap();
    assert_eq!(settled.status, FixStatus::Error);
    assert_eq!(settled.error.as_deref(), Some("operation timeout"));
    assert_eq!(settled.eta_ms, None);
    assert!(settled.events.iter().any(|e| e.text.starts_with("Operation timed out")));
    assert!(core.events().recent(10).iter().any(|e| e.title == "AI fix failed: X"));

    // a new start is allowed once the first one has settled
    let again = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    assert_ne!(again.id, view.id);
}

#[tokio::test]
async fn progress_moves_through_the_steps_as_time_passes() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    let core = h.core().await;
    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    let started = TestHarness::wait_until(Duration::from_secs(2), || async {
        core.fix_status(&view.id).map(|v| v.step == FixStep::Diagnostics).unwrap_or(false)
    })
    .await;
    assert!(started);

    let mut seen = Vec::new();
    let mut last = 0;
    for _ in 0..9 {
        h.advance(Duration::from_secs(60));
        let current = core.fix_status(&view.id).unwrap();
        assert_eq!(current.status, FixStatus::Running);
        assert!(current.progress_percent >= last, "{} < {}", current.progress_percent, last);
        last = current.progress_percent;
        seen.push((current.step, current.progress_percent));
    }
    // 180s, 240s and 420s into a 540s budget
    assert_eq!(seen[2], (FixStep::Diagnostics, 42));
    assert_eq!(seen[3], (FixStep::Applying, 50));
    assert_eq!(seen[6], (FixStep::Verification, 75));
    assert_eq!(seen[8].1, 92);

    let texts: Vec<String> = core.fix_status(&view.id).unwrap().events.into_iter().map(|e| e.text).collect();
    assert!(texts.iter().any(|t| t == "Applying a safe fix"));
    assert!(texts.iter().any(|t| t == "Verifying that the fix worked"));

    h.advance(Duration::from_secs(1));
    let settled = core.fix_status(&view.id).unwrap();
    assert_eq!(settled.status, FixStatus::Error);
    assert!(settled.progress_percent >= 95);
}

#[tokio::test]
async fn completed_command_lands_in_done_with_result() {
    let h = TestHarness::new();
    h.executor.on_json("agent --agent", json!({ "reply": "restarted the cron, next run ok" }));
    let core = h.core().await;

    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    let done = TestHarness::wait_until(Duration::from_secs(2), || async {
        core.fix_status(&view.id).map(|v| v.status == FixStatus::Done).unwrap_or(false)
    })
    .await;
    assert!(done);

    let finished = core.fix_status(&view.id).unwrap();
    assert_eq!(finished.progress_percent, 100);
    assert_eq!(finished.step, FixStep::Completed);
    assert!(finished.result_text.unwrap_or_default().contains("restarted the cron"));
    assert!(core.events().recent(10).iter().any(|e| e.title == "AI fix done: X"));
}

#[tokio::test]
async fn failed_command_is_captured_on_the_operation() {
    let h = TestHarness::new();
    h.executor.fail("agent --agent", "agent crashed");
    let core = h.core().await;

    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    let failed = TestHarness::wait_until(Duration::from_secs(2), || async {
        core.fix_status(&view.id).map(|v| v.status == FixStatus::Error).unwrap_or(false)
    })
    .await;
    assert!(failed);
    assert!(core.fix_status(&view.id).unwrap().error.unwrap_or_default().contains("agent crashed"));
}

#[tokio::test]
async fn remediation_command_quotes_the_prompt() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    let core = h.core().await;
    core.start_fix(&TestHarness::operator("alice"), cron_fix("it's broken")).await.unwrap();

    let ok = TestHarness::wait_until(Duration::from_secs(2), || async { h.executor.count("agent --agent") == 1 }).await;
    assert!(ok);
    let call = h.executor.calls().into_iter().find(|c| c.contains("agent --agent")).unwrap();
    assert!(call.starts_with("openclaw agent --agent sre "));
    assert!(call.contains("--json --timeout 420"));
}

#[tokio::test]
async fn unknown_operation_and_task_are_not_found() {
    let h = TestHarness::new();
    h.executor.on_json("status --json", json!({}));
    let core = h.core().await;

    assert!(matches!(core.fix_status("nope"), Err(OpsError::NotFound(_))));
    assert!(matches!(core.replay_task("nope").await, Err(OpsError::NotFound(_))));
}

#[tokio::test]
async fn replay_returns_the_operation_history() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    h.executor.on_json("status --json", json!({}));
    let core = h.core().await;

    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    let replay = core.replay_task(&view.id).await.unwrap();
    assert_eq!(replay.title, "X");
    assert_eq!(replay.status, "running");
    assert_eq!(replay.events[0].text, "Task queued");

    let tasks = core.active_tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, view.id);
}

#[tokio::test]
async fn old_operations_are_pruned_on_read() {
    let h = TestHarness::new();
    h.executor.hang("agent --agent");
    let core = h.core().await;

    let view = core.start_fix(&TestHarness::operator("alice"), cron_fix("X")).await.unwrap();
    assert_eq!(core.fix_list().len(), 1);

    h.advance(Duration::from_secs(13 * 60 * 60));
    assert!(core.fix_list().is_empty());
    assert!(matches!(core.fix_status(&view.id), Err(OpsError::NotFound(_))));
}

#[tokio::test]
async fn operations_beyond_the_max_count_are_dropped_oldest_first() {
    let h = TestHarness::new().with_config(|c| c.fix.max_operations = 3);
    h.executor.hang("agent --agent");
    let core = h.core().await;
    let alice = TestHarness::operator("alice");

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(core.start_fix(&alice, cron_fix(&format!("T{i}"))).await.unwrap().id);
        h.advance(Duration::from_secs(1));
    }

    let titles: Vec<String> = core.fix_list().into_iter().map(|op| op.title).collect();
    assert_eq!(titles, vec!["T4", "T3", "T2"]);
    assert_eq!(core.fixes().len(), 3);
    assert!(matches!(core.fix_status(&ids[0]), Err(OpsError::NotFound(_))));
    assert!(matches!(core.fix_status(&ids[1]), Err(OpsError::NotFound(_))));
    assert!(core.fix_status(&ids[4]).is_ok());
}
