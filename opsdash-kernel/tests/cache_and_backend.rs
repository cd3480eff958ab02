use opsdash_devkit::{cron_job, cron_list, StatusBuilder, TestHarness};
use opsdash_kernel::OpsError;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn concurrent_reads_share_one_backend_call() {
    let h = TestHarness::new();
    h.executor
        .on_json_after("status --json", StatusBuilder::new().build(), Duration::from_millis(50));
    let core = h.core().await;
    let backend = core.backend();

    let (a, b, c, d) = tokio::join!(backend.status(), backend.status(), backend.status(), backend.status());
    assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
    assert_eq!(h.executor.count("status --json"), 1);
}

#[tokio::test]
async fn expired_entry_is_recomputed_once() {
    let h = TestHarness::new();
    h.executor.on_json("status --json", StatusBuilder::new().build());
    let core = h.core().await;

    core.backend().status().await.unwrap();
    core.backend().status().await.unwrap();
    assert_eq!(h.executor.count("status --json"), 1);

    h.advance(Duration::from_secs(61));
    let (a, b) = tokio::join!(core.backend().status(), core.backend().status());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.executor.count("status --json"), 2);
}

#[tokio::test]
async fn cron_mutation_only_drops_the_entries_it_makes_stale() {
    let h = TestHarness::new();
    h.executor.on_json("status --json", StatusBuilder::new().build());
    h.executor.on_json("cron list", cron_list(vec![cron_job("c1", "backup")]));
    h.executor.on_json("skills list", json!({ "skills": [] }));
    h.executor.on_json("cron run", json!({ "ok": true }));
    let core = h.core().await;

    core.backend().status().await.unwrap();
    core.backend().skills_index().await.unwrap();
    core.crons().await;
    core.cron_run(&TestHarness::operator("alice"), "c1").await.unwrap();

    core.backend().status().await.unwrap();
    core.backend().skills_index().await.unwrap();
    core.crons().await;
    assert_eq!(h.executor.count("status --json"), 2);
    assert_eq!(h.executor.count("cron list"), 2);
    assert_eq!(h.executor.count("skills list"), 1);
}

#[tokio::test]
async fn producer_errors_reach_every_waiter() {
    let h = TestHarness::new();
    h.executor.fail("skills list", "exit status 1");
    let core = h.core().await;

    let (a, b) = tokio::join!(core.backend().skills_index(), core.backend().skills_index());
    assert_eq!(a.unwrap_err(), OpsError::UpstreamFailed("exit status 1".into()));
    assert!(b.is_err());
    assert!(core.backend().cache().peek("skills-index").is_none());
}

#[tokio::test]
async fn cron_list_falls_back_to_stale_copy() {
    let h = TestHarness::new();
    h.executor.on_json("cron list", cron_list(vec![cron_job("c1", "backup"), cron_job("c2", "report")]));
    let core = h.core().await;

    let fresh = core.crons().await;
    assert_eq!(fresh.jobs.len(), 2);
    assert!(!fresh.meta.degraded);

    h.executor.fail("cron list", "gateway timeout after 60000ms");
    h.advance(Duration::from_secs(31));
    let stale = core.crons().await;
    assert_eq!(stale.jobs.len(), 2);
    assert!(stale.meta.degraded);
    assert!(stale.meta.stale);
    assert_eq!(stale.meta.error.as_deref(), Some("gateway timeout while fetching cron list"));
}

#[tokio::test]
async fn cron_list_without_cache_is_empty_and_degraded() {
    let h = TestHarness::new();
    h.executor.on_text("cron list", "not json at all");
    let core = h.core().await;

    let list = core.crons().await;
    assert!(list.jobs.is_empty());
    assert!(list.meta.degraded);
    assert!(!list.meta.stale);
    assert_eq!(list.meta.error.as_deref(), Some("invalid cron list response"));
}

#[tokio::test]
async fn lookups_validate_and_report_missing_items() {
    let h = TestHarness::new();
    h.executor.on_json("cron list", cron_list(vec![cron_job("c1", "backup")]));
    h.executor.on_json(
        "status --json",
        StatusBuilder::new().session("agent:main:direct:abc", 1_000, 10.0, h.now_ms()).build(),
    );
    let core = h.core().await;

    assert_eq!(core.cron("c1").await.unwrap().name, "backup");
    assert!(matches!(core.cron("nope").await, Err(OpsError::NotFound(_))));
    assert!(matches!(core.cron("bad id!").await, Err(OpsError::Validation(_))));

    assert_eq!(core.session("agent:main:direct:abc").await.unwrap().agent_id, "main");
    assert!(matches!(core.session("agent:main:missing").await, Err(OpsError::NotFound(_))));
    assert!(matches!(core.session("garbage").await, Err(OpsError::Validation(_))));
}

#[tokio::test]
async fn summary_is_cached_and_reports_degraded_crons() {
    let h = TestHarness::new();
    h.executor.on_json("status --json", StatusBuilder::new().host("box", "2026.3.1").agent("main").build());
    h.executor.on_text("--version", "openclaw 2026.3.2-1");
    h.executor.fail("cron list", "gateway timeout");
    let core = h.core().await;

    let summary = core.summary().await.unwrap();
    assert_eq!(summary.backend.version, "2026.3.2-1");
    assert_eq!(summary.backend.host, "box");
    assert!(summary.backend.cron_degraded);
    assert_eq!(summary.backend.agents.len(), 1);

    core.summary().await.unwrap();
    assert_eq!(h.executor.count("--version"), 1);
}

#[tokio::test]
async fn wrongly_shaped_cron_list_falls_back_to_the_last_good_one() {
    let h = TestHarness::new();
    h.executor.on_json("cron list", cron_list(vec![cron_job("c1", "backup")]));
    let core = h.core().await;
    assert_eq!(core.crons().await.jobs.len(), 1);

    h.executor.on_json("cron list", json!({ "jobs": { "c1": "backup" } }));
    h.advance(Duration::from_secs(31));
    let list = core.crons().await;
    assert_eq!(list.jobs[0].id, "c1");
    assert!(list.meta.stale);
    assert_eq!(list.meta.error.as_deref(), Some("invalid cron list response"));
}
