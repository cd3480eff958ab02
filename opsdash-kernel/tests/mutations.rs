use opsdash_devkit::TestHarness;
use opsdash_kernel::ops_core::OperatorNote;
use opsdash_kernel::triage::{TriageKind, TriagePatch, TriageStatus};
use opsdash_kernel::OpsError;
use std::time::Duration;

fn note(title: &str) -> OperatorNote {
    OperatorNote { title: title.into(), ..Default::default() }
}

#[tokio::test]
async fn forty_first_mutation_in_a_window_is_rejected() {
    let h = TestHarness::new();
    let core = h.core().await;
    let alice = TestHarness::operator("alice");

    for i in 0..40 {
        core.add_operator_note(&alice, note(&format!("n{i}"))).await.unwrap();
    }
    let err = core.add_operator_note(&alice, note("one too many")).await.unwrap_err();
    assert_eq!(err, OpsError::RateLimited);

    // other identities have their own bucket
    core.add_operator_note(&TestHarness::operator("bob"), note("bob")).await.unwrap();

    h.advance(Duration::from_secs(61));
    core.add_operator_note(&alice, note("after reset")).await.unwrap();
}

#[tokio::test]
async fn viewers_cannot_mutate_but_still_spend_budget() {
    let h = TestHarness::new();
    let core = h.core().await;
    let eve = TestHarness::viewer("eve");

    let err = core
        .set_triage(&eve, TriageKind::Alert, "cron:c1", TriagePatch::status(TriageStatus::Ack))
        .await
        .unwrap_err();
    assert_eq!(err, OpsError::Forbidden);
    assert!(core.triage_get(TriageKind::Alert, "cron:c1").is_err());
    assert_eq!(core.limiter().bucket(&eve).map(|b| b.count), Some(1));
}

#[tokio::test]
async fn empty_inputs_are_validation_errors() {
    let h = TestHarness::new();
    let core = h.core().await;
    let alice = TestHarness::operator("alice");

    let err = core.set_triage(&alice, TriageKind::Alert, "  ", TriagePatch::default()).await.unwrap_err();
    assert!(matches!(err, OpsError::Validation(_)));
    let err = core.add_operator_note(&alice, note("")).await.unwrap_err();
    assert!(matches!(err, OpsError::Validation(_)));
}

#[tokio::test]
async fn mutations_are_audited_for_admins() {
    let h = TestHarness::new();
    let core = h.core().await;
    let alice = TestHarness::operator("alice");
    let eve = TestHarness::viewer("eve");

    core.add_operator_note(&alice, note("deploy")).await.unwrap();
    let _ = core.set_triage(&eve, TriageKind::Intel, "x", TriagePatch::default()).await;

    assert_eq!(core.audit_tail(&alice, 10).await.unwrap_err(), OpsError::Forbidden);

    let entries = core.audit_tail(&TestHarness::admin("root"), 10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, "triage.set");
    assert!(!entries[0].ok);
    assert_eq!(entries[0].note, "forbidden");
    assert_eq!(entries[1].action, "operator.note");
    assert!(entries[1].ok);
    assert_eq!(entries[1].user, "alice");
}

#[tokio::test]
async fn health_counts_live_tables() {
    let h = TestHarness::new();
    let core = h.core().await;
    core.add_operator_note(&TestHarness::operator("alice"), note("hello")).await.unwrap();
    core.set_triage(
        &TestHarness::operator("alice"),
        TriageKind::Alert,
        "ok:system-health",
        TriagePatch::status(TriageStatus::Ack),
    )
    .await
    .unwrap();

    let health = core.health();
    assert_eq!(health.triage_records, 1);
    assert_eq!(health.buffered_events, 2);
    assert_eq!(health.fix_operations, 0);
}
