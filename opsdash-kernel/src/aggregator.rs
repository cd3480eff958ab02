/**
 * AGGREGATOR - Alerts, recommendations and predictions from live signals
 *
 * ROLE :
 * Turns one gathered `SignalSet` into ranked, deduplicated, triage-annotated
 * lists for the dashboard. Holds no state of its own.
 *
 * FONCTIONNEMENT :
 * 1. map raw signals to drafts (kind, severity, title, details, natural ref)
 * 2. dedup on "<kind>:<ref or title>", first occurrence wins
 * 3. fill impact / nextStep from fixed tables
 * 4. join triage state (alert or intel)
 * 5. stable sort by severity, synthetic entry when empty, cap the length
 */

use serde::Serialize;
use std::collections::HashMap;

use crate::backend::{CronList, SourceMeta};
use crate::clock::human_duration;
use crate::signals::{CronJob, Session, StatusPayload};
use crate::tasks::ActiveTask;
use crate::triage::{TriageKind, TriageRecord, TriageStore};

const MAX_ALERTS: usize = 24;
const MAX_INTEL: usize = 12;
const MAX_PER_SIGNAL: usize = 8;
const HIGH_CONTEXT_PCT: f64 = 80.0;
const ELEVATED_CONTEXT_PCT: f64 = 65.0;
const ABORTED_RUN_WINDOW_MS: i64 = 12 * 3_600_000;

/// Everything one aggregation pass reads, gathered up front.
#[derive(Debug, Clone, Default)]
pub struct SignalSet {
    pub status: StatusPayload,
    pub status_meta: SourceMeta,
    pub crons: Vec<CronJob>,
    pub crons_meta: SourceMeta,
    pub sessions: Vec<Session>,
    pub tasks: Vec<ActiveTask>,
    pub now_ms: i64,
}

impl SignalSet {
    pub fn with_crons(mut self, crons: CronList) -> Self {
        self.crons = crons.jobs;
        self.crons_meta = crons.meta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::Warning => 3,
            Severity::Info => 2,
            Severity::Ok => 1,
        }
    }

    fn impact(&self) -> &'static str {
        match self {
            Severity::Critical => "High user/business impact",
            Severity::Warning => "Medium operational impact",
            Severity::Info => "Low immediate impact",
            Severity::Ok => "No immediate impact",
        }
    }
}

/// Natural identifiers an alert may point at.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl AlertRefs {
    fn natural_id(&self) -> Option<&str> {
        [&self.task_id, &self.cron_id, &self.session_key, &self.check_id, &self.job_id]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub details: String,
    pub key: String,
    pub impact: String,
    pub next_step: String,
    pub triage: Option<TriageRecord>,
    #[serde(flatten)]
    pub refs: AlertRefs,
    /// Occurrences folded into this entry, not exposed.
    #[serde(skip)]
    pub repeat_count: u32,
}

impl Alert {
    fn draft(kind: &str, severity: Severity, title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            severity,
            title: title.into(),
            details: details.into(),
            key: String::new(),
            impact: String::new(),
            next_step: String::new(),
            triage: None,
            refs: AlertRefs::default(),
            repeat_count: 1,
        }
    }

    fn refs(mut self, refs: AlertRefs) -> Self {
        self.refs = refs;
        self
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind, self.refs.natural_id().unwrap_or(self.title.as_str()))
    }
}

fn next_step_for(kind: &str) -> &'static str {
    match kind {
        "cron" => "Open run history and run once manually",
        "security" => "Apply remediation and re-run security audit",
        "task-sla" => "Check active task timeline and decide: wait, steer or stop",
        _ => "Review details and take next action",
    }
}

fn cron_label(job: &CronJob) -> String {
    if job.name == job.id {
        job.name.clone()
    } else {
        format!("{} ({})", job.name, job.id)
    }
}

fn security_alerts(status: &StatusPayload) -> Vec<Alert> {
    let issues = status.security_issues();
    let mut out = Vec::new();
    if let Some(first) = issues.first() {
        let details = [first.detail.as_deref(), first.remediation.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" · ");
        let severity = if first.severity() == "critical" { Severity::Critical } else { Severity::Warning };
        let details = if details.is_empty() { format!("{} issue(s) in security audit", issues.len()) } else { details };
        out.push(
            Alert::draft(
                "security",
                severity,
                format!("Security: {}", first.title.as_deref().unwrap_or("Warning")),
                details,
            )
            .refs(AlertRefs {
                check_id: first.check_id.clone(),
                remediation: first.remediation.clone(),
                ..Default::default()
            }),
        );
        if issues.len() > 1 {
            out.push(Alert::draft(
                "security-summary",
                Severity::Warning,
                "Security warnings detected",
                format!("{} warning(s) in security audit", issues.len()),
            ));
        }
        return out;
    }

    let critical = status.security_critical();
    if critical > 0 {
        out.push(Alert::draft(
            "security-summary",
            Severity::Critical,
            "Critical security findings",
            format!("{critical} critical issue(s) in security audit"),
        ));
    }
    let warn = status.security_warn();
    if warn > 0 {
        out.push(Alert::draft(
            "security-summary",
            Severity::Warning,
            "Security warnings detected",
            format!("{warn} warning(s) in security audit"),
        ));
    }
    out
}

fn context_tier(sessions: &[Session], min: f64, max: f64, severity: Severity, title: &str) -> Vec<Alert> {
    sessions
        .iter()
        .filter(|s| s.percent_used.map(|p| p >= min && p < max).unwrap_or(false))
        .take(MAX_PER_SIGNAL)
        .map(|s| {
            Alert::draft(
                "context",
                severity,
                title,
                format!("{} at {}% ({})", s.agent_id, s.percent_used.unwrap_or_default(), s.model),
            )
            .refs(AlertRefs { session_key: Some(s.key.clone()), ..Default::default() })
        })
        .collect()
}

fn context_alerts(sessions: &[Session]) -> Vec<Alert> {
    let mut out = context_tier(sessions, HIGH_CONTEXT_PCT, f64::INFINITY, Severity::Warning, "High context usage");
    out.extend(context_tier(sessions, ELEVATED_CONTEXT_PCT, HIGH_CONTEXT_PCT, Severity::Info, "Elevated context usage"));
    out
}

fn raw_alerts(signals: &SignalSet) -> Vec<Alert> {
    let mut alerts = security_alerts(&signals.status);

    if signals.status_meta.degraded {
        alerts.push(Alert::draft(
            "status-api",
            Severity::Warning,
            "Status API temporarily unavailable",
            signals.status_meta.error.clone().unwrap_or_else(|| "status read failed".into()),
        ));
    }
    if signals.crons_meta.degraded {
        alerts.push(Alert::draft(
            "cron-api",
            Severity::Warning,
            "Cron API temporarily unavailable",
            signals.crons_meta.error.clone().unwrap_or_else(|| "cron list failed".into()),
        ));
    }

    for job in signals.crons.iter().filter(|j| j.is_failing()).take(MAX_PER_SIGNAL) {
        alerts.push(
            Alert::draft(
                "cron",
                Severity::Warning,
                format!("Cron issue: {}", job.name),
                format!("agent={}, errors={}, status={}", job.agent_id, job.consecutive_errors, job.last_status),
            )
            .refs(AlertRefs {
                cron_id: Some(job.id.clone()),
                agent_id: Some(job.agent_id.clone()),
                cron_name: Some(job.name.clone()),
                ..Default::default()
            }),
        );
    }

    alerts.extend(context_alerts(&signals.sessions));

    for s in signals
        .sessions
        .iter()
        .filter(|s| s.aborted_last_run && s.age_ms < ABORTED_RUN_WINDOW_MS)
        .take(MAX_PER_SIGNAL)
    {
        alerts.push(
            Alert::draft("session", Severity::Warning, "Recent aborted run", format!("{}: {}", s.agent_id, s.key))
                .refs(AlertRefs { session_key: Some(s.key.clone()), ..Default::default() }),
        );
    }

    for task in signals.tasks.iter().filter(|t| t.is_running()) {
        let elapsed = (signals.now_ms - task.created_at_ms).max(0);
        if elapsed < task.task_type.sla_ms() {
            continue;
        }
        alerts.push(
            Alert::draft(
                "task-sla",
                Severity::Warning,
                format!("Long running task: {}", task.title),
                format!(
                    "type={}, duration={}, step={}",
                    task.task_type.as_str(),
                    human_duration(elapsed),
                    if task.step.is_empty() { "unknown" } else { task.step.as_str() }
                ),
            )
            .refs(AlertRefs { task_id: Some(task.id.clone()), ..Default::default() }),
        );
    }
    alerts
}

/// Folds drafts sharing a key into the first one, preserving order.
fn dedup_alerts(drafts: Vec<Alert>) -> Vec<Alert> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Alert> = Vec::new();
    for mut alert in drafts {
        let key = alert.dedup_key();
        match index.get(&key) {
            Some(&i) => out[i].repeat_count += 1,
            None => {
                alert.key = key.clone();
                index.insert(key, out.len());
                out.push(alert);
            }
        }
    }
    out
}

pub fn collect_alerts(signals: &SignalSet, triage: &TriageStore) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = dedup_alerts(raw_alerts(signals))
        .into_iter()
        .map(|mut a| {
            if a.impact.is_empty() {
                a.impact = a.severity.impact().to_string();
            }
            if a.next_step.is_empty() {
                a.next_step = next_step_for(&a.kind).to_string();
            }
            a.triage = triage.get(TriageKind::Alert, &a.key);
            a
        })
        .collect();

    alerts.sort_by(|a, b| b.severity.rank().cmp(&a.severity.rank()));

    if alerts.is_empty() {
        let mut healthy = Alert::draft("ok", Severity::Ok, "System healthy", "No critical signals right now");
        healthy.key = "ok:system-health".into();
        healthy.impact = Severity::Ok.impact().into();
        healthy.next_step = "Continue monitoring".into();
        healthy.triage = triage.get(TriageKind::Alert, &healthy.key);
        alerts.push(healthy);
    }
    alerts.truncate(MAX_ALERTS);
    alerts
}

// ---- intelligence --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionLevel {
    Ok,
    Risk,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub priority: Priority,
    pub title: String,
    pub action: String,
    pub key: String,
    pub impact: String,
    pub next_step: String,
    pub triage: Option<TriageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub level: PredictionLevel,
    pub title: String,
    pub confidence: f64,
    pub key: String,
    pub impact: String,
    pub next_step: String,
    pub triage: Option<TriageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Intelligence {
    pub recommendations: Vec<Recommendation>,
    pub predictions: Vec<Prediction>,
}

fn intel_key(kind: Option<&str>, fallback_kind: &str, natural: Option<&str>, title: &str) -> String {
    format!("{}:{}", kind.unwrap_or(fallback_kind), natural.unwrap_or(title))
}

fn recommendation(kind: Option<&str>, priority: Priority, title: String, action: &str) -> Recommendation {
    Recommendation {
        kind: kind.map(str::to_string),
        priority,
        title,
        action: action.to_string(),
        key: String::new(),
        impact: String::new(),
        next_step: String::new(),
        triage: None,
        job_id: None,
        agent_id: None,
        check_id: None,
    }
}

fn prediction(kind: Option<&str>, level: PredictionLevel, title: String, confidence: f64, job_id: Option<String>) -> Prediction {
    Prediction {
        kind: kind.map(str::to_string),
        level,
        title,
        confidence,
        key: String::new(),
        impact: String::new(),
        next_step: String::new(),
        triage: None,
        job_id,
    }
}

pub fn collect_intelligence(signals: &SignalSet, triage: &TriageStore) -> Intelligence {
    let mut recs = Vec::new();
    let mut preds = Vec::new();

    for job in &signals.crons {
        let label = cron_label(job);
        if job.consecutive_errors >= 2 {
            let mut rec = recommendation(
                Some("cron"),
                Priority::High,
                format!("Fix unstable cron: {label}"),
                &format!("Review logs and run manually; if still failing, disable temporarily (id={}).", job.id),
            );
            rec.job_id = Some(job.id.clone());
            rec.agent_id = Some(job.agent_id.clone());
            recs.push(rec);
            preds.push(prediction(
                Some("cron"),
                PredictionLevel::Risk,
                format!("Likely to fail again soon: {label}"),
                0.78,
                Some(job.id.clone()),
            ));
        } else if job.last_status == "error" {
            let mut rec = recommendation(
                Some("cron"),
                Priority::Medium,
                format!("Investigate recent error: {label}"),
                "Open run history, inspect summary, then run once manually.",
            );
            rec.job_id = Some(job.id.clone());
            rec.agent_id = Some(job.agent_id.clone());
            recs.push(rec);
        }
    }

    if signals.status.security_warn() > 0 {
        let first_warn = signals
            .status
            .security_audit
            .findings
            .iter()
            .find(|f| f.severity() == "warn");
        let mut rec = recommendation(
            Some("security"),
            Priority::High,
            "Close security warning debt".into(),
            "Address security audit warnings to reduce exploit surface.",
        );
        rec.check_id = first_warn.and_then(|f| f.check_id.clone());
        recs.push(rec);
    }

    if signals.status_meta.degraded {
        recs.push(recommendation(
            Some("status-api"),
            Priority::High,
            "Status API temporarily unavailable".into(),
            "Check gateway responsiveness. Session, security and agent widgets may show stale data.",
        ));
    }

    if signals.crons_meta.degraded {
        recs.push(recommendation(
            Some("cron-api"),
            Priority::High,
            "Cron API temporarily unavailable".into(),
            "Check gateway responsiveness and retry cron list. Dashboard is in degraded mode for cron-dependent widgets.",
        ));
        preds.push(prediction(
            Some("cron-api"),
            PredictionLevel::Risk,
            "Cron-based checks may be incomplete".into(),
            0.88,
            None,
        ));
    }

    if recs.is_empty() {
        recs.push(recommendation(
            None,
            Priority::Low,
            "No urgent maintenance tasks".into(),
            "Keep monitoring and review weekly trends.",
        ));
    }
    if preds.is_empty() {
        preds.push(prediction(None, PredictionLevel::Ok, "No near-term failure hotspots detected".into(), 0.66, None));
    }

    let mut seen = std::collections::HashSet::new();
    let recommendations = recs
        .into_iter()
        .map(|mut r| {
            let natural = r.job_id.clone().or_else(|| r.check_id.clone());
            r.key = intel_key(r.kind.as_deref(), "recommendation", natural.as_deref(), &r.title);
            r
        })
        .filter(|r| seen.insert(r.key.clone()))
        .take(MAX_INTEL)
        .map(|mut r| {
            r.impact = match r.priority {
                Priority::High => "High operational impact",
                Priority::Medium => "Medium operational impact",
                Priority::Low => "Low immediate impact",
            }
            .into();
            r.next_step = if r.action.is_empty() { "Review and decide action".into() } else { r.action.clone() };
            r.triage = triage.get(TriageKind::Intel, &r.key);
            r
        })
        .collect();

    let mut seen = std::collections::HashSet::new();
    let predictions = preds
        .into_iter()
        .map(|mut p| {
            p.key = intel_key(p.kind.as_deref(), "prediction", p.job_id.as_deref(), &p.title);
            p
        })
        .filter(|p| seen.insert(p.key.clone()))
        .take(MAX_INTEL)
        .map(|mut p| {
            let risk = p.level == PredictionLevel::Risk;
            p.impact = if risk { "Potential reliability risk" } else { "No immediate risk" }.into();
            p.next_step = if risk { "Watch this area and prepare mitigation" } else { "Keep monitoring" }.into();
            p.triage = triage.get(TriageKind::Intel, &p.key);
            p
        })
        .collect();

    Intelligence { recommendations, predictions }
}
