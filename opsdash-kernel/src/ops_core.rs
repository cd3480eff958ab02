/**
 * OPS CORE - Single entry point wiring every table of the dashboard
 *
 * ROLE :
 * Owns the cache, the stores and the orchestrator, and exposes each dashboard
 * operation as one method. The HTTP adapter only routes and encodes.
 *
 * FONCTIONNEMENT :
 * - Built once from the config, a command executor and a clock
 * - Reads gather a SignalSet (status, crons, sessions, tasks) then aggregate
 * - Mutations go through authorize_mutation (rate limit, then role) and are audited
 * - Backend mutations drop the cache entries they make stale and log an operator event
 * - Summary has its own short-lived cache entry ("summary-api")
 */

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::aggregator::{collect_alerts, collect_intelligence, Alert, Intelligence, SignalSet};
use crate::audit::{AuditEntry, AuditTrail};
use crate::backend::{validate_agent_id, BackendClient, CronAction, CronList, CronPatch, KEY_CRONS, KEY_STATUS};
use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::config::DashboardConfig;
use crate::error::{OpsError, OpsResult};
use crate::events::{EventLevel, NewEvent, OperatorEvent, OperatorEventLog};
use crate::executor::{extract_json, SharedExecutor};
use crate::fix_ops::{FixEvent, FixOperationView, FixOrchestrator, FixRequest};
use crate::health::{HealthTracker, KernelHealth, TableSizes};
use crate::identity::{Identity, Role};
use crate::rate_limit::MutationRateLimiter;
use crate::review::{self, OperatorNow, Timeline, WeeklyReview};
use crate::signals::{CronJob, Session, Skill, UsageReport};
use crate::summary::{build_summary, Summary};
use crate::tasks::{collect_active_tasks, ActiveTask};
use crate::triage::{TriageKind, TriagePatch, TriageRecord, TriageStore};

pub const KEY_SUMMARY: &str = "summary-api";

const SESSION_LIST_LIMIT: usize = 80;

/// Roles allowed to triage, write notes and start fixes.
pub const OPERATORS: &[Role] = &[Role::Operator, Role::Admin];
pub const ADMINS: &[Role] = &[Role::Admin];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorNote {
    pub title: String,
    pub details: String,
    pub level: Option<String>,
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReplay {
    pub id: String,
    pub title: String,
    pub status: String,
    pub step: String,
    pub events: Vec<FixEvent>,
}

/// Body of a cron edit: the job id plus the fields to change.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CronUpdate {
    pub id: String,
    #[serde(flatten)]
    pub patch: CronPatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct CronActionResult {
    pub action: &'static str,
    pub id: String,
    pub output: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModelResult {
    pub key: String,
    pub model: Option<String>,
}

fn wants_agent(agent_id: Option<&str>) -> OpsResult<Option<&str>> {
    match agent_id.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(id) => validate_agent_id(id).map(Some),
    }
}

pub struct OpsCore {
    config: DashboardConfig,
    clock: SharedClock,
    started_at_ms: i64,
    events: Arc<OperatorEventLog>,
    triage: TriageStore,
    audit: AuditTrail,
    limiter: MutationRateLimiter,
    backend: Arc<BackendClient>,
    summaries: TtlCache<Summary>,
    fixes: FixOrchestrator,
    health: HealthTracker,
}

impl OpsCore {
    /// Opens the persisted tables under `config.data_dir` and wires the rest in memory.
    pub async fn open(config: DashboardConfig, executor: SharedExecutor, clock: SharedClock) -> Self {
        let events = Arc::new(OperatorEventLog::open(config.events_file(), clock.clone()).await);
        let triage = TriageStore::load(config.triage_file(), events.clone(), clock.clone()).await;
        let audit = AuditTrail::new(config.audit_file(), clock.clone());
        let limiter =
            MutationRateLimiter::new(config.limits.mutations_per_window, config.limits.window(), clock.clone());
        let cache = Arc::new(TtlCache::new(clock.clone()));
        let backend = Arc::new(BackendClient::new(&config.backend, config.cache.clone(), executor.clone(), cache));
        let fixes = FixOrchestrator::new(
            config.fix.clone(),
            config.backend.bin.clone(),
            executor,
            events.clone(),
            clock.clone(),
        );

        info!(
            "[kernel] core ready: {} triage records, {} buffered events, data in {:?}",
            triage.len(),
            events.len(),
            config.data_dir
        );

        Self {
            started_at_ms: clock.now_ms(),
            summaries: TtlCache::new(clock.clone()),
            health: HealthTracker::new(),
            config,
            clock,
            events,
            triage,
            audit,
            limiter,
            backend,
            fixes,
        }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn events(&self) -> &OperatorEventLog {
        &self.events
    }

    pub fn triage(&self) -> &TriageStore {
        &self.triage
    }

    pub fn fixes(&self) -> &FixOrchestrator {
        &self.fixes
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn limiter(&self) -> &MutationRateLimiter {
        &self.limiter
    }

    /// Rate check first so that rejected attempts still consume the budget.
    pub fn authorize_mutation(&self, who: &Identity, allowed: &[Role]) -> OpsResult<()> {
        self.limiter.check(who)?;
        who.require_role(allowed)
    }

    async fn audited<T>(&self, who: &Identity, action: &str, payload: Value, result: OpsResult<T>) -> OpsResult<T> {
        let note = match &result {
            Ok(_) => String::new(),
            Err(e) => e.to_string(),
        };
        self.audit.record(who, action, result.is_ok(), &note, payload).await;
        result
    }

    // ---- reads ----

    pub async fn summary(&self) -> OpsResult<Summary> {
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let started_at_ms = self.started_at_ms;
        self.summaries
            .get(KEY_SUMMARY, Duration::from_secs(self.config.cache.summary_ttl_secs), move || async move {
                let (snapshot, crons, version) =
                    tokio::join!(backend.status_snapshot(), backend.crons(), backend.cli_version());
                let version = version.unwrap_or_else(|e| {
                    debug!("[kernel] cli version unavailable: {}", e);
                    None
                });
                Ok(build_summary(&snapshot, &crons, version, started_at_ms, clock.now_ms()))
            })
            .await
    }

    /// One consistent read of every signal source. Never fails: degraded
    /// sources are carried in the metas.
    pub async fn signals(&self) -> SignalSet {
        let (snapshot, crons) = tokio::join!(self.backend.status_snapshot(), self.backend.crons());
        let now_ms = self.clock.now_ms();
        let sessions = snapshot.status.sessions();
        let tasks = collect_active_tasks(&self.fixes.snapshot(), &sessions, now_ms);
        SignalSet {
            status: snapshot.status,
            status_meta: snapshot.meta,
            sessions,
            tasks,
            now_ms,
            ..Default::default()
        }
        .with_crons(crons)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        collect_alerts(&self.signals().await, &self.triage)
    }

    pub async fn intelligence(&self) -> Intelligence {
        collect_intelligence(&self.signals().await, &self.triage)
    }

    pub async fn active_tasks(&self) -> Vec<ActiveTask> {
        let sessions = self.backend.sessions().await;
        collect_active_tasks(&self.fixes.snapshot(), &sessions, self.clock.now_ms())
    }

    pub async fn replay_task(&self, id: &str) -> OpsResult<TaskReplay> {
        let id = id.trim();
        if id.is_empty() {
            return Err(OpsError::Validation("missing task id".into()));
        }
        if let Some(op) = self.fixes.find(id) {
            return Ok(TaskReplay {
                id: op.id,
                title: op.title,
                status: json_label(&op.status),
                step: op.step.to_string(),
                events: op.events,
            });
        }
        self.active_tasks()
            .await
            .into_iter()
            .find(|t| t.id == id)
            .map(|t| TaskReplay { status: json_label(&t.status), id: t.id, title: t.title, step: t.step, events: t.events })
            .ok_or_else(|| OpsError::NotFound("task not found".into()))
    }

    pub async fn operator_now(&self) -> OperatorNow {
        let tasks = self.active_tasks().await;
        review::operator_now(&tasks, &self.events, self.clock.now_ms())
    }

    pub async fn timeline(&self) -> Timeline {
        let tasks = self.active_tasks().await;
        review::timeline(&self.events, &tasks, self.clock.now_ms())
    }

    pub fn weekly_review(&self) -> WeeklyReview {
        review::weekly_review(&self.events, &self.triage, self.clock.now_ms())
    }

    pub async fn crons(&self) -> CronList {
        self.backend.crons().await
    }

    pub async fn cron(&self, id: &str) -> OpsResult<CronJob> {
        self.backend.cron(id).await
    }

    pub async fn session(&self, key: &str) -> OpsResult<Session> {
        self.backend.session(key).await
    }

    /// Sessions of one agent (or all), freshest first, optionally filtered by `q`.
    pub async fn sessions(&self, agent_id: Option<&str>, q: &str) -> OpsResult<Vec<Session>> {
        let agent = wants_agent(agent_id)?;
        let q = q.trim().to_lowercase();
        let mut sessions: Vec<Session> = self
            .backend
            .sessions()
            .await
            .into_iter()
            .filter(|s| agent.map_or(true, |a| s.agent_id == a))
            .filter(|s| q.is_empty() || format!("{} {} {}", s.key, s.agent_id, s.model).to_lowercase().contains(&q))
            .collect();
        sessions.sort_by_key(|s| s.age_ms);
        sessions.truncate(SESSION_LIST_LIMIT);
        Ok(sessions)
    }

    pub async fn cron_runs(&self, id: &str, limit: Option<usize>) -> OpsResult<Value> {
        self.backend.cron_runs(id, limit).await
    }

    pub async fn usage(&self) -> OpsResult<UsageReport> {
        self.backend.usage().await
    }

    pub async fn skills(&self, agent_id: Option<&str>, q: &str) -> OpsResult<Vec<Skill>> {
        let agent = wants_agent(agent_id)?;
        let mut skills: Vec<Skill> = self
            .backend
            .skills()
            .await?
            .into_iter()
            .filter(|s| agent.map_or(true, |a| s.agent_id == a || s.agent_id == "system"))
            .filter(|s| s.matches(q))
            .collect();
        skills.sort_by(|a, b| (&a.agent_id, &a.name).cmp(&(&b.agent_id, &b.name)));
        Ok(skills)
    }

    pub fn triage_list(&self, kind: Option<TriageKind>) -> Vec<TriageRecord> {
        self.triage.list(kind).into_values().collect()
    }

    pub fn triage_get(&self, kind: TriageKind, key: &str) -> OpsResult<TriageRecord> {
        self.triage
            .get(kind, key)
            .ok_or_else(|| OpsError::NotFound(TriageStore::store_key(kind, key)))
    }

    pub fn fix_status(&self, id: &str) -> OpsResult<FixOperationView> {
        self.fixes.get(id)
    }

    pub fn fix_list(&self) -> Vec<FixOperationView> {
        self.fixes.list()
    }

    pub fn health(&self) -> KernelHealth {
        self.health.get_health(TableSizes {
            cache_entries: self.backend.cache().len() + self.summaries.len(),
            fix_operations: self.fixes.len(),
            triage_records: self.triage.len(),
            buffered_events: self.events.len(),
        })
    }

    pub async fn audit_tail(&self, who: &Identity, limit: usize) -> OpsResult<Vec<AuditEntry>> {
        who.require_role(ADMINS)?;
        Ok(self.audit.tail(limit.clamp(1, 500)).await)
    }

    // ---- mutations ----

    pub async fn set_triage(
        &self,
        who: &Identity,
        kind: TriageKind,
        key: &str,
        patch: TriagePatch,
    ) -> OpsResult<TriageRecord> {
        let payload = json!({ "kind": kind.as_str(), "key": key, "patch": patch });
        let result = match self.authorize_mutation(who, OPERATORS) {
            Ok(()) => self.triage.set(kind, key, patch, who).await,
            Err(e) => Err(e),
        };
        self.audited(who, "triage.set", payload, result).await
    }

    pub async fn add_operator_note(&self, who: &Identity, note: OperatorNote) -> OpsResult<OperatorEvent> {
        let payload = json!({ "title": note.title });
        let result = self.authorize_mutation(who, OPERATORS).and_then(|()| {
            let title = note.title.trim();
            if title.is_empty() && note.details.trim().is_empty() {
                return Err(OpsError::Validation("empty note".into()));
            }
            let title = if title.is_empty() { "Operator note" } else { title };
            let level = note.level.as_deref().map(EventLevel::parse).unwrap_or_default();
            Ok(self.events.log(
                NewEvent::new("operator-note", level, title)
                    .actor(who.user.clone())
                    .details(note.details.trim())
                    .meta(note.meta.clone().unwrap_or_else(|| json!({}))),
            ))
        });
        self.audited(who, "operator.note", payload, result).await
    }

    pub async fn start_fix(&self, who: &Identity, request: FixRequest) -> OpsResult<FixOperationView> {
        let (source, kind, title) = request.identity();
        let payload = json!({ "source": source, "kind": kind, "title": title });
        let result = self.authorize_mutation(who, OPERATORS).map(|()| self.fixes.start(request, who));
        self.audited(who, "ai.fix.start", payload, result).await
    }

    /// Drops the named entries from both the backend and the summary caches.
    pub fn invalidate(&self, keys: &[&str]) {
        self.backend.cache().invalidate(keys);
        self.summaries.invalidate(keys);
    }

    async fn cron_command(
        &self,
        who: &Identity,
        action: CronAction,
        id: &str,
        allowed: &[Role],
    ) -> OpsResult<CronActionResult> {
        let payload = json!({ "id": id });
        let result = match self.authorize_mutation(who, allowed) {
            Ok(()) => self.backend.cron_action(action, id).await,
            Err(e) => Err(e),
        };
        let result = result.map(|out| {
            self.invalidate(&[KEY_CRONS, KEY_STATUS]);
            let id = id.trim().to_string();
            self.events.log(
                NewEvent::new("cron", action.event_level(), action.event_title())
                    .actor(who.user.clone())
                    .details(id.clone())
                    .meta(json!({ "action": action.label() })),
            );
            info!("[kernel] cron {} {} by {}", action.label(), id, who.user);
            CronActionResult {
                action: action.label(),
                id,
                output: extract_json(&out).unwrap_or_else(|_| Value::String(out)),
            }
        });
        self.audited(who, action.audit_action(), payload, result).await
    }

    pub async fn cron_run(&self, who: &Identity, id: &str) -> OpsResult<CronActionResult> {
        self.cron_command(who, CronAction::Run, id, OPERATORS).await
    }

    pub async fn cron_toggle(&self, who: &Identity, id: &str, enabled: bool) -> OpsResult<CronActionResult> {
        let action = if enabled { CronAction::Enable } else { CronAction::Disable };
        self.cron_command(who, action, id, OPERATORS).await
    }

    pub async fn cron_delete(&self, who: &Identity, id: &str) -> OpsResult<CronActionResult> {
        self.cron_command(who, CronAction::Remove, id, ADMINS).await
    }

    pub async fn cron_update(&self, who: &Identity, update: CronUpdate) -> OpsResult<Value> {
        let payload = json!({ "id": update.id, "patch": update.patch });
        let result = match self.authorize_mutation(who, OPERATORS) {
            Ok(()) => self.backend.update_cron(&update.id, &update.patch).await,
            Err(e) => Err(e),
        };
        let result = result.map(|res| {
            self.invalidate(&[KEY_CRONS, KEY_STATUS]);
            self.events.log(
                NewEvent::new("cron", EventLevel::Info, "Cron updated")
                    .actor(who.user.clone())
                    .details(update.id.trim())
                    .meta(json!({ "patch": update.patch })),
            );
            res
        });
        self.audited(who, "cron.update", payload, result).await
    }

    pub async fn set_session_model(&self, who: &Identity, key: &str, model: &str) -> OpsResult<SessionModelResult> {
        let payload = json!({ "key": key, "model": model });
        let result = match self.authorize_mutation(who, OPERATORS) {
            Ok(()) => self.backend.patch_session_model(key, model).await,
            Err(e) => Err(e),
        };
        let result = result.map(|model| {
            self.invalidate(&[KEY_STATUS, KEY_SUMMARY]);
            let key = key.trim().to_string();
            self.events.log(
                NewEvent::new("session", EventLevel::Info, "Session model changed")
                    .actor(who.user.clone())
                    .details(key.clone())
                    .meta(json!({ "model": model })),
            );
            SessionModelResult { key, model }
        });
        self.audited(who, "session.model", payload, result).await
    }

    /// Fills the slow cache entries in the background; failures are only logged.
    pub fn prewarm(self: &Arc<Self>) {
        let core = self.clone();
        tokio::spawn(async move {
            let (status, usage, skills, summary) = tokio::join!(
                core.backend.status(),
                core.backend.status_usage(),
                core.backend.skills_index(),
                core.summary()
            );
            for (name, err) in [
                ("status", status.err()),
                ("status-usage", usage.err()),
                ("skills", skills.err()),
                ("summary", summary.err()),
            ] {
                match err {
                    Some(e) => debug!("[kernel] prewarm {} failed: {}", name, e),
                    None => debug!("[kernel] prewarm {} ok", name),
                }
            }
        });
    }
}

fn json_label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => String::new(),
    }
}
