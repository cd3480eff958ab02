/**
 * FIX OPERATIONS - Asynchronous remediation jobs with estimated progress
 *
 * ROLE :
 * Launches one remediation command per issue through the agent CLI, tracks
 * it as a state machine and exposes it to polling callers.
 *
 * FONCTIONNEMENT :
 * - queued -> prepare -> diagnostics -> applying -> verification -> completed,
 *   or -> failed from any running step
 * - start() never blocks: the command runs in a spawned task, start returns the
 *   operation in `running`
 * - a running operation with the same (source, kind, title) is returned
 *   instead of launching a second one
 * - while the command is outstanding a ticker re-estimates progress from the
 *   elapsed share of the timeout budget (capped at 92%); reads re-estimate too,
 *   so a poll always sees progress as of the current clock
 * - the operation timeout is enforced lazily on every read
 * - retention pruning (age, then count) runs on start, list and status reads,
 *   never on a timer
 * - start / done / error are mirrored into the operator event log
 */

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{duration_ms, ms_to_rfc3339, SharedClock};
use crate::config::FixConf;
use crate::error::{OpsError, OpsResult};
use crate::events::{EventLevel, NewEvent, OperatorEventLog};
use crate::executor::{extract_json, sh_quote, SharedExecutor};
use crate::identity::Identity;
use crate::state::{new_state, Shared};

const OP_EVENT_LIMIT: usize = 40;
const VIEW_EVENT_LIMIT: usize = 12;
const PROGRESS_CEILING: u8 = 92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStep {
    Queued,
    Prepare,
    Diagnostics,
    Applying,
    Verification,
    Completed,
    Failed,
}

impl FixStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixStep::Queued => "queued",
            FixStep::Prepare => "prepare",
            FixStep::Diagnostics => "diagnostics",
            FixStep::Applying => "applying",
            FixStep::Verification => "verification",
            FixStep::Completed => "completed",
            FixStep::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, FixStep::Completed | FixStep::Failed)
    }

    /// Step implied by an estimated percentage once diagnostics has started.
    fn for_percent(pct: u8) -> FixStep {
        if pct >= 70 {
            FixStep::Verification
        } else if pct >= 45 {
            FixStep::Applying
        } else {
            FixStep::Diagnostics
        }
    }

    fn narration(&self) -> &'static str {
        match self {
            FixStep::Diagnostics => "Collecting diagnostics and problem context",
            FixStep::Applying => "Applying a safe fix",
            FixStep::Verification => "Verifying that the fix worked",
            _ => "Task progress updated",
        }
    }
}

impl fmt::Display for FixStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixEvent {
    pub ts: i64,
    pub level: EventLevel,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOperation {
    pub id: String,
    pub source: String,
    pub kind: String,
    pub title: String,
    pub status: FixStatus,
    pub step: FixStep,
    pub progress_percent: u8,
    pub eta_ms: Option<i64>,
    pub eta_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_by: String,
    pub error: Option<String>,
    pub result_text: Option<String>,
    pub events: Vec<FixEvent>,
}

impl FixOperation {
    fn new(id: String, source: String, kind: String, title: String, started_by: String, now: i64, timeout_ms: i64) -> Self {
        let mut op = Self {
            id,
            source,
            kind,
            title,
            status: FixStatus::Running,
            step: FixStep::Queued,
            progress_percent: 6,
            eta_ms: Some(timeout_ms),
            eta_at_ms: Some(now + timeout_ms),
            created_at_ms: now,
            updated_at_ms: now,
            started_by,
            error: None,
            result_text: None,
            events: Vec::new(),
        };
        op.push_event(now, EventLevel::Info, "Task queued");
        op
    }

    pub fn is_running(&self) -> bool {
        self.status == FixStatus::Running
    }

    fn push_event(&mut self, ts: i64, level: EventLevel, text: impl Into<String>) {
        self.events.push(FixEvent { ts, level, text: text.into() });
        if self.events.len() > OP_EVENT_LIMIT {
            let excess = self.events.len() - OP_EVENT_LIMIT;
            self.events.drain(..excess);
        }
    }

    fn set_eta(&mut self, eta_ms: Option<i64>, now: i64) {
        self.eta_ms = eta_ms.map(|e| e.max(0));
        self.eta_at_ms = self.eta_ms.map(|e| now + e);
    }

    /// Moves a running operation forward to a non-terminal step.
    /// Returns false (and changes nothing) for a finished operation or a backwards move.
    pub fn advance(&mut self, step: FixStep, percent: u8, eta_ms: Option<i64>, now: i64, text: &str) -> bool {
        if !self.is_running() || step.is_terminal() || step < self.step {
            return false;
        }
        self.step = step;
        self.progress_percent = self.progress_percent.max(percent.min(100));
        self.set_eta(eta_ms, now);
        self.push_event(now, EventLevel::Info, text);
        self.updated_at_ms = now;
        true
    }

    /// Re-estimates progress from elapsed time. Never lowers the percentage.
    pub fn tick(&mut self, now: i64, timeout_ms: i64) -> bool {
        if !self.is_running() || timeout_ms <= 0 {
            return false;
        }
        let elapsed = (now - self.created_at_ms).max(0);
        let raw = 18.0 + (elapsed as f64 / timeout_ms as f64) * 74.0;
        let estimate = raw.floor().clamp(0.0, PROGRESS_CEILING as f64) as u8;
        let pct = self.progress_percent.max(estimate);
        let next_step = FixStep::for_percent(pct).max(self.step);

        let previous = self.step;
        self.progress_percent = pct;
        self.step = next_step;
        self.set_eta(Some(timeout_ms - elapsed), now);
        self.updated_at_ms = now;
        if previous != next_step {
            self.push_event(now, EventLevel::Info, next_step.narration());
        }
        true
    }

    pub fn complete(&mut self, result_text: String, now: i64) -> bool {
        if !self.is_running() {
            return false;
        }
        self.status = FixStatus::Done;
        self.step = FixStep::Completed;
        self.progress_percent = 100;
        self.result_text = Some(result_text);
        self.set_eta(Some(0), now);
        self.push_event(now, EventLevel::Ok, "Fix completed");
        self.updated_at_ms = now;
        true
    }

    pub fn fail(&mut self, message: String, event_text: String, now: i64) -> bool {
        if !self.is_running() {
            return false;
        }
        self.status = FixStatus::Error;
        self.step = FixStep::Failed;
        self.progress_percent = self.progress_percent.max(95);
        self.error = Some(message);
        self.set_eta(None, now);
        self.push_event(now, EventLevel::Error, event_text);
        self.updated_at_ms = now;
        true
    }

    pub fn view(&self) -> FixOperationView {
        let skip = self.events.len().saturating_sub(VIEW_EVENT_LIMIT);
        FixOperationView {
            id: self.id.clone(),
            status: self.status,
            source: self.source.clone(),
            kind: self.kind.clone(),
            title: self.title.clone(),
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            started_by: self.started_by.clone(),
            error: self.error.clone(),
            result_text: self.result_text.clone(),
            step: self.step,
            progress_percent: self.progress_percent,
            eta_ms: self.eta_ms,
            eta_at: self.eta_at_ms.and_then(ms_to_rfc3339),
            events: self.events[skip..].to_vec(),
        }
    }
}

/// Polling representation: the last 12 events only, ETA as RFC3339.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOperationView {
    pub id: String,
    pub status: FixStatus,
    pub source: String,
    pub kind: String,
    pub title: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_by: String,
    pub error: Option<String>,
    pub result_text: Option<String>,
    pub step: FixStep,
    pub progress_percent: u8,
    pub eta_ms: Option<i64>,
    pub eta_at: Option<String>,
    pub events: Vec<FixEvent>,
}

/// Issue a fix is requested for, as sent by the dashboard (alert or recommendation fields).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixTarget {
    pub kind: Option<String>,
    pub title: Option<String>,
    pub details: Option<String>,
    pub cron_id: Option<String>,
    pub job_id: Option<String>,
    pub session_key: Option<String>,
    pub check_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixRequest {
    pub source: Option<String>,
    pub item: Option<FixTarget>,
    #[serde(flatten)]
    pub inline: FixTarget,
}

fn pick(values: [Option<&String>; 2], default: &str) -> String {
    values
        .into_iter()
        .flatten()
        .find(|v| !v.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

impl FixRequest {
    pub fn for_item(source: &str, item: FixTarget) -> Self {
        Self { source: Some(source.to_string()), item: Some(item), inline: FixTarget::default() }
    }

    /// (source, kind, title) triple used for deduplication.
    pub fn identity(&self) -> (String, String, String) {
        let item = self.item.as_ref();
        let source = pick([self.source.as_ref(), None], "unknown");
        let kind = pick([item.and_then(|i| i.kind.as_ref()), self.inline.kind.as_ref()], "generic");
        let title = pick([item.and_then(|i| i.title.as_ref()), self.inline.title.as_ref()], "AI fix task");
        (source, kind, title)
    }

    fn target(&self) -> &FixTarget {
        self.item.as_ref().unwrap_or(&self.inline)
    }
}

/// Remediation instructions handed to the SRE agent.
pub fn build_fix_prompt(target: &FixTarget) -> String {
    let title = target.title.as_deref().unwrap_or("Unknown issue");
    let details = target.details.as_deref().unwrap_or("");
    let kind = target.kind.as_deref().unwrap_or("generic");

    let mut task = format!(
        "You are the SRE agent of this deployment.\nGoal: fix the problem automatically and report back.\n\n\
         Issue:\n- title: {title}\n- details: {details}\n- kind: {kind}\n"
    );

    if let Some(cron_id) = target.cron_id.as_ref().or(target.job_id.as_ref()) {
        task.push_str(&format!("\nCron context: id={cron_id}.\n"));
        task.push_str(
            "Actions:\n1) Look at the last 5 runs of this cron.\n2) Find the likely cause of the error.\n\
             3) Apply a safe fix if possible and run the cron manually once.\n\
             4) If the error persists, disable the cron temporarily and explain why.\n",
        );
    }
    if let Some(session_key) = &target.session_key {
        task.push_str(&format!("\nSession context: key={session_key}.\n"));
        task.push_str("If the problem is high context usage, compact or reset the context safely without losing critical data.\n");
    }
    if let Some(check_id) = &target.check_id {
        task.push_str(&format!("\nSecurity context: checkId={check_id}.\n"));
        if check_id.contains("trusted_proxies") {
            task.push_str("If the warning is about trusted proxies and the reverse proxy is local, patch the config with trustedProxies: [\"127.0.0.1\",\"::1\"].\n");
        }
    }

    task.push_str(
        "\nConstraints:\n- Only safe, reversible changes.\n- Do not delete data.\n- Do not message the user.\n\n\
         Final answer format:\n- status: fixed | mitigated | failed\n- actions: list of steps\n\
         - verification: what you checked\n- next: what to do next if needed\n",
    );
    task
}

fn tail_chars(text: &str, budget: usize) -> String {
    let count = text.chars().count();
    if count <= budget {
        return text.to_string();
    }
    text.chars().skip(count - budget).collect()
}

/// Keeps the end of the transcript; JSON output is pretty-printed first.
pub fn summarize_output(output: &str, budget: usize) -> String {
    let short = tail_chars(output, budget);
    match extract_json(&short).and_then(|v| serde_json::to_string_pretty(&v).map_err(OpsError::from)) {
        Ok(pretty) => tail_chars(&pretty, budget),
        Err(_) => short,
    }
}

pub struct FixOrchestrator {
    ops: Shared<HashMap<String, FixOperation>>,
    executor: SharedExecutor,
    events: Arc<OperatorEventLog>,
    clock: SharedClock,
    conf: FixConf,
    backend_bin: String,
}

impl FixOrchestrator {
    pub fn new(
        conf: FixConf,
        backend_bin: impl Into<String>,
        executor: SharedExecutor,
        events: Arc<OperatorEventLog>,
        clock: SharedClock,
    ) -> Self {
        Self { ops: new_state(HashMap::new()), executor, events, clock, conf, backend_bin: backend_bin.into() }
    }

    fn timeout_ms(&self) -> i64 {
        duration_ms(self.conf.timeout())
    }

    pub fn build_command(&self, prompt: &str) -> String {
        let mut cmd = format!("{} agent --agent {}", self.backend_bin, sh_quote(&self.conf.agent));
        if let Some(to) = self.conf.reply_to.as_deref().filter(|t| !t.is_empty()) {
            cmd.push_str(&format!(" --to {}", sh_quote(to)));
        }
        cmd.push_str(&format!(
            " --message {} --json --timeout {} 2>/dev/null",
            sh_quote(prompt),
            self.conf.agent_timeout_secs
        ));
        cmd
    }

    /// Registers (or reuses) an operation and launches its command in the background.
    pub fn start(&self, request: FixRequest, actor: &Identity) -> FixOperationView {
        self.prune();
        self.settle_timeouts();

        let (source, kind, title) = request.identity();
        let now = self.clock.now_ms();
        let timeout_ms = self.timeout_ms();

        let view = {
            let mut ops = self.ops.lock();
            if let Some(existing) = ops
                .values()
                .find(|op| op.is_running() && op.source == source && op.kind == kind && op.title == title)
            {
                debug!("[fix] reusing running operation {} for '{}'", existing.id, title);
                return existing.view();
            }

            let id = Uuid::new_v4().to_string();
            let mut op = FixOperation::new(id.clone(), source.clone(), kind.clone(), title.clone(), actor.user.clone(), now, timeout_ms);
            op.advance(FixStep::Prepare, 12, Some(timeout_ms), now, "Preparing runbook and fix plan");
            let view = op.view();
            ops.insert(id, op);
            view
        };

        info!("[fix] started {} '{}' (source={}, kind={})", view.id, title, source, kind);
        self.events.log(
            NewEvent::new("ai-fix", EventLevel::Info, format!("AI fix started: {title}"))
                .actor(actor.user.clone())
                .details(format!("source={source}, kind={kind}"))
                .meta(json!({ "opId": view.id, "source": source, "kind": kind })),
        );

        let command = self.build_command(&build_fix_prompt(request.target()));
        tokio::spawn(drive(
            self.ops.clone(),
            view.id.clone(),
            command,
            self.executor.clone(),
            self.events.clone(),
            self.clock.clone(),
            self.conf.clone(),
            actor.user.clone(),
        ));
        view
    }

    /// Status of one operation. Pruned operations are reported as not found.
    pub fn get(&self, id: &str) -> OpsResult<FixOperationView> {
        self.sweep();
        self.prune();
        self.ops
            .lock()
            .get(id.trim())
            .map(FixOperation::view)
            .ok_or_else(|| OpsError::NotFound("operation not found".into()))
    }

    /// Most recently created first, at most `list_limit`.
    pub fn list(&self) -> Vec<FixOperationView> {
        self.sweep();
        self.prune();
        let mut ops: Vec<FixOperation> = self.ops.lock().values().cloned().collect();
        ops.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        ops.iter().take(self.conf.list_limit).map(FixOperation::view).collect()
    }

    /// Full records (all events), after timeout settlement. Used by task views.
    pub fn snapshot(&self) -> Vec<FixOperation> {
        self.sweep();
        self.ops.lock().values().cloned().collect()
    }

    pub fn find(&self, id: &str) -> Option<FixOperation> {
        self.sweep();
        self.ops.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        self.settle_timeouts();
        self.refresh_progress();
    }

    /// Re-estimates the progress of every operation whose command is running.
    pub fn refresh_progress(&self) {
        let now = self.clock.now_ms();
        let timeout_ms = self.timeout_ms();
        for op in self.ops.lock().values_mut().filter(|op| op.step >= FixStep::Diagnostics) {
            op.tick(now, timeout_ms);
        }
    }

    /// Forces every running operation past its timeout budget into `error`.
    pub fn settle_timeouts(&self) {
        let now = self.clock.now_ms();
        let timeout_ms = self.timeout_ms();
        let minutes = self.conf.timeout_secs / 60;

        let timed_out: Vec<(String, String, String)> = {
            let mut ops = self.ops.lock();
            ops.values_mut()
                .filter(|op| op.is_running() && now - op.created_at_ms > timeout_ms)
                .filter_map(|op| {
                    let text = format!("Operation timed out ({minutes} min)");
                    op.fail("operation timeout".into(), text, now)
                        .then(|| (op.id.clone(), op.title.clone(), op.started_by.clone()))
                })
                .collect()
        };

        for (id, title, actor) in timed_out {
            warn!("[fix] operation {} timed out", id);
            self.events.log(
                NewEvent::new("ai-fix", EventLevel::Error, format!("AI fix failed: {title}"))
                    .actor(actor)
                    .details("operation timeout")
                    .meta(json!({ "opId": id })),
            );
        }
    }

    /// Drops operations older than the retention window, then the oldest beyond the max count.
    pub fn prune(&self) {
        let now = self.clock.now_ms();
        let retention_ms = duration_ms(self.conf.retention());
        let mut ops = self.ops.lock();
        ops.retain(|_, op| now - op.created_at_ms <= retention_ms);

        if ops.len() > self.conf.max_operations {
            let mut by_age: Vec<(i64, String)> = ops.values().map(|op| (op.created_at_ms, op.id.clone())).collect();
            by_age.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, id) in by_age.into_iter().skip(self.conf.max_operations) {
                ops.remove(&id);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    ops: Shared<HashMap<String, FixOperation>>,
    id: String,
    command: String,
    executor: SharedExecutor,
    events: Arc<OperatorEventLog>,
    clock: SharedClock,
    conf: FixConf,
    actor: String,
) {
    let timeout_ms = duration_ms(conf.timeout());
    if let Some(op) = ops.lock().get_mut(&id) {
        op.advance(FixStep::Diagnostics, 18, Some(timeout_ms), clock.now_ms(), "Starting SRE agent for diagnostics");
    }

    let run = executor.run(&command, conf.command_ceiling());
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(conf.tick());
    ticker.tick().await;

    let outcome = loop {
        tokio::select! {
            res = &mut run => break res,
            _ = ticker.tick() => {
                if let Some(op) = ops.lock().get_mut(&id) {
                    op.tick(clock.now_ms(), timeout_ms);
                }
            }
        }
    };

    let now = clock.now_ms();
    match outcome {
        Ok(output) => {
            let result_text = summarize_output(&output, conf.result_budget_chars);
            let settled = ops.lock().get_mut(&id).map(|op| (op.complete(result_text, now), op.title.clone()));
            if let Some((true, title)) = settled {
                info!("[fix] operation {} done", id);
                events.log(
                    NewEvent::new("ai-fix", EventLevel::Ok, format!("AI fix done: {title}"))
                        .actor(actor)
                        .details("completed")
                        .meta(json!({ "opId": id })),
                );
            } else {
                debug!("[fix] late completion ignored for {}", id);
            }
        }
        Err(e) => {
            let message = e.to_string();
            let settled = ops
                .lock()
                .get_mut(&id)
                .map(|op| (op.fail(message.clone(), format!("Error: {message}"), now), op.title.clone()));
            if let Some((true, title)) = settled {
                warn!("[fix] operation {} failed: {}", id, message);
                events.log(
                    NewEvent::new("ai-fix", EventLevel::Error, format!("AI fix failed: {title}"))
                        .actor(actor)
                        .details(message)
                        .meta(json!({ "opId": id })),
                );
            } else {
                debug!("[fix] late failure ignored for {}", id);
            }
        }
    }
}
