/**
 * BACKEND CLIENT - Cached reads from the agent-management CLI
 *
 * ROLE :
 * Builds the CLI commands, runs them through the executor behind the TTL
 * cache and turns the output into JSON values.
 *
 * FONCTIONNEMENT :
 * - one cache key per read: status, status-usage, cli-version, crons, skills-index
 * - crons and status never fail: on error they fall back to the last cached
 *   payload (stale) or an empty one, flagged degraded with a normalized reason
 * - a payload with the wrong shape is rejected inside the cached read, so it
 *   is never stored and the previous good payload stays available as stale
 * - id/key validators reject malformed input before any command is built
 * - mutations (cron run/toggle/delete/update, session model) are uncached
 *   one-shot commands; gateway calls pass their params as quoted JSON
 */

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::{BackendConf, CacheConf};
use crate::error::{OpsError, OpsResult};
use crate::events::EventLevel;
use crate::executor::{extract_json, sh_quote, SharedExecutor};
use crate::signals::{parse_cron_jobs, parse_skills, parse_usage, CronJob, Session, Skill, StatusPayload, UsageReport};

pub const KEY_STATUS: &str = "status";
pub const KEY_STATUS_USAGE: &str = "status-usage";
pub const KEY_CLI_VERSION: &str = "cli-version";
pub const KEY_CRONS: &str = "crons";
pub const KEY_SKILLS: &str = "skills-index";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 100;

/// Freshness of a fallback-capable source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceMeta {
    pub degraded: bool,
    pub stale: bool,
    pub error: Option<String>,
}

impl SourceMeta {
    fn degraded(stale: bool, error: String) -> Self {
        Self { degraded: true, stale, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CronList {
    pub jobs: Vec<CronJob>,
    #[serde(rename = "_meta")]
    pub meta: SourceMeta,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: StatusPayload,
    pub meta: SourceMeta,
}

/// Human-readable reason for a failed read of `source`.
pub fn normalize_source_error(source: &str, err: &OpsError) -> String {
    let raw = err.to_string();
    if raw.to_ascii_lowercase().contains("gateway timeout") {
        return format!("gateway timeout while fetching {source}");
    }
    match err {
        OpsError::UpstreamMalformed(_) => format!("invalid {source} response"),
        OpsError::UpstreamFailed(_) => format!("failed to read {source} (CLI command error)"),
        OpsError::UpstreamTimeout(_) => format!("{source} timed out"),
        _ => raw,
    }
}

pub fn validate_cron_id(id: &str) -> OpsResult<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(OpsError::Validation("cron id is required".into()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(OpsError::Validation("invalid cron id format".into()));
    }
    Ok(id)
}

fn is_agent_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub fn validate_agent_id(id: &str) -> OpsResult<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(OpsError::Validation("agentId is required".into()));
    }
    if !id.chars().all(is_agent_char) {
        return Err(OpsError::Validation("invalid agentId".into()));
    }
    Ok(id)
}

/// `agent:<agent-id>:<rest>` where rest is word chars, ':' or '-'.
pub fn validate_session_key(key: &str) -> OpsResult<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(OpsError::Validation("session key is required".into()));
    }
    let invalid = || OpsError::Validation("invalid session key".into());
    let rest = key.strip_prefix("agent:").ok_or_else(invalid)?;
    let (agent, tail) = rest.split_once(':').ok_or_else(invalid)?;
    if agent.is_empty() || !agent.chars().all(is_agent_char) {
        return Err(invalid());
    }
    if tail.is_empty() || !tail.chars().all(|c| c.is_alphanumeric() || c == '_' || c == ':' || c == '-') {
        return Err(invalid());
    }
    Ok(key)
}

/// Calendar version like `2026.2.14-3`, else the first token of the output.
pub fn parse_cli_version(output: &str) -> Option<String> {
    let is_calver = |tok: &str| {
        let Some((date, build)) = tok.split_once('-') else { return false };
        let parts: Vec<&str> = date.split('.').collect();
        parts.len() == 3
            && parts[0].len() == 4
            && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            && !build.is_empty()
            && build.chars().all(|c| c.is_ascii_digit())
    };
    let mut tokens = output.split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | 'v'));
    if let Some(v) = tokens.find(|t| is_calver(*t)) {
        return Some(v.to_string());
    }
    output.split_whitespace().next().map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronAction {
    Run,
    Enable,
    Disable,
    Remove,
}

impl CronAction {
    fn verb(&self) -> &'static str {
        match self {
            CronAction::Run => "run",
            CronAction::Enable => "enable",
            CronAction::Disable => "disable",
            CronAction::Remove => "rm",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CronAction::Run => "run",
            CronAction::Enable => "enable",
            CronAction::Disable => "disable",
            CronAction::Remove => "delete",
        }
    }

    pub fn audit_action(&self) -> &'static str {
        match self {
            CronAction::Run => "cron.run",
            CronAction::Enable | CronAction::Disable => "cron.toggle",
            CronAction::Remove => "cron.delete",
        }
    }

    pub fn event_title(&self) -> &'static str {
        match self {
            CronAction::Run => "Cron run",
            CronAction::Enable => "Cron enabled",
            CronAction::Disable => "Cron disabled",
            CronAction::Remove => "Cron deleted",
        }
    }

    pub fn event_level(&self) -> EventLevel {
        match self {
            CronAction::Remove => EventLevel::Warn,
            _ => EventLevel::Info,
        }
    }
}

/// Fields of a cron job that may be edited. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_target: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<Value>,
}

impl CronPatch {
    pub fn is_empty(&self) -> bool {
        *self == CronPatch::default()
    }
}

/// Model for a session patch: `None` resets to the agent default.
pub fn resolve_model(raw: &str, aliases: &BTreeMap<String, String>) -> OpsResult<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OpsError::Validation("model is required".into()));
    }
    if raw.eq_ignore_ascii_case("default") {
        return Ok(None);
    }
    if !raw.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')) {
        return Err(OpsError::Validation("invalid model".into()));
    }
    if let Some(full) = aliases.get(&raw.to_ascii_lowercase()) {
        return Ok(Some(full.clone()));
    }
    if raw.contains('/') {
        return Ok(Some(raw.to_string()));
    }
    if raw.starts_with("claude-") {
        return Ok(Some(format!("anthropic/{raw}")));
    }
    if raw.starts_with("gpt-") {
        return Ok(Some(format!("openai/{raw}")));
    }
    Ok(Some(raw.to_string()))
}

fn runs_limit(limit: Option<usize>) -> usize {
    match limit {
        None | Some(0) => DEFAULT_RUNS_LIMIT,
        Some(n) => n.min(MAX_RUNS_LIMIT),
    }
}

pub struct BackendClient {
    executor: SharedExecutor,
    cache: Arc<TtlCache<Value>>,
    bin: String,
    command_timeout: Duration,
    ttl: CacheConf,
    model_aliases: BTreeMap<String, String>,
    hidden_usage_providers: Vec<String>,
}

impl BackendClient {
    pub fn new(conf: &BackendConf, ttl: CacheConf, executor: SharedExecutor, cache: Arc<TtlCache<Value>>) -> Self {
        Self {
            executor,
            cache,
            bin: conf.bin.clone(),
            command_timeout: Duration::from_secs(conf.command_timeout_secs),
            ttl,
            model_aliases: conf.model_aliases.clone(),
            hidden_usage_providers: conf.hidden_usage_providers.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn cache(&self) -> &TtlCache<Value> {
        &self.cache
    }

    /// Cached CLI read. `check` runs on the parsed value before it is stored.
    async fn cached_json(
        &self,
        key: &str,
        ttl_secs: u64,
        args: &str,
        timeout: Duration,
        check: fn(&Value) -> OpsResult<()>,
    ) -> OpsResult<Value> {
        let executor = self.executor.clone();
        let command = format!("{} {} 2>/dev/null", self.bin, args);
        self.cache
            .get(key, Duration::from_secs(ttl_secs), move || async move {
                let out = executor.run(&command, timeout).await?;
                let value = extract_json(&out)?;
                check(&value)?;
                Ok(value)
            })
            .await
    }

    pub async fn status(&self) -> OpsResult<Value> {
        self.cached_json(KEY_STATUS, self.ttl.status_ttl_secs, "status --json", self.command_timeout, |v| {
            StatusPayload::parse(v).map(|_| ())
        })
        .await
    }

    pub async fn status_usage(&self) -> OpsResult<Value> {
        self.cached_json(
            KEY_STATUS_USAGE,
            self.ttl.usage_ttl_secs,
            "status --usage --json",
            Duration::from_secs(45),
            |v| parse_usage(v, &[]).map(|_| ()),
        )
        .await
    }

    pub async fn skills_index(&self) -> OpsResult<Value> {
        self.cached_json(KEY_SKILLS, self.ttl.skills_ttl_secs, "skills list --json", self.command_timeout, |v| {
            parse_skills(v).map(|_| ())
        })
        .await
    }

    pub async fn usage(&self) -> OpsResult<UsageReport> {
        let value = self.status_usage().await?;
        parse_usage(&value, &self.hidden_usage_providers)
    }

    pub async fn skills(&self) -> OpsResult<Vec<Skill>> {
        let value = self.skills_index().await?;
        parse_skills(&value)
    }

    pub async fn cli_version(&self) -> OpsResult<Option<String>> {
        let executor = self.executor.clone();
        let command = format!("{} --version 2>/dev/null", self.bin);
        let value = self
            .cache
            .get(KEY_CLI_VERSION, Duration::from_secs(self.ttl.version_ttl_secs), move || async move {
                let out = executor.run(&command, Duration::from_secs(15)).await?;
                Ok(parse_cli_version(&out).map(Value::String).unwrap_or(Value::Null))
            })
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    /// Status with stale fallback. Never fails.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        match self.status().await.and_then(|v| StatusPayload::parse(&v)) {
            Ok(status) => StatusSnapshot { status, meta: SourceMeta::default() },
            Err(e) => {
                let reason = normalize_source_error("status", &e);
                warn!("[backend] status degraded: {}", reason);
                match self.cache.peek(KEY_STATUS).and_then(|v| StatusPayload::parse(&v).ok()) {
                    Some(status) => StatusSnapshot { status, meta: SourceMeta::degraded(true, reason) },
                    None => StatusSnapshot { status: StatusPayload::default(), meta: SourceMeta::degraded(false, reason) },
                }
            }
        }
    }

    /// Cron list with stale fallback. Never fails.
    pub async fn crons(&self) -> CronList {
        let stale = self.cache.peek(KEY_CRONS);
        let fresh = self
            .cached_json(
                KEY_CRONS,
                self.ttl.crons_ttl_secs,
                "cron list --json --timeout 60000",
                Duration::from_secs(70),
                |v| parse_cron_jobs(v).map(|_| ()),
            )
            .await
            .and_then(|v| parse_cron_jobs(&v));
        match fresh {
            Ok(jobs) => CronList { jobs, meta: SourceMeta::default() },
            Err(e) => {
                let reason = normalize_source_error("cron list", &e);
                warn!("[backend] cron list degraded: {}", reason);
                match stale.and_then(|v| parse_cron_jobs(&v).ok()) {
                    Some(jobs) => CronList { jobs, meta: SourceMeta::degraded(true, reason) },
                    None => CronList { jobs: Vec::new(), meta: SourceMeta::degraded(false, reason) },
                }
            }
        }
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.status_snapshot().await.status.sessions()
    }

    pub async fn cron(&self, id: &str) -> OpsResult<CronJob> {
        let id = validate_cron_id(id)?;
        self.crons()
            .await
            .jobs
            .into_iter()
            .find(|j| j.id == id)
            .ok_or_else(|| OpsError::NotFound(format!("cron {id}")))
    }

    pub async fn session(&self, key: &str) -> OpsResult<Session> {
        let key = validate_session_key(key)?;
        self.sessions()
            .await
            .into_iter()
            .find(|s| s.key == key)
            .ok_or_else(|| OpsError::NotFound(format!("session {key}")))
    }

    /// Run history of one cron job, newest entries as the CLI returns them.
    pub async fn cron_runs(&self, id: &str, limit: Option<usize>) -> OpsResult<Value> {
        let id = validate_cron_id(id)?;
        let command = format!("{} cron runs --id {} --limit {} 2>/dev/null", self.bin, id, runs_limit(limit));
        let out = self.executor.run(&command, Duration::from_secs(30)).await?;
        extract_json(&out)
    }

    /// One-shot cron command. Returns the trimmed CLI output.
    pub async fn cron_action(&self, action: CronAction, id: &str) -> OpsResult<String> {
        let id = validate_cron_id(id)?;
        let command = format!("{} cron {} {} --json 2>/dev/null", self.bin, action.verb(), id);
        debug!("[backend] cron {} {}", action.label(), id);
        let out = self.executor.run(&command, Duration::from_secs(65)).await?;
        Ok(out.trim().to_string())
    }

    async fn gateway_call(&self, method: &str, params: &Value, timeout: Duration) -> OpsResult<Value> {
        let command = format!(
            "{} gateway call {} --params {} --json 2>/dev/null",
            self.bin,
            method,
            sh_quote(&params.to_string())
        );
        let out = self.executor.run(&command, timeout).await?;
        extract_json(&out)
    }

    pub async fn update_cron(&self, id: &str, patch: &CronPatch) -> OpsResult<Value> {
        let id = validate_cron_id(id)?;
        if patch.is_empty() {
            return Err(OpsError::Validation("nothing to update".into()));
        }
        if matches!(patch.timeout, Some(t) if !t.is_finite() || t <= 0.0) {
            return Err(OpsError::Validation("timeout must be a positive number".into()));
        }
        let params = json!({ "id": id, "patch": patch });
        self.gateway_call("cron.update", &params, Duration::from_secs(30)).await
    }

    /// Points a session at another model. Returns the model actually set.
    pub async fn patch_session_model(&self, key: &str, model: &str) -> OpsResult<Option<String>> {
        let key = validate_session_key(key)?;
        let model = resolve_model(model, &self.model_aliases)?;
        let params = json!({ "key": key, "model": model });
        let res = self.gateway_call("sessions.patch", &params, Duration::from_secs(30)).await?;
        if res.get("ok").and_then(Value::as_bool) != Some(true) {
            let message = res
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("failed to patch session model")
                .to_string();
            return Err(OpsError::UpstreamFailed(message));
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validators() {
        assert_eq!(validate_cron_id(" cron-7 ").unwrap(), "cron-7");
        assert!(matches!(validate_cron_id("cron_7"), Err(OpsError::Validation(_))));
        assert!(matches!(validate_cron_id(""), Err(OpsError::Validation(_))));

        assert!(validate_agent_id("ops_bot-2").is_ok());
        assert!(validate_agent_id("ops bot").is_err());

        assert!(validate_session_key("agent:main:telegram:direct:42").is_ok());
        assert!(validate_session_key("agent:main:thread:a-b_c").is_ok());
        assert!(validate_session_key("agent:main").is_err());
        assert!(validate_session_key("agent::x").is_err());
        assert!(validate_session_key("user:main:x").is_err());
        assert!(validate_session_key("agent:main:x y").is_err());
    }

    #[test]
    fn test_error_normalization() {
        let e = OpsError::UpstreamFailed("Gateway Timeout after 60000ms".into());
        assert_eq!(normalize_source_error("cron list", &e), "gateway timeout while fetching cron list");
        let e = OpsError::UpstreamMalformed("No JSON object".into());
        assert_eq!(normalize_source_error("cron list", &e), "invalid cron list response");
        let e = OpsError::UpstreamFailed("exit status 1".into());
        assert_eq!(normalize_source_error("status", &e), "failed to read status (CLI command error)");
    }

    #[test]
    fn test_cli_version_parsing() {
        assert_eq!(parse_cli_version("openclaw 2026.2.14-3\n").as_deref(), Some("2026.2.14-3"));
        assert_eq!(parse_cli_version("1.4.0").as_deref(), Some("1.4.0"));
        assert_eq!(parse_cli_version("   "), None);
    }

    #[test]
    fn test_model_resolution() {
        let aliases = BackendConf::default().model_aliases;
        assert_eq!(resolve_model("opus", &aliases).unwrap().as_deref(), Some("anthropic/claude-opus-4-6"));
        assert_eq!(resolve_model(" Default ", &aliases).unwrap(), None);
        assert_eq!(resolve_model("claude-haiku-4", &aliases).unwrap().as_deref(), Some("anthropic/claude-haiku-4"));
        assert_eq!(resolve_model("gpt-5", &aliases).unwrap().as_deref(), Some("openai/gpt-5"));
        assert_eq!(resolve_model("mistral/large", &aliases).unwrap().as_deref(), Some("mistral/large"));
        assert!(matches!(resolve_model("", &aliases), Err(OpsError::Validation(_))));
        assert!(matches!(resolve_model("opus; rm -rf /", &aliases), Err(OpsError::Validation(_))));
    }

    #[test]
    fn test_runs_limit_and_empty_patch() {
        assert_eq!(runs_limit(None), 20);
        assert_eq!(runs_limit(Some(0)), 20);
        assert_eq!(runs_limit(Some(500)), 100);
        assert!(CronPatch::default().is_empty());
        let patch = CronPatch { payload_message: Some("hi".into()), ..Default::default() };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({"payloadMessage": "hi"}));
    }
}
