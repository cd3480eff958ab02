/**
 * SIGNALS - Typed, lenient views over backend payloads
 *
 * ROLE :
 * The backend CLI output is opaque JSON. This module is the only place that
 * knows its shape: status (sessions, security audit, agents, gateway) and the
 * cron list. Everything downstream works on the normalized types.
 *
 * FONCTIONNEMENT :
 * - scalar fields are optional; numbers and strings are accepted for either
 * - list items are parsed one by one, a broken record is skipped alone
 * - side blocks (agents, gateway, update) fall back to their default
 * - a payload whose top-level shape is wrong is UpstreamMalformed
 */

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::{human_duration, ms_to_rfc3339};
use crate::error::{OpsError, OpsResult};

fn num<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn flag<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

fn text<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn text_or_empty<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text(d)?.unwrap_or_default())
}

/// A list of records. Items that do not parse are dropped, a non-list is an error.
fn items<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(raw)) => Ok(raw
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!("[signals] skipping malformed record: {}", e);
                    None
                }
            })
            .collect()),
        Some(_) => Err(D::Error::custom("expected a list")),
    }
}

/// Nested block that falls back to its default when it has the wrong shape.
fn block<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => T::default(),
        Some(v) => serde_json::from_value(v).unwrap_or_else(|e| {
            warn!("[signals] ignoring malformed block: {}", e);
            T::default()
        }),
    })
}

fn as_ms(v: Option<f64>) -> Option<i64> {
    v.filter(|f| f.is_finite()).map(|f| f as i64)
}

fn object_payload<T: DeserializeOwned>(what: &str, value: &Value) -> OpsResult<T> {
    if !value.is_object() {
        return Err(OpsError::UpstreamMalformed(format!("{what} payload is not an object")));
    }
    serde_json::from_value(value.clone()).map_err(|e| OpsError::UpstreamMalformed(format!("{what} payload: {e}")))
}

// ---- status payload -------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusPayload {
    pub sessions: SessionsBlock,
    pub security_audit: SecurityAudit,
    #[serde(deserialize_with = "block")]
    pub agents: AgentsBlock,
    #[serde(deserialize_with = "block")]
    pub gateway: GatewayBlock,
    #[serde(deserialize_with = "block")]
    pub update: UpdateBlock,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionsBlock {
    #[serde(deserialize_with = "num")]
    pub count: Option<f64>,
    #[serde(deserialize_with = "items")]
    pub recent: Vec<RawSession>,
    #[serde(deserialize_with = "block")]
    pub defaults: SessionDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    #[serde(deserialize_with = "text")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawSession {
    #[serde(deserialize_with = "text_or_empty")]
    pub key: String,
    #[serde(deserialize_with = "text")]
    pub agent_id: Option<String>,
    #[serde(deserialize_with = "text")]
    pub model: Option<String>,
    #[serde(deserialize_with = "num")]
    pub percent_used: Option<f64>,
    #[serde(deserialize_with = "num")]
    pub updated_at: Option<f64>,
    #[serde(deserialize_with = "num")]
    pub age: Option<f64>,
    #[serde(deserialize_with = "num")]
    pub age_ms: Option<f64>,
    #[serde(deserialize_with = "text")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "flag")]
    pub aborted_last_run: bool,
    #[serde(deserialize_with = "text")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityAudit {
    #[serde(deserialize_with = "block")]
    pub summary: SecuritySummary,
    #[serde(deserialize_with = "items")]
    pub findings: Vec<SecurityFinding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecuritySummary {
    #[serde(deserialize_with = "num")]
    pub warn: Option<f64>,
    #[serde(deserialize_with = "num")]
    pub critical: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityFinding {
    #[serde(deserialize_with = "text")]
    pub check_id: Option<String>,
    #[serde(deserialize_with = "text")]
    pub severity: Option<String>,
    #[serde(deserialize_with = "text")]
    pub title: Option<String>,
    #[serde(deserialize_with = "text")]
    pub detail: Option<String>,
    #[serde(deserialize_with = "text")]
    pub remediation: Option<String>,
}

impl SecurityFinding {
    pub fn severity(&self) -> String {
        self.severity.as_deref().unwrap_or("").trim().to_ascii_lowercase()
    }

    /// warn or critical
    pub fn is_issue(&self) -> bool {
        matches!(self.severity().as_str(), "warn" | "critical")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsBlock {
    #[serde(deserialize_with = "items")]
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(deserialize_with = "text_or_empty")]
    pub id: String,
    #[serde(deserialize_with = "text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "text")]
    pub workspace_dir: Option<String>,
    #[serde(deserialize_with = "num")]
    pub last_active_age_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayBlock {
    #[serde(rename = "self", deserialize_with = "block")]
    pub this: GatewaySelf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewaySelf {
    #[serde(deserialize_with = "text")]
    pub host: Option<String>,
    #[serde(deserialize_with = "text")]
    pub ip: Option<String>,
    #[serde(deserialize_with = "text")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateBlock {
    #[serde(deserialize_with = "block")]
    pub registry: UpdateRegistry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateRegistry {
    #[serde(deserialize_with = "text")]
    pub latest_version: Option<String>,
}

impl StatusPayload {
    pub fn parse(value: &Value) -> OpsResult<Self> {
        object_payload("status", value)
    }

    /// Sessions with a usable key.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.recent.iter().filter(|s| !s.key.trim().is_empty()).map(Session::from_raw).collect()
    }

    pub fn security_warn(&self) -> u64 {
        self.security_audit.summary.warn.unwrap_or(0.0).max(0.0) as u64
    }

    pub fn security_critical(&self) -> u64 {
        self.security_audit.summary.critical.unwrap_or(0.0).max(0.0) as u64
    }

    /// Findings with severity warn or critical, in payload order.
    pub fn security_issues(&self) -> Vec<&SecurityFinding> {
        self.security_audit.findings.iter().filter(|f| f.is_issue()).collect()
    }
}

// ---- sessions ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub agent_id: String,
    pub model: String,
    pub percent_used: Option<f64>,
    pub updated_at_ms: Option<i64>,
    pub age_ms: i64,
    pub age_label: String,
    pub kind: String,
    pub aborted_last_run: bool,
    pub session_id: Option<String>,
}

/// Second segment of `agent:<agent>:...`, or "unknown".
pub fn agent_from_key(key: &str) -> String {
    key.split(':').nth(1).filter(|s| !s.is_empty()).unwrap_or("unknown").to_string()
}

impl Session {
    pub fn from_raw(raw: &RawSession) -> Self {
        let age_ms = as_ms(raw.age.or(raw.age_ms)).unwrap_or(0).max(0);
        Self {
            key: raw.key.clone(),
            agent_id: raw.agent_id.clone().filter(|a| !a.is_empty()).unwrap_or_else(|| agent_from_key(&raw.key)),
            model: raw.model.clone().unwrap_or_else(|| "unknown".into()),
            percent_used: raw.percent_used.filter(|p| p.is_finite()),
            updated_at_ms: as_ms(raw.updated_at).filter(|ms| *ms > 0),
            age_ms,
            age_label: human_duration(age_ms),
            kind: raw.kind.clone().unwrap_or_else(|| "direct".into()),
            aborted_last_run: raw.aborted_last_run,
            session_id: raw.session_id.clone(),
        }
    }

    pub fn is_chat(&self) -> bool {
        self.key.contains(":telegram:")
    }

    pub fn is_subagent(&self) -> bool {
        self.key.contains(":thread:") || self.key.contains(":spawn:") || self.key.contains(":subagent:")
    }

    /// Chat id following the channel segment (`...:telegram:<kind>:<id>`).
    pub fn chat_target(&self) -> Option<String> {
        let parts: Vec<&str> = self.key.split(':').collect();
        let idx = parts.iter().position(|p| *p == "telegram")?;
        parts.get(idx + 2).map(|s| s.to_string())
    }

    pub fn thread_id(&self) -> Option<String> {
        self.key.split_once(":thread:").map(|(_, t)| t.to_string())
    }
}

// ---- cron list -----------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CronPayload {
    #[serde(deserialize_with = "items")]
    pub jobs: Vec<RawCron>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawCron {
    #[serde(deserialize_with = "text_or_empty")]
    pub id: String,
    #[serde(deserialize_with = "text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "text")]
    pub agent_id: Option<String>,
    #[serde(deserialize_with = "flag")]
    pub enabled: bool,
    pub schedule: Value,
    #[serde(deserialize_with = "block")]
    pub state: CronState,
    #[serde(deserialize_with = "text")]
    pub session_target: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronState {
    #[serde(deserialize_with = "num")]
    pub next_run_at_ms: Option<f64>,
    #[serde(deserialize_with = "num")]
    pub last_run_at_ms: Option<f64>,
    #[serde(deserialize_with = "text")]
    pub last_status: Option<String>,
    #[serde(deserialize_with = "num")]
    pub consecutive_errors: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    pub enabled: bool,
    pub schedule: Value,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub last_status: String,
    pub consecutive_errors: u32,
    pub session_target: Option<String>,
}

impl CronJob {
    pub fn from_raw(raw: &RawCron) -> Self {
        Self {
            id: raw.id.clone(),
            name: raw.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| "(unnamed)".into()),
            agent_id: raw.agent_id.clone().unwrap_or_default(),
            enabled: raw.enabled,
            schedule: raw.schedule.clone(),
            next_run_at: as_ms(raw.state.next_run_at_ms).and_then(ms_to_rfc3339),
            last_run_at: as_ms(raw.state.last_run_at_ms).and_then(ms_to_rfc3339),
            last_status: raw.state.last_status.clone().unwrap_or_else(|| "n/a".into()),
            consecutive_errors: raw.state.consecutive_errors.unwrap_or(0.0).max(0.0) as u32,
            session_target: raw.session_target.clone(),
        }
    }

    pub fn is_failing(&self) -> bool {
        self.consecutive_errors > 0 || self.last_status == "error"
    }
}

/// Jobs with a usable id, in payload order.
pub fn parse_cron_jobs(value: &Value) -> OpsResult<Vec<CronJob>> {
    let payload: CronPayload = object_payload("cron list", value)?;
    Ok(payload.jobs.iter().filter(|j| !j.id.trim().is_empty()).map(CronJob::from_raw).collect())
}

// ---- usage ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct UsagePayload {
    #[serde(deserialize_with = "block")]
    usage: UsageBlock,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UsageBlock {
    #[serde(deserialize_with = "num")]
    updated_at: Option<f64>,
    #[serde(deserialize_with = "items")]
    providers: Vec<RawProvider>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawProvider {
    #[serde(deserialize_with = "text_or_empty")]
    provider: String,
    #[serde(deserialize_with = "text")]
    display_name: Option<String>,
    #[serde(deserialize_with = "text")]
    plan: Option<String>,
    #[serde(deserialize_with = "text")]
    error: Option<String>,
    #[serde(deserialize_with = "items")]
    windows: Vec<RawWindow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawWindow {
    #[serde(deserialize_with = "text")]
    label: Option<String>,
    #[serde(deserialize_with = "num")]
    used_percent: Option<f64>,
    #[serde(deserialize_with = "num")]
    reset_at: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    pub label: String,
    pub used_percent: f64,
    pub remaining_percent: f64,
    pub reset_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub provider: String,
    pub display_name: String,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub windows: Vec<UsageWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub updated_at: Option<String>,
    pub providers: Vec<ProviderUsage>,
}

/// Per-provider quota windows from `status --usage`, minus the `hidden` providers.
pub fn parse_usage(value: &Value, hidden: &[String]) -> OpsResult<UsageReport> {
    let payload: UsagePayload = object_payload("usage", value)?;
    let providers = payload
        .usage
        .providers
        .into_iter()
        .filter(|p| !hidden.iter().any(|h| h.eq_ignore_ascii_case(p.provider.trim())))
        .map(|p| ProviderUsage {
            display_name: p.display_name.filter(|d| !d.is_empty()).unwrap_or_else(|| p.provider.clone()),
            provider: p.provider,
            plan: p.plan,
            error: p.error,
            windows: p
                .windows
                .into_iter()
                .map(|w| {
                    let used = w.used_percent.filter(|u| u.is_finite()).unwrap_or(0.0);
                    UsageWindow {
                        label: w.label.unwrap_or_else(|| "window".into()),
                        used_percent: used,
                        remaining_percent: (100.0 - used).clamp(0.0, 100.0),
                        reset_at: as_ms(w.reset_at).filter(|ms| *ms > 0).and_then(ms_to_rfc3339),
                    }
                })
                .collect(),
        })
        .collect();
    Ok(UsageReport {
        updated_at: as_ms(payload.usage.updated_at).filter(|ms| *ms > 0).and_then(ms_to_rfc3339),
        providers,
    })
}

// ---- skills --------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SkillsPayload {
    #[serde(deserialize_with = "items")]
    skills: Vec<RawSkill>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawSkill {
    #[serde(deserialize_with = "text_or_empty")]
    name: String,
    #[serde(deserialize_with = "text")]
    source: Option<String>,
    #[serde(deserialize_with = "text")]
    description: Option<String>,
    #[serde(deserialize_with = "flag")]
    eligible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub agent_id: String,
    pub name: String,
    pub slug: String,
    pub source: String,
    pub description: Option<String>,
    pub eligible: bool,
    pub deletable: bool,
}

impl Skill {
    fn haystack(&self) -> String {
        format!("{} {} {}", self.agent_id, self.name, self.description.as_deref().unwrap_or("")).to_lowercase()
    }

    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty() || self.haystack().contains(&query)
    }
}

/// Installed skills from `skills list`. Bundled ones are not listed.
pub fn parse_skills(value: &Value) -> OpsResult<Vec<Skill>> {
    let payload: SkillsPayload = object_payload("skills", value)?;
    Ok(payload
        .skills
        .into_iter()
        .filter(|s| !s.name.trim().is_empty())
        .filter(|s| s.source.as_deref() != Some("openclaw-bundled"))
        .map(|s| Skill {
            agent_id: "system".into(),
            slug: s.name.clone(),
            name: s.name,
            source: s.source.unwrap_or_else(|| "unknown".into()),
            description: s.description,
            eligible: s.eligible,
            deletable: false,
        })
        .collect())
}
