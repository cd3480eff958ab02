/**
 * HTTP API - JSON surface of the dashboard core
 *
 * ROLE :
 * Routing and encoding only. Every behaviour lives in OpsCore; handlers
 * resolve the caller, call one core method and encode the result.
 *
 * FONCTIONNEMENT :
 * - Caller identity from x-forwarded-user / x-remote-user plus the roles file
 * - Reads : /health, /api/summary, /api/alerts, /api/intel, /api/tasks/active, /api/tasks/replay, /api/timeline ...
 * - Backend reads : /api/crons, /api/cron/runs, /api/sessions, /api/usage, /api/skills
 * - Writes : /api/triage, /api/operator/note, /api/ai/fix/start, /api/cron/{run,toggle,delete,update},
 *   /api/session/model
 * - OpsError mapped to HTTP status (429, 403, 404, 400, 504, 502, 500)
 */

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::aggregator::{Alert, Intelligence};
use crate::audit::AuditEntry;
use crate::backend::CronList;
use crate::ops_core::{CronActionResult, CronUpdate, OperatorNote, OpsCore, SessionModelResult, TaskReplay};
use crate::error::OpsError;
use crate::events::OperatorEvent;
use crate::fix_ops::{FixOperationView, FixRequest};
use crate::health::KernelHealth;
use crate::identity::{Identity, RoleBook};
use crate::review::{OperatorNow, Timeline, WeeklyReview};
use crate::signals::{CronJob, Session, Skill, UsageReport};
use crate::summary::Summary;
use crate::tasks::ActiveTask;
use crate::triage::{TriageKind, TriagePatch, TriageRecord};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<OpsCore>,
    pub roles: Arc<RoleBook>,
}

pub struct ApiError(OpsError);

impl From<OpsError> for ApiError {
    fn from(e: OpsError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            OpsError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            OpsError::Forbidden => StatusCode::FORBIDDEN,
            OpsError::NotFound(_) => StatusCode::NOT_FOUND,
            OpsError::Validation(_) => StatusCode::BAD_REQUEST,
            OpsError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            OpsError::UpstreamFailed(_) | OpsError::UpstreamMalformed(_) => StatusCode::BAD_GATEWAY,
            OpsError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_upstream() || status.is_server_error() {
            warn!("[http] {}: {}", status, self.0);
        }
        (status, Json(json!({ "ok": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn caller(app: &AppState, headers: &HeaderMap) -> Identity {
    let user = ["x-forwarded-user", "x-remote-user"]
        .iter()
        .find_map(|h| headers.get(*h).and_then(|v| v.to_str().ok()));
    app.roles.resolve(user)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/me", get(get_me))
        .route("/api/summary", get(get_summary))
        .route("/api/alerts", get(get_alerts))
        .route("/api/intel", get(get_intel))
        .route("/api/tasks/active", get(get_active_tasks))
        .route("/api/tasks/replay", get(get_task_replay))
        .route("/api/operator/now", get(get_operator_now))
        .route("/api/operator/note", post(post_operator_note))
        .route("/api/timeline", get(get_timeline))
        .route("/api/review/weekly", get(get_weekly_review))
        .route("/api/triage", get(get_triage).post(post_triage))
        .route("/api/ai/fix/start", post(post_fix_start))
        .route("/api/ai/fix/status", get(get_fix_status))
        .route("/api/ai/fix/list", get(get_fix_list))
        .route("/api/crons", get(get_crons))
        .route("/api/cron", get(get_cron))
        .route("/api/cron/runs", get(get_cron_runs))
        .route("/api/cron/run", post(post_cron_run))
        .route("/api/cron/toggle", post(post_cron_toggle))
        .route("/api/cron/delete", post(post_cron_delete))
        .route("/api/cron/update", post(post_cron_update))
        .route("/api/session", get(get_session))
        .route("/api/sessions", get(get_sessions))
        .route("/api/session/model", post(post_session_model))
        .route("/api/usage", get(get_usage))
        .route("/api/skills", get(get_skills))
        .route("/api/audit", get(get_audit))
        .with_state(app_state)
}

async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.core.health())
}

async fn get_me(State(app): State<AppState>, headers: HeaderMap) -> Json<Identity> {
    Json(caller(&app, &headers))
}

async fn get_summary(State(app): State<AppState>) -> ApiResult<Summary> {
    Ok(Json(app.core.summary().await?))
}

async fn get_alerts(State(app): State<AppState>) -> Json<Vec<Alert>> {
    Json(app.core.alerts().await)
}

async fn get_intel(State(app): State<AppState>) -> Json<Intelligence> {
    Json(app.core.intelligence().await)
}

async fn get_active_tasks(State(app): State<AppState>) -> Json<Vec<ActiveTask>> {
    Json(app.core.active_tasks().await)
}

#[derive(Debug, Deserialize)]
struct IdParams {
    #[serde(default)]
    id: String,
}

async fn get_task_replay(State(app): State<AppState>, Query(p): Query<IdParams>) -> ApiResult<TaskReplay> {
    Ok(Json(app.core.replay_task(&p.id).await?))
}

async fn get_operator_now(State(app): State<AppState>) -> Json<OperatorNow> {
    Json(app.core.operator_now().await)
}

async fn post_operator_note(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(note): Json<OperatorNote>,
) -> ApiResult<OperatorEvent> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.add_operator_note(&who, note).await?))
}

async fn get_timeline(State(app): State<AppState>) -> Json<Timeline> {
    Json(app.core.timeline().await)
}

async fn get_weekly_review(State(app): State<AppState>) -> Json<WeeklyReview> {
    Json(app.core.weekly_review())
}

#[derive(Debug, Deserialize)]
struct TriageParams {
    kind: Option<String>,
}

async fn get_triage(State(app): State<AppState>, Query(p): Query<TriageParams>) -> ApiResult<Vec<TriageRecord>> {
    let kind = p.kind.as_deref().map(TriageKind::parse).transpose()?;
    Ok(Json(app.core.triage_list(kind)))
}

#[derive(Debug, Deserialize)]
struct TriageWrite {
    kind: String,
    key: String,
    #[serde(flatten)]
    patch: TriagePatch,
}

async fn post_triage(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TriageWrite>,
) -> ApiResult<TriageRecord> {
    let who = caller(&app, &headers);
    let kind = TriageKind::parse(&body.kind)?;
    Ok(Json(app.core.set_triage(&who, kind, &body.key, body.patch).await?))
}

async fn post_fix_start(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FixRequest>,
) -> ApiResult<FixOperationView> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.start_fix(&who, request).await?))
}

async fn get_fix_status(State(app): State<AppState>, Query(p): Query<IdParams>) -> ApiResult<FixOperationView> {
    Ok(Json(app.core.fix_status(&p.id)?))
}

async fn get_fix_list(State(app): State<AppState>) -> Json<Vec<FixOperationView>> {
    Json(app.core.fix_list())
}

async fn get_crons(State(app): State<AppState>) -> Json<CronList> {
    Json(app.core.crons().await)
}

async fn get_cron(State(app): State<AppState>, Query(p): Query<IdParams>) -> ApiResult<CronJob> {
    Ok(Json(app.core.cron(&p.id).await?))
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    #[serde(default)]
    key: String,
}

async fn get_session(State(app): State<AppState>, Query(p): Query<SessionParams>) -> ApiResult<Session> {
    Ok(Json(app.core.session(&p.key).await?))
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    limit: Option<usize>,
}

async fn get_audit(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(p): Query<AuditParams>,
) -> ApiResult<Vec<AuditEntry>> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.audit_tail(&who, p.limit.unwrap_or(100)).await?))
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    #[serde(default)]
    id: String,
    limit: Option<usize>,
}

async fn get_cron_runs(State(app): State<AppState>, Query(p): Query<RunsParams>) -> ApiResult<Value> {
    Ok(Json(app.core.cron_runs(&p.id, p.limit).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CronBody {
    id: String,
    enabled: bool,
}

async fn post_cron_run(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CronBody>,
) -> ApiResult<CronActionResult> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.cron_run(&who, &body.id).await?))
}

async fn post_cron_toggle(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CronBody>,
) -> ApiResult<CronActionResult> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.cron_toggle(&who, &body.id, body.enabled).await?))
}

async fn post_cron_delete(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CronBody>,
) -> ApiResult<CronActionResult> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.cron_delete(&who, &body.id).await?))
}

async fn post_cron_update(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CronUpdate>,
) -> ApiResult<Value> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.cron_update(&who, body).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ListParams {
    agent_id: Option<String>,
    q: String,
}

async fn get_sessions(State(app): State<AppState>, Query(p): Query<ListParams>) -> ApiResult<Vec<Session>> {
    Ok(Json(app.core.sessions(p.agent_id.as_deref(), &p.q).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelBody {
    key: String,
    model: String,
}

async fn post_session_model(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ModelBody>,
) -> ApiResult<SessionModelResult> {
    let who = caller(&app, &headers);
    Ok(Json(app.core.set_session_model(&who, &body.key, &body.model).await?))
}

async fn get_usage(State(app): State<AppState>) -> ApiResult<UsageReport> {
    Ok(Json(app.core.usage().await?))
}

async fn get_skills(State(app): State<AppState>, Query(p): Query<ListParams>) -> ApiResult<Vec<Skill>> {
    Ok(Json(app.core.skills(p.agent_id.as_deref(), &p.q).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (OpsError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (OpsError::Forbidden, StatusCode::FORBIDDEN),
            (OpsError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (OpsError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (OpsError::UpstreamTimeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (OpsError::UpstreamFailed("x".into()), StatusCode::BAD_GATEWAY),
            (OpsError::UpstreamMalformed("x".into()), StatusCode::BAD_GATEWAY),
            (OpsError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_cron_update_body_flattens_patch() {
        let body: CronUpdate =
            serde_json::from_value(json!({"id": "cron-7", "payloadMessage": "ping", "timeout": 120})).unwrap();
        assert_eq!(body.id, "cron-7");
        assert_eq!(body.patch.payload_message.as_deref(), Some("ping"));
        assert_eq!(body.patch.timeout, Some(120.0));
        assert!(body.patch.schedule.is_none());
    }
}
