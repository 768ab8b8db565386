//! HTTP surface: SOS trigger, contact registry, location ingestion, family
//! presence map, telephony status webhook, retention job trigger.
//!
//! Handlers return `(StatusCode, Json<Value>)` with an
//! `{"error": "..."}` body convention for failures. The webhook endpoint is
//! deliberately forgiving: only missing identifiers produce a 400, and an
//! unknown call sid is acknowledged with success so the provider does not
//! retry-storm us.

pub mod webhook;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::DispatchError;
use crate::escalation::EscalationDispatcher;
use crate::family::{resolve_presence_access, AccessDecision};
use crate::presence::{build_markers, publish_ping, purge_expired_pings, validate_ping, PingInput};
use crate::state::AppState;

type ApiResponse = (StatusCode, Json<Value>);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sos", post(trigger_sos))
        .route("/v1/sos/:id", get(get_incident))
        .route("/v1/sos/:id/close", post(close_incident))
        .route("/v1/contacts", post(create_contact).get(list_contacts))
        .route("/v1/contacts/:id", delete(delete_contact))
        .route("/v1/location/ping", post(ingest_ping))
        .route("/v1/location/pause", post(pause_sharing))
        .route("/v1/location/resume", post(resume_sharing))
        .route("/v1/family/:group_id/presence", get(family_presence))
        .route("/webhooks/telephony/status", post(telephony_status))
        .route("/v1/jobs/retention", post(retention_job))
        .with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(json!({ "error": message })))
}

/// Resolve the bearer token on the request to a user id.
fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<String, ApiResponse> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty());

    let Some(token) = token else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing bearer token",
        ));
    };

    match state.with_db(|db| db.lookup_api_token(token)) {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid bearer token",
        )),
        Err(e) => {
            log::error!("Token lookup failed: {}", e);
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage failure",
            ))
        }
    }
}

fn map_dispatch_error(err: DispatchError) -> ApiResponse {
    match &err {
        DispatchError::NoContactsConfigured => {
            error_response(StatusCode::CONFLICT, &err.to_string())
        }
        DispatchError::TelephonyNotConfigured => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        DispatchError::IncidentNotFound(_) => {
            error_response(StatusCode::NOT_FOUND, &err.to_string())
        }
        DispatchError::CallPlacement(_) => {
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
        DispatchError::Db(e) => {
            log::error!("Storage failure in dispatch: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

/// Constant-time byte comparison for the retention job secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============================================================================
// Handlers
// ============================================================================

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResponse {
    let reachable = state
        .with_db(|db| {
            db.conn_ref()
                .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                .map_err(Into::into)
        })
        .is_ok();

    if reachable {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "database unreachable")
    }
}

async fn trigger_sos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let dispatcher = EscalationDispatcher::new(state.clone());
    match dispatcher.trigger(&user_id).await {
        Ok(incident) => {
            let attempts = state
                .with_db(|db| db.get_attempts(&incident.id))
                .unwrap_or_default();
            (
                StatusCode::CREATED,
                Json(json!({ "incident": incident, "attempts": attempts })),
            )
        }
        Err(err) => map_dispatch_error(err),
    }
}

async fn get_incident(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let incident = match state.with_db(|db| db.get_incident(&id)) {
        Ok(incident) => incident,
        Err(e) => {
            log::error!("Incident lookup failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    };

    // A foreign incident id reads as absent, not forbidden
    let Some(incident) = incident.filter(|i| i.owner_id == user_id) else {
        return error_response(StatusCode::NOT_FOUND, "incident not found");
    };

    let attempts = state
        .with_db(|db| db.get_attempts(&incident.id))
        .unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "incident": incident, "attempts": attempts })),
    )
}

async fn close_incident(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let owner_match = match state.with_db(|db| db.get_incident(&id)) {
        Ok(Some(incident)) => incident.owner_id == user_id,
        Ok(None) => false,
        Err(e) => {
            log::error!("Incident lookup failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    };
    if !owner_match {
        return error_response(StatusCode::NOT_FOUND, "incident not found");
    }

    let dispatcher = EscalationDispatcher::new(state.clone());
    match dispatcher.close(&id) {
        Ok(incident) => (StatusCode::OK, Json(json!({ "incident": incident }))),
        Err(err) => map_dispatch_error(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewContactRequest {
    name: String,
    phone: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    relationship: Option<String>,
    priority: i64,
}

async fn create_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let request: NewContactRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request body"),
    };
    if request.name.trim().is_empty() || request.phone.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name and phone are required");
    }

    match state.with_db(|db| {
        db.insert_contact(
            &user_id,
            request.name.trim(),
            request.phone.trim(),
            request.email.as_deref(),
            request.relationship.as_deref().unwrap_or("other"),
            request.priority,
        )
    }) {
        Ok(contact) => (StatusCode::CREATED, Json(json!({ "contact": contact }))),
        Err(e) => {
            log::error!("Contact insert failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn list_contacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state.with_db(|db| db.get_contacts(&user_id)) {
        Ok(contacts) => (StatusCode::OK, Json(json!({ "contacts": contacts }))),
        Err(e) => {
            log::error!("Contact list failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn delete_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state.with_db(|db| db.delete_contact(&user_id, &id)) {
        Ok(true) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "contact not found"),
        Err(e) => {
            log::error!("Contact delete failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn ingest_ping(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let input: PingInput = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request body"),
    };

    let record = match validate_ping(&user_id, &input) {
        Ok(record) => record,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.message());
        }
    };

    match state.with_db(|db| publish_ping(db, &record)) {
        Ok(applied) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "presenceUpdated": applied })),
        ),
        Err(e) => {
            log::error!("Ping ingest failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn pause_sharing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResponse {
    set_sharing_paused(state, headers, true).await
}

async fn resume_sharing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResponse {
    set_sharing_paused(state, headers, false).await
}

async fn set_sharing_paused(
    state: Arc<AppState>,
    headers: HeaderMap,
    paused: bool,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state.with_db(|db| db.set_presence_paused(&user_id, paused)) {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true, "paused": paused }))),
        Err(e) => {
            log::error!("Pause toggle failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn family_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> ApiResponse {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let decision = match state.with_db(|db| resolve_presence_access(db, &user_id, &group_id)) {
        Ok(decision) => decision,
        Err(e) => {
            log::error!("Access resolution failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    };

    match decision {
        AccessDecision::Authorized => {}
        AccessDecision::Denied => {
            return error_response(StatusCode::FORBIDDEN, "not a member of this group");
        }
        AccessDecision::Indeterminate => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "membership role unresolved, retry",
            );
        }
    }

    match state.with_db(|db| db.get_group_presence(&group_id)) {
        Ok(members) => {
            let markers = build_markers(members, Utc::now());
            (StatusCode::OK, Json(json!({ "members": markers })))
        }
        Err(e) => {
            log::error!("Presence query failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn telephony_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let callback = match webhook::parse_status_callback(content_type, &body) {
        Ok(callback) => callback,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let Some(status) = webhook::map_provider_status(&callback.call_status) else {
        log::warn!(
            "Unknown provider call status '{}' for {}",
            callback.call_status,
            callback.call_sid
        );
        return (StatusCode::OK, Json(json!({ "ok": true })));
    };

    let dispatcher = EscalationDispatcher::new(state.clone());
    match dispatcher
        .record_status(&callback.call_sid, status, callback.duration_seconds)
        .await
    {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => {
            // A storage failure is worth the provider retrying later.
            log::error!("Status callback handling failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn retention_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResponse {
    let secret = state.config.retention.job_secret.as_bytes();
    if secret.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "retention trigger disabled");
    }

    let presented = headers
        .get("x-job-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(presented.as_bytes(), secret) {
        return error_response(StatusCode::UNAUTHORIZED, "bad job secret");
    }

    let max_age_days = state.config.retention.max_age_days;
    match state.with_db(|db| purge_expired_pings(db, max_age_days, Utc::now())) {
        Ok(deleted) => (StatusCode::OK, Json(json!({ "deleted": deleted }))),
        Err(e) => {
            log::error!("Retention purge failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}
