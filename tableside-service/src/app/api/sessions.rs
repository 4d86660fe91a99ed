use axum::{
    extract::{Path, Query, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::error::{ErrorCode, ServiceError};
use crate::models::TableSession;
use crate::query::{SessionFilter, SessionStats};
use crate::session::SessionJoin;
use crate::store::SessionRecord;

use super::{blocking, parse_list, ApiError, AppState, ClientIp};

#[derive(Debug, Deserialize)]
pub struct InitSessionRequest {
    pub table_number: i32,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseSessionRequest {
    pub reason: Option<String>,
    pub closed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FlagSessionRequest {
    pub reason: String,
    pub flagged_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<String>,
    pub table: Option<String>,
    pub flagged: Option<bool>,
    pub started_from: Option<DateTime<Utc>>,
    pub started_to: Option<DateTime<Utc>>,
}

impl ListSessionsQuery {
    fn into_filter(self) -> Result<SessionFilter, ApiError> {
        Ok(SessionFilter {
            statuses: parse_list(self.status.as_deref(), "status")?,
            table_numbers: parse_list(self.table.as_deref(), "table")?,
            flagged: self.flagged,
            started_from: self.started_from,
            started_to: self.started_to,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<TableSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(init_session).get(list_sessions))
        .route("/sessions/stats", get(session_stats))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/validate", get(validate_session))
        .route("/sessions/{id}/extend", post(extend_session))
        .route("/sessions/{id}/close", post(close_session))
        .route(
            "/sessions/{id}/flag",
            post(flag_session).delete(unflag_session),
        )
}

#[instrument(skip(state, headers))]
pub async fn init_session(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    Json(payload): Json<InitSessionRequest>,
) -> Result<(StatusCode, Json<SessionJoin>), ApiError> {
    let mut device = payload.device_info;
    if device.user_agent.is_none() {
        device.user_agent = headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
    }

    let join = blocking(move || {
        state
            .sessions
            .init_session(payload.table_number, device, &client_ip, Utc::now())
    })
    .await?;
    let status = if join.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(join)))
}

#[instrument(skip(state))]
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<TableSession>>, ApiError> {
    let filter = query.into_filter()?;
    let sessions = blocking(move || state.sessions.list(&filter)).await?;
    Ok(Json(sessions))
}

#[instrument(skip(state))]
pub async fn session_stats(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionStats>, ApiError> {
    let filter = query.into_filter()?;
    let stats = blocking(move || state.sessions.stats(&filter)).await?;
    Ok(Json(stats))
}

#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionRecord>, ApiError> {
    let record = blocking(move || state.sessions.get(session_id)).await?;
    Ok(Json(record))
}

/// Answers "may this device order right now". Unknown and expired sessions
/// are a negative answer, not an error.
#[instrument(skip(state))]
pub async fn validate_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ValidateSessionResponse>, ApiError> {
    let result = blocking(move || match state.sessions.validate(session_id, Utc::now()) {
        Ok(session) => Ok(Ok(session)),
        Err(err @ (ServiceError::SessionNotFound(_) | ServiceError::SessionExpired(_))) => {
            Ok(Err(err.code()))
        }
        Err(err) => Err(err),
    })
    .await?;

    Ok(Json(match result {
        Ok(session) => ValidateSessionResponse {
            valid: true,
            session: Some(session),
            code: None,
        },
        Err(code) => ValidateSessionResponse {
            valid: false,
            session: None,
            code: Some(code),
        },
    }))
}

#[instrument(skip(state))]
pub async fn extend_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<TableSession>, ApiError> {
    let session = blocking(move || state.sessions.extend(session_id, Utc::now())).await?;
    Ok(Json(session))
}

#[instrument(skip(state))]
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<CloseSessionRequest>,
) -> Result<Json<TableSession>, ApiError> {
    let session = blocking(move || {
        state.sessions.close(
            session_id,
            payload.reason.as_deref(),
            payload.closed_by.as_deref(),
            Utc::now(),
        )
    })
    .await?;
    Ok(Json(session))
}

#[instrument(skip(state))]
pub async fn flag_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<FlagSessionRequest>,
) -> Result<Json<TableSession>, ApiError> {
    let session = blocking(move || {
        state.sessions.flag(
            session_id,
            &payload.reason,
            true,
            payload.flagged_by.as_deref(),
            Utc::now(),
        )
    })
    .await?;
    Ok(Json(session))
}

#[instrument(skip(state))]
pub async fn unflag_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<TableSession>, ApiError> {
    let session = blocking(move || state.sessions.unflag(session_id)).await?;
    Ok(Json(session))
}
