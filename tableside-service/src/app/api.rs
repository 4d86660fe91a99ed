use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{ErrorCode, ServiceError};
use crate::order::{OrderPolicy, OrderService};
use crate::session::{SessionPolicy, SessionService};
use crate::store::Store;

mod orders;
mod sessions;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionService,
    pub orders: OrderService,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, session_policy: SessionPolicy, order_policy: OrderPolicy) -> Self {
        let sessions = SessionService::new(store.clone(), session_policy);
        let orders = OrderService::new(store, sessions.clone(), order_policy);
        Self { sessions, orders }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0}")]
    BadRequest(String),
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ValidationError | ErrorCode::PriceMismatch | ErrorCode::TotalMismatch => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::TableNotFound
        | ErrorCode::InvalidSession
        | ErrorCode::OrderNotFound
        | ErrorCode::ItemUnavailable => StatusCode::NOT_FOUND,
        ErrorCode::SessionClosed
        | ErrorCode::DeviceLimitExceeded
        | ErrorCode::IllegalTransition
        | ErrorCode::StateChanged
        | ErrorCode::DuplicateSuspected
        | ErrorCode::ConfirmationRequired => StatusCode::CONFLICT,
        ErrorCode::SessionExpired => StatusCode::GONE,
        ErrorCode::RateLimitExceeded | ErrorCode::SlowDown => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::BotDetected => StatusCode::FORBIDDEN,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message, retryable) = match &self {
            ApiError::Service(ServiceError::Store(err)) => {
                error!(error = %err, "Storage failure");
                (ErrorCode::InternalError, "internal error".to_string(), true)
            }
            ApiError::Service(err) => (err.code(), err.to_string(), err.retryable()),
            ApiError::BadRequest(message) => (ErrorCode::ValidationError, message.clone(), false),
            ApiError::Task(err) => {
                error!(error = %err, "Request task failed");
                (ErrorCode::InternalError, "internal error".to_string(), true)
            }
        };

        let mut body = json!({
            "error": message,
            "code": code,
            "retryable": retryable,
        });
        if let ApiError::Service(ServiceError::Rejected(rejection)) = &self {
            body["action"] = json!(rejection.action);
            if let Some(wait) = rejection.wait_seconds {
                body["wait_seconds"] = json!(wait);
            }
        }

        (status_for(code), Json(body)).into_response()
    }
}

/// Runs a synchronous service call off the async runtime.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await??)
}

/// First `X-Forwarded-For` entry, else the peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(ip) = forwarded {
            return Ok(ClientIp(ip.to_string()));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(ClientIp(peer.unwrap_or_else(|| "unknown".to_string())))
    }
}

/// Parses a comma separated query value such as `status=pending,ready`.
pub(crate) fn parse_list<T: FromStr>(raw: Option<&str>, field: &str) -> Result<Vec<T>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("invalid {field}: {value}")))
        })
        .collect()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(sessions::router())
        .merge(orders::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(bind_addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Tableside API listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for shutdown signal");
        }
    })
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use bigdecimal::BigDecimal;
    use tower::ServiceExt;

    use super::*;
    use crate::models::MenuItem;
    use crate::store::MemoryStore;

    pub(crate) fn test_app() -> Router {
        let store = Arc::new(MemoryStore::with_tables(&[7, 12]));
        store.add_menu_item(MenuItem {
            id: "pho".to_string(),
            name: "Pho".to_string(),
            price: BigDecimal::from(50),
            cooking_time: Some(10),
            available: true,
        });
        store.add_menu_item(MenuItem {
            id: "tea".to_string(),
            name: "Iced tea".to_string(),
            price: BigDecimal::from(25),
            cooking_time: Some(2),
            available: true,
        });
        router(AppState::new(
            store,
            SessionPolicy::default(),
            OrderPolicy::default(),
        ))
    }

    pub(crate) async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&test_app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_parse_list() {
        let statuses: Vec<crate::models::OrderStatus> =
            parse_list(Some("pending, ready,"), "status").unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(parse_list::<i32>(Some("7,x"), "table").is_err());
        assert!(parse_list::<i32>(None, "table").unwrap().is_empty());
    }

    #[test]
    fn test_rejections_map_to_status_classes() {
        assert_eq!(status_for(ErrorCode::SlowDown), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorCode::SessionExpired), StatusCode::GONE);
        assert_eq!(status_for(ErrorCode::DuplicateSuspected), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::BotDetected), StatusCode::FORBIDDEN);
    }
}
