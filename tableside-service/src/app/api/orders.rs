use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{Order, OrderStatus, PaymentStatus};
use crate::order::{CreateOrderRequest, CreatedOrder, OrderDetailsUpdate};
use crate::query::{OrderFilter, OrderSort, OrderStats, SortDirection, SortField};
use crate::store::OrderRecord;

use super::{blocking, parse_list, ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub table: Option<String>,
    pub session_id: Option<Uuid>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub assigned_staff: Option<String>,
    pub min_amount: Option<BigDecimal>,
    pub max_amount: Option<BigDecimal>,
    pub search: Option<String>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortDirection>,
    pub limit: Option<usize>,
}

impl ListOrdersQuery {
    fn filter(&self) -> Result<OrderFilter, ApiError> {
        Ok(OrderFilter {
            statuses: parse_list(self.status.as_deref(), "status")?,
            payment_statuses: parse_list(self.payment_status.as_deref(), "payment_status")?,
            table_numbers: parse_list(self.table.as_deref(), "table")?,
            session_id: self.session_id,
            created_from: self.created_from,
            created_to: self.created_to,
            assigned_staff: self.assigned_staff.clone(),
            min_amount: self.min_amount.clone(),
            max_amount: self.max_amount.clone(),
            search: self.search.clone(),
        })
    }

    fn sort(&self) -> OrderSort {
        OrderSort {
            field: self.sort_by.unwrap_or_default(),
            direction: self.sort_order.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/stats", get(order_stats))
        .route("/orders/{id}", get(get_order).patch(update_order_details))
        .route("/orders/{id}/status", post(transition_order))
        .route("/orders/{id}/payment", post(update_payment))
        .route("/orders/{id}/cancel", post(cancel_order))
}

#[instrument(skip(state))]
pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreatedOrder>), ApiError> {
    let created = blocking(move || state.orders.create(payload, Utc::now())).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[instrument(skip(state))]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<OrderRecord>>, ApiError> {
    let filter = query.filter()?;
    let sort = query.sort();
    let limit = query.limit;
    let orders = blocking(move || state.orders.list(&filter, sort, limit)).await?;
    Ok(Json(orders))
}

#[instrument(skip(state))]
pub async fn order_stats(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<OrderStats>, ApiError> {
    let filter = query.filter()?;
    let stats = blocking(move || state.orders.stats(&filter)).await?;
    Ok(Json(stats))
}

#[instrument(skip(state))]
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderRecord>, ApiError> {
    let record = blocking(move || state.orders.get(order_id)).await?;
    Ok(Json(record))
}

#[instrument(skip(state))]
pub async fn transition_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<Order>, ApiError> {
    let order =
        blocking(move || state.orders.transition(order_id, payload.status, Utc::now())).await?;
    Ok(Json(order))
}

#[instrument(skip(state))]
pub async fn update_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<PaymentRequest>,
) -> Result<Json<Order>, ApiError> {
    let order = blocking(move || {
        state
            .orders
            .update_payment(order_id, payload.payment_status, Utc::now())
    })
    .await?;
    Ok(Json(order))
}

#[instrument(skip(state))]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Order>, ApiError> {
    let order = blocking(move || {
        state
            .orders
            .cancel(order_id, payload.reason.as_deref(), Utc::now())
    })
    .await?;
    Ok(Json(order))
}

#[instrument(skip(state))]
pub async fn update_order_details(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<OrderDetailsUpdate>,
) -> Result<Json<Order>, ApiError> {
    let order = blocking(move || state.orders.update_details(order_id, payload, Utc::now())).await?;
    Ok(Json(order))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    use super::super::tests::{send, test_app};

    async fn open_session(app: &axum::Router) -> String {
        let body = json!({ "table_number": 12, "device_info": { "fingerprint": "device-a" } });
        let (_, joined) = send(app, "POST", "/sessions", Some(body)).await;
        joined["session"]["id"].as_str().unwrap().to_string()
    }

    fn order_body(session_id: &str, total: &str) -> Value {
        json!({
            "table_number": 12,
            "session_id": session_id,
            "device_fingerprint": "device-a",
            "items": [
                { "menu_item_id": "pho", "name": "Pho", "price": "50", "quantity": 1 },
                { "menu_item_id": "tea", "name": "Iced tea", "price": "25", "quantity": 2 }
            ],
            "total_amount": total
        })
    }

    #[tokio::test]
    async fn test_order_flow_over_http() {
        let app = test_app();
        let session_id = open_session(&app).await;

        let (status, created) = send(&app, "POST", "/orders", Some(order_body(&session_id, "100"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["items"].as_array().unwrap().len(), 2);
        assert_eq!(created["verdict"]["action"], "ALLOW");
        let id = created["id"].as_str().unwrap().to_string();

        for next in ["confirmed", "preparing", "ready", "delivered"] {
            let (status, order) = send(
                &app,
                "POST",
                &format!("/orders/{id}/status"),
                Some(json!({ "status": next })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(order["status"], next);
        }

        let (status, order) = send(
            &app,
            "POST",
            &format!("/orders/{id}/payment"),
            Some(json!({ "payment_status": "paid" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["status"], "completed");
        assert!(order["completed_at"].is_string());

        let (_, listed) = send(&app, "GET", "/orders?status=completed&payment_status=paid", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, stats) = send(&app, "GET", "/orders/stats", None).await;
        assert_eq!(stats["total_orders"], 1);
        assert_eq!(stats["paid_orders"], 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_conflict() {
        let app = test_app();
        let session_id = open_session(&app).await;
        let (_, created) = send(&app, "POST", "/orders", Some(order_body(&session_id, "100"))).await;
        let id = created["id"].as_str().unwrap();

        let (status, error) = send(
            &app,
            "POST",
            &format!("/orders/{id}/status"),
            Some(json!({ "status": "delivered" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["code"], "ILLEGAL_TRANSITION");

        let (_, order) = send(&app, "GET", &format!("/orders/{id}"), None).await;
        assert_eq!(order["status"], "pending");
    }

    #[tokio::test]
    async fn test_total_mismatch_is_bad_request() {
        let app = test_app();
        let session_id = open_session(&app).await;

        let (status, error) = send(&app, "POST", "/orders", Some(order_body(&session_id, "80"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "TOTAL_MISMATCH");
    }

    #[tokio::test]
    async fn test_rapid_resubmission_asks_to_wait() {
        let app = test_app();
        let session_id = open_session(&app).await;
        send(&app, "POST", "/orders", Some(order_body(&session_id, "100"))).await;

        let mut second = order_body(&session_id, "50");
        second["items"] = json!([{ "menu_item_id": "pho", "name": "Pho", "price": "50", "quantity": 1 }]);
        let (status, error) = send(&app, "POST", "/orders", Some(second)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error["code"], "SLOW_DOWN");
        assert_eq!(error["action"], "WAIT");
        assert_eq!(error["wait_seconds"], 10);
        assert_eq!(error["retryable"], true);
    }

    #[tokio::test]
    async fn test_cancel_and_edit_details() {
        let app = test_app();
        let (_, created) = send(
            &app,
            "POST",
            "/orders",
            Some(json!({
                "table_number": 7,
                "items": [{ "menu_item_id": "pho", "name": "Pho", "price": "50", "quantity": 1 }]
            })),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (status, order) = send(
            &app,
            "PATCH",
            &format!("/orders/{id}"),
            Some(json!({ "priority": "high", "notes": "allergy: peanuts" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["priority"], "high");

        let (status, order) = send(
            &app,
            "POST",
            &format!("/orders/{id}/cancel"),
            Some(json!({ "reason": "guest left" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["status"], "cancelled");

        let (status, error) = send(&app, "PATCH", &format!("/orders/{id}"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["code"], "ILLEGAL_TRANSITION");

        let uri = format!("/orders/{}", uuid::Uuid::new_v4());
        let (status, error) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "ORDER_NOT_FOUND");
    }
}
