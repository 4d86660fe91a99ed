use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::detector::{self, Action, DetectorConfig, Verdict};
use crate::error::{ErrorCode, Rejection, ServiceError};
use crate::events::OrderEvent;
use crate::models::{
    Customizations, DiningTable, Order, OrderLineItem, OrderPriority, OrderStatus, OrderType,
    PaymentStatus, SelectedOptions, TableSession, TableStatus,
};
use crate::query::{self, OrderFilter, OrderSort, OrderStats};
use crate::session::SessionService;
use crate::store::{OrderRecord, Store, StoreError};

pub const MAX_QUANTITY: i32 = 99;
pub const MAX_NOTES_LEN: usize = 200;

/// Largest difference tolerated between the client total and ours.
fn total_tolerance() -> BigDecimal {
    BigDecimal::new(1.into(), 2)
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderPolicy {
    pub verify_client_totals: bool,
    pub default_cooking_minutes: i32,
    pub detector: DetectorConfig,
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            verify_client_totals: true,
            default_cooking_minutes: 15,
            detector: DetectorConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct LineItemRequest {
    pub menu_item_id: String,
    pub name: String,
    pub price: BigDecimal,
    pub quantity: i32,
    #[serde(default)]
    pub customizations: Customizations,
    #[serde(default)]
    pub selected_options: SelectedOptions,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct CreateOrderRequest {
    pub table_number: i32,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    pub items: Vec<LineItemRequest>,
    #[serde(default)]
    pub total_amount: Option<BigDecimal>,
    #[serde(default)]
    pub priority: OrderPriority,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub notes: Option<String>,
    /// Set on resubmission after the customer confirmed a suspected
    /// duplicate or an unusually large order.
    #[serde(default)]
    pub confirmed: bool,
}

/// Staff edits; `None` leaves a field as it is.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OrderDetailsUpdate {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: Option<OrderPriority>,
    #[serde(default)]
    pub assigned_staff: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CreatedOrder {
    #[serde(flatten)]
    pub record: OrderRecord,
    pub verdict: Verdict,
}

fn validate_notes(notes: Option<&str>, what: &str) -> Result<(), ServiceError> {
    match notes {
        Some(notes) if notes.chars().count() > MAX_NOTES_LEN => Err(ServiceError::Validation(
            format!("{what} notes must be at most {MAX_NOTES_LEN} characters"),
        )),
        _ => Ok(()),
    }
}

/// Structural checks that need no collaborator.
pub fn validate_request(request: &CreateOrderRequest) -> Result<(), ServiceError> {
    if request.table_number <= 0 {
        return Err(ServiceError::Validation(
            "table number must be positive".to_string(),
        ));
    }
    if request.items.is_empty() {
        return Err(ServiceError::Validation(
            "order must contain at least one item".to_string(),
        ));
    }
    for item in &request.items {
        if item.menu_item_id.trim().is_empty() || item.name.trim().is_empty() {
            return Err(ServiceError::Validation(
                "every item needs a menu item id and a name".to_string(),
            ));
        }
        if item.price <= BigDecimal::zero() {
            return Err(ServiceError::Validation(format!(
                "price of {} must be positive",
                item.name
            )));
        }
        if !(1..=MAX_QUANTITY).contains(&item.quantity) {
            return Err(ServiceError::Validation(format!(
                "quantity of {} must be between 1 and {MAX_QUANTITY}",
                item.name
            )));
        }
        if item
            .customizations
            .extras
            .iter()
            .any(|e| e.price < BigDecimal::zero())
        {
            return Err(ServiceError::Validation(format!(
                "extras of {} cannot have a negative price",
                item.name
            )));
        }
        validate_notes(item.notes.as_deref(), "item")?;
    }
    if let Some(total) = &request.total_amount {
        if total <= &BigDecimal::zero() {
            return Err(ServiceError::Validation(
                "order total must be positive".to_string(),
            ));
        }
    }
    validate_notes(request.notes.as_deref(), "order")
}

/// Base and extras of every line, both per unit.
pub fn order_total(items: &[OrderLineItem]) -> BigDecimal {
    items.iter().map(OrderLineItem::contribution).sum()
}

/// Mean of the per-line preparation times, each line weighted by its own
/// quantity, rounded up to whole minutes.
pub fn estimated_minutes(lines: &[(Option<i32>, i32)], default_minutes: i32) -> i32 {
    if lines.is_empty() {
        return 0;
    }
    let weighted: i64 = lines
        .iter()
        .map(|(cooking, quantity)| {
            i64::from(cooking.unwrap_or(default_minutes)) * i64::from(*quantity)
        })
        .sum();
    let count = lines.len() as i64;
    ((weighted + count - 1) / count) as i32
}

pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::rng().random_range(0..10_000);
    format!("ORD-{}-{suffix:04}", now.format("%Y%m%d"))
}

/// Validates incoming orders, screens them for abuse and drives them through
/// the status graph. Every write is guarded by the order's version and status.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn Store>,
    sessions: SessionService,
    policy: OrderPolicy,
}

impl OrderService {
    pub fn new(store: Arc<dyn Store>, sessions: SessionService, policy: OrderPolicy) -> Self {
        Self {
            store,
            sessions,
            policy,
        }
    }

    pub fn create(
        &self,
        request: CreateOrderRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedOrder, ServiceError> {
        validate_request(&request)?;

        let table = self
            .store
            .find_table_by_number(request.table_number)?
            .ok_or(ServiceError::TableNotFound(request.table_number))?;

        let session = match request.session_id {
            Some(session_id) => {
                let session = self.sessions.validate(session_id, now)?;
                if session.table_id != table.id {
                    return Err(ServiceError::SessionTableMismatch {
                        session_id,
                        expected: table.number,
                        actual: session.table_number,
                    });
                }
                Some(session)
            }
            None => None,
        };

        let order_id = Uuid::new_v4();
        let (items, estimated_time) = self.price_lines(order_id, &request.items)?;
        let computed_total = order_total(&items);
        let total_amount = self.reconcile_total(&request, computed_total)?;

        let verdict = self.screen(&table, session.as_ref(), &items, request.confirmed, now)?;

        let order = Order {
            id: order_id,
            version: 1,
            order_number: generate_order_number(now),
            table_id: table.id,
            table_number: table.number,
            session_id: session.as_ref().map(|s| s.id),
            device_fingerprint: request.device_fingerprint.clone(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            priority: request.priority,
            order_type: request.order_type,
            total_amount,
            estimated_time,
            notes: request.notes.clone(),
            assigned_staff: None,
            cancel_reason: None,
            created_at: now,
            confirmed_at: None,
            preparing_at: None,
            ready_at: None,
            delivered_at: None,
            completed_at: None,
            cancelled_at: None,
            paid_at: None,
            updated_at: now,
        };
        self.store
            .insert_order(&order, &items, self.sessions.policy().rate_window)
            .map_err(|err| match (err, order.session_id) {
                (StoreError::NotFound, Some(session_id)) => {
                    ServiceError::SessionNotFound(session_id)
                }
                (other, _) => other.into(),
            })?;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            table_number = order.table_number,
            total = %order.total_amount,
            "Order created"
        );

        // The order is committed; the table status is a display aid.
        if let Err(err) = self
            .store
            .set_table_status(table.id, TableStatus::Occupied, now)
        {
            error!(table_number = table.number, error = %err, "Failed to mark table occupied");
        }

        Ok(CreatedOrder {
            record: OrderRecord { order, items },
            verdict,
        })
    }

    /// Snapshots names and prices into line items and checks them against
    /// the catalog. Also returns the preparation estimate.
    fn price_lines(
        &self,
        order_id: Uuid,
        requested: &[LineItemRequest],
    ) -> Result<(Vec<OrderLineItem>, i32), ServiceError> {
        let mut ids: Vec<String> = requested.iter().map(|i| i.menu_item_id.clone()).collect();
        ids.sort();
        ids.dedup();
        let catalog: HashMap<String, _> = self
            .store
            .find_menu_items(&ids)?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();

        let mut items = Vec::with_capacity(requested.len());
        let mut timings = Vec::with_capacity(requested.len());
        for (position, line) in requested.iter().enumerate() {
            let menu_item = catalog
                .get(&line.menu_item_id)
                .filter(|m| m.available)
                .ok_or_else(|| ServiceError::ItemUnavailable(line.menu_item_id.clone()))?;

            if self.policy.verify_client_totals {
                let expected = &menu_item.price + line.selected_options.delta_total();
                if expected != line.price {
                    return Err(ServiceError::PriceMismatch {
                        menu_item_id: line.menu_item_id.clone(),
                        expected,
                        actual: line.price.clone(),
                    });
                }
            }

            timings.push((menu_item.cooking_time, line.quantity));
            items.push(OrderLineItem {
                id: Uuid::new_v4(),
                order_id,
                position: position as i32,
                menu_item_id: line.menu_item_id.clone(),
                name: line.name.trim().to_string(),
                price: line.price.clone(),
                quantity: line.quantity,
                subtotal: &line.price * BigDecimal::from(line.quantity),
                customizations: line.customizations.clone(),
                selected_options: line.selected_options.clone(),
                notes: line.notes.clone(),
            });
        }

        let estimate = estimated_minutes(&timings, self.policy.default_cooking_minutes);
        Ok((items, estimate))
    }

    fn reconcile_total(
        &self,
        request: &CreateOrderRequest,
        computed: BigDecimal,
    ) -> Result<BigDecimal, ServiceError> {
        let total = match &request.total_amount {
            Some(client) if self.policy.verify_client_totals => {
                if (client - &computed).abs() > total_tolerance() {
                    return Err(ServiceError::TotalMismatch {
                        expected: computed,
                        actual: client.clone(),
                    });
                }
                computed
            }
            Some(client) => client.clone(),
            None => computed,
        };
        if total <= BigDecimal::zero() {
            return Err(ServiceError::Validation(
                "order total must be positive".to_string(),
            ));
        }
        Ok(total)
    }

    /// Runs the abuse heuristics and turns their verdict into a rejection
    /// when needed. Orders without a session are judged on the table's
    /// recent orders. A failing history lookup skips the history checks but
    /// still applies the ones that only look at the order itself.
    fn screen(
        &self,
        table: &DiningTable,
        session: Option<&TableSession>,
        items: &[OrderLineItem],
        confirmed: bool,
        now: DateTime<Utc>,
    ) -> Result<Verdict, ServiceError> {
        let config = &self.policy.detector;
        let since = now - config.history_window();
        let history = match session {
            Some(session) => self.store.recent_session_orders(session.id, since),
            None => self.store.recent_table_orders(table.id, since),
        };
        let (verdict, history) = match history {
            Ok(history) => (
                detector::evaluate(session, items, &history, now, config),
                history,
            ),
            Err(err) => {
                warn!(
                    table_number = table.number,
                    session_id = ?session.map(|s| s.id),
                    error = %err,
                    "Order history unavailable, skipping history checks"
                );
                let verdict = detector::check_oversized(items, config)
                    .map(|finding| detector::combine(vec![finding], config))
                    .unwrap_or_else(Verdict::clean);
                (verdict, Vec::new())
            }
        };

        match verdict.action {
            Action::Block => {
                let rejection = verdict.rejection();
                warn!(table_number = table.number, reason = %rejection.reason, confidence = rejection.confidence, "Order blocked");
                if let Some(session) = session {
                    if let Err(err) =
                        self.sessions
                            .flag(session.id, &rejection.reason, false, None, now)
                    {
                        error!(session_id = %session.id, error = %err, "Failed to flag session");
                    }
                }
                return Err(ServiceError::Rejected(rejection));
            }
            Action::Wait => {
                warn!(table_number = table.number, reason = ?verdict.reason, "Order rate limited");
                return Err(ServiceError::Rejected(verdict.rejection()));
            }
            Action::Confirm if !confirmed => {
                return Err(ServiceError::Rejected(verdict.rejection()));
            }
            Action::Warn => {
                warn!(table_number = table.number, reason = ?verdict.reason, "Order looks unusual");
            }
            _ => {}
        }

        let duplicate = detector::check_duplicate(items, &history, now, config);
        if duplicate.is_duplicate && !confirmed {
            return Err(ServiceError::Rejected(Rejection {
                code: ErrorCode::DuplicateSuspected,
                action: Action::Confirm,
                reason: "an order with the same items was placed in the last minute".to_string(),
                confidence: 0.0,
                wait_seconds: None,
                retryable: true,
            }));
        }

        Ok(verdict)
    }

    pub fn get(&self, order_id: Uuid) -> Result<OrderRecord, ServiceError> {
        self.store
            .find_order(order_id)?
            .ok_or(ServiceError::OrderNotFound(order_id))
    }

    pub fn transition(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, ServiceError> {
        let mut order = self.get(order_id)?.order;
        let from = order.status;
        if !from.can_transition_to(next) {
            return Err(ServiceError::IllegalTransition { from, to: next });
        }
        order.enter(next, now);

        self.write(order, from, |order| OrderEvent::status_changed(order, from), now)
    }

    /// Setting `paid` on a delivered order also completes it.
    pub fn update_payment(
        &self,
        order_id: Uuid,
        payment_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, ServiceError> {
        let mut order = self.get(order_id)?.order;
        let from = order.status;
        order.payment_status = payment_status;
        order.updated_at = now;
        if payment_status == PaymentStatus::Paid {
            order.paid_at.get_or_insert(now);
            if from == OrderStatus::Delivered {
                order.enter(OrderStatus::Completed, now);
            }
        }

        self.write(order, from, OrderEvent::payment_updated, now)
    }

    /// Only pending and confirmed orders can be cancelled by this call.
    pub fn cancel(
        &self,
        order_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Order, ServiceError> {
        validate_notes(reason, "cancel")?;
        let mut order = self.get(order_id)?.order;
        let from = order.status;
        if !matches!(from, OrderStatus::Pending | OrderStatus::Confirmed) {
            return Err(ServiceError::IllegalTransition {
                from,
                to: OrderStatus::Cancelled,
            });
        }
        order.enter(OrderStatus::Cancelled, now);
        order.cancel_reason = reason.map(str::to_string);

        self.write(order, from, |order| OrderEvent::status_changed(order, from), now)
    }

    pub fn update_details(
        &self,
        order_id: Uuid,
        update: OrderDetailsUpdate,
        now: DateTime<Utc>,
    ) -> Result<Order, ServiceError> {
        validate_notes(update.notes.as_deref(), "order")?;
        let mut order = self.get(order_id)?.order;
        if order.status.is_terminal() {
            return Err(ServiceError::OrderFinalized {
                id: order_id,
                status: order.status,
            });
        }
        let from = order.status;
        if let Some(notes) = update.notes {
            order.notes = Some(notes).filter(|n| !n.trim().is_empty());
        }
        if let Some(priority) = update.priority {
            order.priority = priority;
        }
        if let Some(staff) = update.assigned_staff {
            order.assigned_staff = Some(staff).filter(|s| !s.trim().is_empty());
        }
        order.updated_at = now;

        self.write(order, from, OrderEvent::updated, now)
    }

    /// Conditional write of an order changed in memory. The stored row must
    /// still be at the version and status the change was computed from.
    fn write(
        &self,
        mut order: Order,
        from: OrderStatus,
        event: impl FnOnce(&Order) -> OrderEvent,
        now: DateTime<Utc>,
    ) -> Result<Order, ServiceError> {
        let expected_version = order.version;
        order.version += 1;
        let event = event(&order);
        self.store
            .update_order(&order, expected_version, from, &event)
            .map_err(|err| match err {
                StoreError::Conflict => ServiceError::StateChanged(order.id),
                StoreError::NotFound => ServiceError::OrderNotFound(order.id),
                other => other.into(),
            })?;

        if order.status != from {
            info!(order_id = %order.id, %from, to = %order.status, "Order status changed");
        }
        if from != OrderStatus::Completed && order.status == OrderStatus::Completed {
            self.release_table(&order, now);
        }
        Ok(order)
    }

    fn release_table(&self, order: &Order, now: DateTime<Utc>) {
        let result = self
            .store
            .has_open_orders(order.table_id, order.id)
            .and_then(|open| {
                if open {
                    Ok(())
                } else {
                    self.store
                        .set_table_status(order.table_id, TableStatus::Empty, now)
                }
            });
        if let Err(err) = result {
            error!(table_number = order.table_number, error = %err, "Failed to release table");
        }
    }

    pub fn list(
        &self,
        filter: &OrderFilter,
        sort: OrderSort,
        limit: Option<usize>,
    ) -> Result<Vec<OrderRecord>, ServiceError> {
        let mut records = self.store.list_orders(filter)?;
        sort.apply(&mut records);
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub fn stats(&self, filter: &OrderFilter) -> Result<OrderStats, ServiceError> {
        let records = self.store.list_orders(filter)?;
        Ok(query::order_stats(&records))
    }
}
