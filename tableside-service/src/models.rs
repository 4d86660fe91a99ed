use std::{fmt, io::Write, str::FromStr};

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::{Pg, PgValue},
    prelude::*,
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Jsonb,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::schema::{
    dining_tables, menu_items, order_line_items, orders, outbox, session_devices, table_sessions,
};

#[derive(Error, Debug, PartialEq)]
#[error("unrecognized {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Wires a string-backed enum to its Postgres enum type.
macro_rules! pg_enum {
    ($name:ident, $sql_type:ty) => {
        impl ToSql<$sql_type, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                out.write_all(self.as_str().as_bytes())?;
                Ok(IsNull::No)
            }
        }

        impl FromSql<$sql_type, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let raw = std::str::from_utf8(bytes.as_bytes())?;
                Ok(raw.parse::<$name>()?)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
#[diesel(sql_type = crate::schema::sql_types::TableStatus)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Empty,
    Occupied,
    Reserved,
    Maintenance,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Empty => "empty",
            TableStatus::Occupied => "occupied",
            TableStatus::Reserved => "reserved",
            TableStatus::Maintenance => "maintenance",
        }
    }
}

impl FromStr for TableStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(TableStatus::Empty),
            "occupied" => Ok(TableStatus::Occupied),
            "reserved" => Ok(TableStatus::Reserved),
            "maintenance" => Ok(TableStatus::Maintenance),
            _ => Err(ParseEnumError {
                kind: "table status",
                value: s.to_string(),
            }),
        }
    }
}

pg_enum!(TableStatus, crate::schema::sql_types::TableStatus);

#[derive(FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
#[diesel(sql_type = crate::schema::sql_types::SessionStatus)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Closed => "closed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "expired" => Ok(SessionStatus::Expired),
            "closed" => Ok(SessionStatus::Closed),
            _ => Err(ParseEnumError {
                kind: "session status",
                value: s.to_string(),
            }),
        }
    }
}

pg_enum!(SessionStatus, crate::schema::sql_types::SessionStatus);

#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Hash, Copy, Clone, Debug,
)]
#[diesel(sql_type = crate::schema::sql_types::OrderStatus)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable in one step from `self`.
    pub fn allowed_next(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Pending => &[OrderStatus::Confirmed, OrderStatus::Cancelled],
            OrderStatus::Confirmed => &[OrderStatus::Preparing, OrderStatus::Cancelled],
            OrderStatus::Preparing => &[OrderStatus::Ready, OrderStatus::Cancelled],
            OrderStatus::Ready => &[OrderStatus::Delivered],
            OrderStatus::Delivered => &[OrderStatus::Completed],
            OrderStatus::Completed | OrderStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Position in the kitchen workflow, used for status sorting.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Confirmed => 1,
            OrderStatus::Preparing => 2,
            OrderStatus::Ready => 3,
            OrderStatus::Delivered => 4,
            OrderStatus::Completed => 5,
            OrderStatus::Cancelled => 6,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "order status",
                value: s.to_string(),
            })
    }
}

pg_enum!(OrderStatus, crate::schema::sql_types::OrderStatus);

#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Hash, Copy, Clone, Debug,
)]
#[diesel(sql_type = crate::schema::sql_types::PaymentStatus)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Partial,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "partial" => Ok(PaymentStatus::Partial),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(ParseEnumError {
                kind: "payment status",
                value: s.to_string(),
            }),
        }
    }
}

pg_enum!(PaymentStatus, crate::schema::sql_types::PaymentStatus);

#[derive(
    FromSqlRow,
    AsExpression,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
    Debug,
    Default,
)]
#[diesel(sql_type = crate::schema::sql_types::OrderPriority)]
#[serde(rename_all = "snake_case")]
pub enum OrderPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl OrderPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPriority::Low => "low",
            OrderPriority::Normal => "normal",
            OrderPriority::High => "high",
            OrderPriority::Urgent => "urgent",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            OrderPriority::Low => 0,
            OrderPriority::Normal => 1,
            OrderPriority::High => 2,
            OrderPriority::Urgent => 3,
        }
    }
}

impl FromStr for OrderPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(OrderPriority::Low),
            "normal" => Ok(OrderPriority::Normal),
            "high" => Ok(OrderPriority::High),
            "urgent" => Ok(OrderPriority::Urgent),
            _ => Err(ParseEnumError {
                kind: "order priority",
                value: s.to_string(),
            }),
        }
    }
}

pg_enum!(OrderPriority, crate::schema::sql_types::OrderPriority);

#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug, Default,
)]
#[diesel(sql_type = crate::schema::sql_types::OrderType)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    DineIn,
    Takeaway,
    Delivery,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::DineIn => "dine_in",
            OrderType::Takeaway => "takeaway",
            OrderType::Delivery => "delivery",
        }
    }
}

impl FromStr for OrderType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dine_in" => Ok(OrderType::DineIn),
            "takeaway" => Ok(OrderType::Takeaway),
            "delivery" => Ok(OrderType::Delivery),
            _ => Err(ParseEnumError {
                kind: "order type",
                value: s.to_string(),
            }),
        }
    }
}

pg_enum!(OrderType, crate::schema::sql_types::OrderType);

#[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Clone, Debug, PartialEq)]
#[diesel(table_name = dining_tables)]
pub struct DiningTable {
    pub id: Uuid,
    pub number: i32,
    pub status: TableStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Queryable,
    Selectable,
    Identifiable,
    Insertable,
    Serialize,
    Deserialize,
    Clone,
    Debug,
    PartialEq,
)]
#[diesel(table_name = menu_items)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub price: BigDecimal,
    /// Minutes; `None` falls back to the configured default.
    pub cooking_time: Option<i32>,
    pub available: bool,
}

#[derive(
    Queryable,
    QueryableByName,
    Selectable,
    Identifiable,
    Insertable,
    Serialize,
    Clone,
    Debug,
    PartialEq,
)]
#[diesel(table_name = table_sessions)]
pub struct TableSession {
    pub id: Uuid,
    pub table_id: Uuid,
    pub table_number: i32,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub close_reason: Option<String>,
    pub total_devices: i32,
    pub order_count: i32,
    pub total_amount: BigDecimal,
    pub is_suspicious: bool,
    pub suspicious_reasons: Vec<String>,
    pub auto_flagged: bool,
    pub manually_flagged: bool,
    pub flagged_at: Option<DateTime<Utc>>,
    pub flagged_by: Option<String>,
    pub last_order_time: Option<DateTime<Utc>>,
    pub recent_orders_count: i32,
    pub recent_orders_window_start: Option<DateTime<Utc>>,
}

impl TableSession {
    pub fn new(table: &DiningTable, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_id: table.id,
            table_number: table.number,
            status: SessionStatus::Active,
            start_time: now,
            expiry_time: now + ttl,
            last_activity: now,
            closed_at: None,
            closed_by: None,
            close_reason: None,
            total_devices: 0,
            order_count: 0,
            total_amount: BigDecimal::zero(),
            is_suspicious: false,
            suspicious_reasons: vec![],
            auto_flagged: false,
            manually_flagged: false,
            flagged_at: None,
            flagged_by: None,
            last_order_time: None,
            recent_orders_count: 0,
            recent_orders_window_start: None,
        }
    }

    /// Active and not yet past its expiry time.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.expiry_time > now
    }

    /// Applies one order to the aggregates and the sliding rate-limit window.
    pub fn apply_order(&mut self, amount: &BigDecimal, now: DateTime<Utc>, window: chrono::Duration) {
        self.order_count += 1;
        self.total_amount = &self.total_amount + amount;
        self.last_order_time = Some(now);
        self.last_activity = now;
        match self.recent_orders_window_start {
            Some(start) if start >= now - window => self.recent_orders_count += 1,
            _ => {
                self.recent_orders_window_start = Some(now);
                self.recent_orders_count = 1;
            }
        }
    }
}

#[derive(
    Queryable,
    Selectable,
    Identifiable,
    Associations,
    Insertable,
    AsChangeset,
    Serialize,
    Clone,
    Debug,
    PartialEq,
)]
#[diesel(belongs_to(TableSession, foreign_key = session_id))]
#[diesel(table_name = session_devices, primary_key(session_id, fingerprint))]
#[diesel(treat_none_as_null = true)]
pub struct SessionDevice {
    pub session_id: Uuid,
    pub fingerprint: String,
    pub ip_address: String,
    pub user_agent: String,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub is_mobile: bool,
    pub screen_resolution: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub order_count: i32,
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Clone, Debug, PartialEq)]
#[diesel(table_name = orders)]
pub struct Order {
    pub id: Uuid,
    pub version: i64,
    pub order_number: String,
    pub table_id: Uuid,
    pub table_number: i32,
    pub session_id: Option<Uuid>,
    pub device_fingerprint: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub priority: OrderPriority,
    pub order_type: OrderType,
    pub total_amount: BigDecimal,
    pub estimated_time: i32,
    pub notes: Option<String>,
    pub assigned_staff: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub preparing_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// The moment `status` was entered, if it ever was.
    pub fn entered_at(&self, status: OrderStatus) -> Option<DateTime<Utc>> {
        match status {
            OrderStatus::Pending => Some(self.created_at),
            OrderStatus::Confirmed => self.confirmed_at,
            OrderStatus::Preparing => self.preparing_at,
            OrderStatus::Ready => self.ready_at,
            OrderStatus::Delivered => self.delivered_at,
            OrderStatus::Completed => self.completed_at,
            OrderStatus::Cancelled => self.cancelled_at,
        }
    }

    /// Moves to `next` and stamps its timestamp. The stamp is written once;
    /// callers check the transition graph first.
    pub fn enter(&mut self, next: OrderStatus, now: DateTime<Utc>) {
        let slot = match next {
            OrderStatus::Pending => None,
            OrderStatus::Confirmed => Some(&mut self.confirmed_at),
            OrderStatus::Preparing => Some(&mut self.preparing_at),
            OrderStatus::Ready => Some(&mut self.ready_at),
            OrderStatus::Delivered => Some(&mut self.delivered_at),
            OrderStatus::Completed => Some(&mut self.completed_at),
            OrderStatus::Cancelled => Some(&mut self.cancelled_at),
        };
        if let Some(slot) = slot {
            slot.get_or_insert(now);
        }
        self.status = next;
        self.updated_at = now;
    }
}

/// Columns an order mutation may touch, written under a version guard.
#[derive(AsChangeset, Debug)]
#[diesel(table_name = orders, treat_none_as_null = true)]
pub struct OrderChanges<'a> {
    pub version: i64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub priority: OrderPriority,
    pub notes: Option<&'a str>,
    pub assigned_staff: Option<&'a str>,
    pub cancel_reason: Option<&'a str>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub preparing_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl<'a> From<&'a Order> for OrderChanges<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            version: order.version,
            status: order.status,
            payment_status: order.payment_status,
            priority: order.priority,
            notes: order.notes.as_deref(),
            assigned_staff: order.assigned_staff.as_deref(),
            cancel_reason: order.cancel_reason.as_deref(),
            confirmed_at: order.confirmed_at,
            preparing_at: order.preparing_at,
            ready_at: order.ready_at,
            delivered_at: order.delivered_at,
            completed_at: order.completed_at,
            cancelled_at: order.cancelled_at,
            paid_at: order.paid_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Extra {
    pub ingredient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub price: BigDecimal,
}

#[derive(FromSqlRow, AsExpression, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[diesel(sql_type = Jsonb)]
pub struct Customizations {
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub extras: Vec<Extra>,
}

impl Customizations {
    pub fn extras_total(&self) -> BigDecimal {
        self.extras.iter().map(|e| e.price.clone()).sum()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SelectedOption {
    pub group_id: String,
    pub label: String,
    pub price_delta: BigDecimal,
}

#[derive(FromSqlRow, AsExpression, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[diesel(sql_type = Jsonb)]
#[serde(transparent)]
pub struct SelectedOptions(pub Vec<SelectedOption>);

impl SelectedOptions {
    pub fn delta_total(&self) -> BigDecimal {
        self.0.iter().map(|o| o.price_delta.clone()).sum()
    }
}

macro_rules! pg_json {
    ($name:ident) => {
        impl FromSql<Jsonb, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let value = <serde_json::Value as FromSql<Jsonb, Pg>>::from_sql(bytes)?;
                Ok(serde_json::from_value(value)?)
            }
        }

        impl ToSql<Jsonb, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                let value = serde_json::to_value(self)?;
                <serde_json::Value as ToSql<Jsonb, Pg>>::to_sql(&value, &mut out.reborrow())
            }
        }
    };
}

pg_json!(Customizations);
pg_json!(SelectedOptions);

#[derive(
    Queryable,
    Selectable,
    Identifiable,
    Associations,
    Insertable,
    Serialize,
    Clone,
    Debug,
    PartialEq,
)]
#[diesel(belongs_to(Order))]
#[diesel(table_name = order_line_items)]
pub struct OrderLineItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub menu_item_id: String,
    pub name: String,
    /// Unit price snapshot including selected option deltas.
    pub price: BigDecimal,
    pub quantity: i32,
    /// `price * quantity`; extras are not part of it.
    pub subtotal: BigDecimal,
    pub customizations: Customizations,
    pub selected_options: SelectedOptions,
    pub notes: Option<String>,
}

impl OrderLineItem {
    /// What this line adds to the order total: base and extras, both per unit.
    pub fn contribution(&self) -> BigDecimal {
        &self.subtotal + self.customizations.extras_total() * BigDecimal::from(self.quantity)
    }
}

#[derive(Queryable, Selectable, Debug, PartialEq)]
#[diesel(table_name = outbox)]
pub struct Outbox {
    pub id: i32,
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = outbox)]
pub struct NewOutbox {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_graph() {
        use OrderStatus::*;

        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Delivered));
        assert!(Preparing.can_transition_to(Cancelled));
        assert!(!Ready.can_transition_to(Cancelled));
        assert!(Delivered.can_transition_to(Completed));
        for status in OrderStatus::ALL {
            assert_eq!(status.is_terminal(), matches!(status, Completed | Cancelled));
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_enum_strings_round_trip() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert_eq!("dine_in".parse::<OrderType>(), Ok(OrderType::DineIn));
        assert!("shipped".parse::<OrderStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&OrderType::DineIn).unwrap(),
            "\"dine_in\""
        );
    }

    #[test]
    fn test_line_item_contribution_counts_extras_per_unit() {
        let item = OrderLineItem {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            position: 0,
            menu_item_id: "burger".to_string(),
            name: "Burger".to_string(),
            price: BigDecimal::from(10),
            quantity: 3,
            subtotal: BigDecimal::from(30),
            customizations: Customizations {
                removed: vec!["onion".to_string()],
                extras: vec![Extra {
                    ingredient_id: "cheese".to_string(),
                    name: None,
                    price: BigDecimal::from(2),
                }],
            },
            selected_options: SelectedOptions::default(),
            notes: None,
        };

        assert_eq!(item.contribution(), BigDecimal::from(36));
    }

    #[test]
    fn test_session_rate_window_slides() {
        let table = DiningTable {
            id: Uuid::new_v4(),
            number: 4,
            status: TableStatus::Empty,
            updated_at: Utc::now(),
        };
        let start = Utc::now();
        let window = chrono::Duration::seconds(60);
        let mut session = TableSession::new(&table, start, chrono::Duration::hours(4));

        session.apply_order(&BigDecimal::from(10), start, window);
        session.apply_order(&BigDecimal::from(5), start + chrono::Duration::seconds(30), window);
        assert_eq!(session.recent_orders_count, 2);
        assert_eq!(session.order_count, 2);
        assert_eq!(session.total_amount, BigDecimal::from(15));

        session.apply_order(&BigDecimal::from(5), start + chrono::Duration::seconds(90), window);
        assert_eq!(session.recent_orders_count, 1);
        assert_eq!(
            session.recent_orders_window_start,
            Some(start + chrono::Duration::seconds(90))
        );
    }
}
