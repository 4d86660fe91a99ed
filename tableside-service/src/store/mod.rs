//! Storage seam. Services see the persistence layer only through these
//! traits; every mutating call writes its domain event in the same unit of
//! work.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::events::OrderEvent;
use crate::models::{
    DiningTable, MenuItem, Order, OrderLineItem, OrderStatus, SessionDevice, TableSession,
    TableStatus,
};
use crate::query::{OrderFilter, SessionFilter};

mod memory;
mod pg;

pub use memory::{MemoryStore, Seed, SeedTable};
pub use pg::{DbPool, PgStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record not found")]
    NotFound,
    #[error("record was changed concurrently")]
    Conflict,
    #[error("device limit of {0} reached")]
    DeviceLimit(usize),
}

/// An order together with its line items, in position order.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct OrderRecord {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderLineItem>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SessionRecord {
    #[serde(flatten)]
    pub session: TableSession,
    pub devices: Vec<SessionDevice>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRegistration {
    pub session: TableSession,
    pub device: SessionDevice,
    pub is_new: bool,
}

pub trait TableRegistry {
    fn find_table_by_number(&self, number: i32) -> Result<Option<DiningTable>, StoreError>;

    /// Last writer wins; the table status is a display aid.
    fn set_table_status(
        &self,
        table_id: Uuid,
        status: TableStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub trait MenuCatalog {
    /// Returns the items that exist; callers detect missing ids themselves.
    fn find_menu_items(&self, ids: &[String]) -> Result<Vec<MenuItem>, StoreError>;
}

pub trait SessionRepository {
    fn find_session(&self, id: Uuid) -> Result<Option<TableSession>, StoreError>;

    fn find_session_devices(&self, id: Uuid) -> Result<Vec<SessionDevice>, StoreError>;

    /// The session of the table whose status is still `active`, expired or not.
    fn find_active_session(&self, table_id: Uuid) -> Result<Option<TableSession>, StoreError>;

    /// Fails with `Conflict` when the table already has an active session.
    fn insert_session(
        &self,
        session: &TableSession,
        first_device: &SessionDevice,
    ) -> Result<TableSession, StoreError>;

    /// Adds or merges a device on an active session. `NotFound` for an unknown
    /// session, `Conflict` when it is no longer active.
    fn register_device(
        &self,
        session_id: Uuid,
        device: &SessionDevice,
        max_devices: usize,
    ) -> Result<DeviceRegistration, StoreError>;

    /// Marks one session expired if it is active and past its expiry time.
    fn expire_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError>;

    /// Marks every active session past its expiry time as expired, optionally
    /// limited to one table.
    fn expire_stale_sessions(
        &self,
        now: DateTime<Utc>,
        table_id: Option<Uuid>,
    ) -> Result<Vec<TableSession>, StoreError>;

    fn touch_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError>;

    /// Only applies while the session is active and unexpired.
    fn extend_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError>;

    /// Only applies while the session is not closed yet.
    fn close_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        closed_by: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Option<TableSession>, StoreError>;

    /// Bumps the counters and the sliding window in one atomic step.
    fn record_order(
        &self,
        id: Uuid,
        amount: &BigDecimal,
        device_fingerprint: Option<&str>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<TableSession, StoreError>;

    fn flag_session(
        &self,
        id: Uuid,
        reason: &str,
        manual: bool,
        flagged_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError>;

    fn unflag_session(&self, id: Uuid) -> Result<Option<TableSession>, StoreError>;

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<TableSession>, StoreError>;
}

pub trait OrderRepository {
    /// Persists the order and, when it belongs to a session, charges it to
    /// that session in the same atomic step (see
    /// [`SessionRepository::record_order`]). Returns the charged session.
    fn insert_order(
        &self,
        order: &Order,
        items: &[OrderLineItem],
        rate_window: Duration,
    ) -> Result<Option<TableSession>, StoreError>;

    fn find_order(&self, id: Uuid) -> Result<Option<OrderRecord>, StoreError>;

    /// Orders of the session created at or after `since`, oldest first.
    fn recent_session_orders(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>, StoreError>;

    /// Orders placed at the table created at or after `since`, with or
    /// without a session, oldest first.
    fn recent_table_orders(
        &self,
        table_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>, StoreError>;

    /// Writes `order` if the stored row still has `expected_version` and
    /// `expected_status`. `Conflict` when it does not, `NotFound` when the
    /// order is gone.
    fn update_order(
        &self,
        order: &Order,
        expected_version: i64,
        expected_status: OrderStatus,
        event: &OrderEvent,
    ) -> Result<(), StoreError>;

    /// Whether the table has a non-terminal order other than `excluding`.
    fn has_open_orders(&self, table_id: Uuid, excluding: Uuid) -> Result<bool, StoreError>;

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderRecord>, StoreError>;
}

pub trait Store:
    TableRegistry + MenuCatalog + SessionRepository + OrderRepository + Send + Sync
{
}

impl<T> Store for T where
    T: TableRegistry + MenuCatalog + SessionRepository + OrderRepository + Send + Sync
{
}
