use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{
    DeviceRegistration, MenuCatalog, OrderRecord, OrderRepository, SessionRepository,
    StoreError, TableRegistry,
};
use crate::device::{self, DeviceError};
use crate::events::{DomainEvent, OrderEvent, SessionEvent};
use crate::models::{
    DiningTable, MenuItem, NewOutbox, Order, OrderLineItem, OrderStatus, SessionDevice,
    SessionStatus, TableSession, TableStatus,
};
use crate::query::{OrderFilter, SessionFilter};

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct SeedTable {
    pub number: i32,
    #[serde(default)]
    pub status: Option<TableStatus>,
}

/// Tables and menu items loaded into a [`MemoryStore`] at start-up.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Seed {
    #[serde(default)]
    pub tables: Vec<SeedTable>,
    #[serde(default)]
    pub menu_items: Vec<MenuItem>,
}

#[derive(Default)]
struct State {
    tables: HashMap<Uuid, DiningTable>,
    menu: HashMap<String, MenuItem>,
    sessions: HashMap<Uuid, TableSession>,
    devices: HashMap<Uuid, Vec<SessionDevice>>,
    orders: HashMap<Uuid, Order>,
    line_items: HashMap<Uuid, Vec<OrderLineItem>>,
    outbox: Vec<NewOutbox>,
}

impl State {
    fn publish(&mut self, event: &impl DomainEvent) -> Result<(), StoreError> {
        self.outbox.push(event.to_outbox()?);
        Ok(())
    }

    fn record(&self, order: &Order) -> OrderRecord {
        OrderRecord {
            order: order.clone(),
            items: self.line_items.get(&order.id).cloned().unwrap_or_default(),
        }
    }

    fn charge_session(
        &mut self,
        id: Uuid,
        amount: &BigDecimal,
        device_fingerprint: Option<&str>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<TableSession, StoreError> {
        let session = self.sessions.get_mut(&id).ok_or(StoreError::NotFound)?;
        session.apply_order(amount, now, window);
        let session = session.clone();

        if let Some(fingerprint) = device_fingerprint {
            if let Some(device) = self
                .devices
                .get_mut(&id)
                .and_then(|devices| devices.iter_mut().find(|d| d.fingerprint == fingerprint))
            {
                device.order_count += 1;
                device.last_seen = device.last_seen.max(now);
            }
        }
        Ok(session)
    }

    fn recent_orders(
        &self,
        since: DateTime<Utc>,
        belongs: impl Fn(&Order) -> bool,
    ) -> Vec<OrderRecord> {
        let mut records: Vec<OrderRecord> = self
            .orders
            .values()
            .filter(|o| o.created_at >= since && belongs(o))
            .map(|o| self.record(o))
            .collect();
        records.sort_by_key(|r| r.order.created_at);
        records
    }

    fn active_session_id(&self, table_id: Uuid) -> Option<Uuid> {
        self.sessions
            .values()
            .find(|s| s.table_id == table_id && s.status == SessionStatus::Active)
            .map(|s| s.id)
    }
}

/// Mutex-guarded store used by tests and the dev mode. Every call holds the
/// lock for its whole duration, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        let now = Utc::now();
        {
            let mut state = store.lock();
            for table in seed.tables {
                let table = DiningTable {
                    id: Uuid::new_v4(),
                    number: table.number,
                    status: table.status.unwrap_or(TableStatus::Empty),
                    updated_at: now,
                };
                state.tables.insert(table.id, table);
            }
            for item in seed.menu_items {
                state.menu.insert(item.id.clone(), item);
            }
        }
        store
    }

    pub fn with_tables(numbers: &[i32]) -> Self {
        Self::from_seed(Seed {
            tables: numbers
                .iter()
                .map(|&number| SeedTable {
                    number,
                    status: None,
                })
                .collect(),
            menu_items: vec![],
        })
    }

    pub fn add_menu_item(&self, item: MenuItem) {
        self.lock().menu.insert(item.id.clone(), item);
    }

    /// Events written so far, oldest first.
    pub fn outbox(&self) -> Vec<NewOutbox> {
        self.lock().outbox.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TableRegistry for MemoryStore {
    fn find_table_by_number(&self, number: i32) -> Result<Option<DiningTable>, StoreError> {
        Ok(self
            .lock()
            .tables
            .values()
            .find(|t| t.number == number)
            .cloned())
    }

    fn set_table_status(
        &self,
        table_id: Uuid,
        status: TableStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let table = state.tables.get_mut(&table_id).ok_or(StoreError::NotFound)?;
        table.status = status;
        table.updated_at = now;
        Ok(())
    }
}

impl MenuCatalog for MemoryStore {
    fn find_menu_items(&self, ids: &[String]) -> Result<Vec<MenuItem>, StoreError> {
        let state = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.menu.get(id))
            .cloned()
            .collect())
    }
}

impl SessionRepository for MemoryStore {
    fn find_session(&self, id: Uuid) -> Result<Option<TableSession>, StoreError> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    fn find_session_devices(&self, id: Uuid) -> Result<Vec<SessionDevice>, StoreError> {
        Ok(self.lock().devices.get(&id).cloned().unwrap_or_default())
    }

    fn find_active_session(&self, table_id: Uuid) -> Result<Option<TableSession>, StoreError> {
        let state = self.lock();
        Ok(state
            .active_session_id(table_id)
            .and_then(|id| state.sessions.get(&id).cloned()))
    }

    fn insert_session(
        &self,
        session: &TableSession,
        first_device: &SessionDevice,
    ) -> Result<TableSession, StoreError> {
        let mut state = self.lock();
        if state.active_session_id(session.table_id).is_some() {
            return Err(StoreError::Conflict);
        }
        let mut session = session.clone();
        session.total_devices = 1;
        state.sessions.insert(session.id, session.clone());
        state.devices.insert(session.id, vec![first_device.clone()]);
        state.publish(&SessionEvent::started(&session))?;
        state.publish(&SessionEvent::device_joined(&session, first_device))?;
        Ok(session)
    }

    fn register_device(
        &self,
        session_id: Uuid,
        device: &SessionDevice,
        max_devices: usize,
    ) -> Result<DeviceRegistration, StoreError> {
        let mut state = self.lock();
        let status = state
            .sessions
            .get(&session_id)
            .map(|s| s.status)
            .ok_or(StoreError::NotFound)?;
        if status != SessionStatus::Active {
            return Err(StoreError::Conflict);
        }

        let devices = state.devices.entry(session_id).or_default();
        let is_new = match device::register(devices, device.clone(), max_devices) {
            Ok(is_new) => is_new,
            Err(DeviceError::LimitReached(limit)) => return Err(StoreError::DeviceLimit(limit)),
            Err(_) => return Err(StoreError::Conflict),
        };
        let total = devices.len() as i32;
        let merged = devices
            .iter()
            .find(|d| d.fingerprint == device.fingerprint)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(StoreError::NotFound)?;
        session.total_devices = total;
        session.last_activity = session.last_activity.max(device.last_seen);
        let session = session.clone();
        if is_new {
            state.publish(&SessionEvent::device_joined(&session, &merged))?;
        }

        Ok(DeviceRegistration {
            session,
            device: merged,
            is_new,
        })
    }

    fn expire_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != SessionStatus::Active || session.expiry_time > now {
            return Ok(None);
        }
        session.status = SessionStatus::Expired;
        let session = session.clone();
        state.publish(&SessionEvent::expired(&session))?;
        Ok(Some(session))
    }

    fn expire_stale_sessions(
        &self,
        now: DateTime<Utc>,
        table_id: Option<Uuid>,
    ) -> Result<Vec<TableSession>, StoreError> {
        let mut state = self.lock();
        let mut expired = vec![];
        for session in state.sessions.values_mut() {
            if session.status == SessionStatus::Active
                && session.expiry_time <= now
                && table_id.is_none_or(|t| session.table_id == t)
            {
                session.status = SessionStatus::Expired;
                expired.push(session.clone());
            }
        }
        for session in &expired {
            state.publish(&SessionEvent::expired(session))?;
        }
        Ok(expired)
    }

    fn touch_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        Ok(state.sessions.get_mut(&id).map(|session| {
            session.last_activity = session.last_activity.max(now);
            session.clone()
        }))
    }

    fn extend_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if !session.is_live(now) {
            return Ok(None);
        }
        session.expiry_time = expiry_time;
        session.last_activity = now;
        let session = session.clone();
        state.publish(&SessionEvent::extended(&session))?;
        Ok(Some(session))
    }

    fn close_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        closed_by: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status == SessionStatus::Closed {
            return Ok(None);
        }
        session.status = SessionStatus::Closed;
        session.closed_at = Some(now);
        session.closed_by = closed_by.map(str::to_string);
        session.close_reason = reason.map(str::to_string);
        let session = session.clone();
        state.publish(&SessionEvent::closed(&session))?;
        Ok(Some(session))
    }

    fn record_order(
        &self,
        id: Uuid,
        amount: &BigDecimal,
        device_fingerprint: Option<&str>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<TableSession, StoreError> {
        self.lock()
            .charge_session(id, amount, device_fingerprint, now, window)
    }

    fn flag_session(
        &self,
        id: Uuid,
        reason: &str,
        manual: bool,
        flagged_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        session.is_suspicious = true;
        session.suspicious_reasons.push(reason.to_string());
        if manual {
            session.manually_flagged = true;
        } else {
            session.auto_flagged = true;
        }
        session.flagged_at = Some(now);
        if let Some(by) = flagged_by {
            session.flagged_by = Some(by.to_string());
        }
        let session = session.clone();
        state.publish(&SessionEvent::SessionFlagged {
            session_id: id,
            reason: reason.to_string(),
            manual,
        })?;
        Ok(Some(session))
    }

    fn unflag_session(&self, id: Uuid) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(None);
        };
        session.is_suspicious = false;
        session.suspicious_reasons.clear();
        session.auto_flagged = false;
        session.manually_flagged = false;
        session.flagged_at = None;
        session.flagged_by = None;
        let session = session.clone();
        state.publish(&SessionEvent::SessionUnflagged { session_id: id })?;
        Ok(Some(session))
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<TableSession>, StoreError> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }
}

impl OrderRepository for MemoryStore {
    fn insert_order(
        &self,
        order: &Order,
        items: &[OrderLineItem],
        rate_window: Duration,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut state = self.lock();
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Conflict);
        }
        let session = match order.session_id {
            Some(session_id) => Some(state.charge_session(
                session_id,
                &order.total_amount,
                order.device_fingerprint.as_deref(),
                order.created_at,
                rate_window,
            )?),
            None => None,
        };
        state.orders.insert(order.id, order.clone());
        state.line_items.insert(order.id, items.to_vec());
        state.publish(&OrderEvent::created(order, items))?;
        Ok(session)
    }

    fn find_order(&self, id: Uuid) -> Result<Option<OrderRecord>, StoreError> {
        let state = self.lock();
        Ok(state.orders.get(&id).map(|order| state.record(order)))
    }

    fn recent_session_orders(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        Ok(self
            .lock()
            .recent_orders(since, |o| o.session_id == Some(session_id)))
    }

    fn recent_table_orders(
        &self,
        table_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        Ok(self.lock().recent_orders(since, |o| o.table_id == table_id))
    }

    fn update_order(
        &self,
        order: &Order,
        expected_version: i64,
        expected_status: OrderStatus,
        event: &OrderEvent,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let stored = state.orders.get_mut(&order.id).ok_or(StoreError::NotFound)?;
        if stored.version != expected_version || stored.status != expected_status {
            return Err(StoreError::Conflict);
        }
        *stored = order.clone();
        state.publish(event)
    }

    fn has_open_orders(&self, table_id: Uuid, excluding: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .orders
            .values()
            .any(|o| o.table_id == table_id && o.id != excluding && !o.status.is_terminal()))
    }

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderRecord>, StoreError> {
        let state = self.lock();
        Ok(state
            .orders
            .values()
            .map(|o| state.record(o))
            .filter(|r| filter.matches(r))
            .collect())
    }
}
