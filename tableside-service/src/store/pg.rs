use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::dsl::exists;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use uuid::Uuid;

use super::{
    DeviceRegistration, MenuCatalog, OrderRecord, OrderRepository, SessionRepository,
    StoreError, TableRegistry,
};
use crate::device;
use crate::events::{DomainEvent, OrderEvent, SessionEvent};
use crate::models::{
    DiningTable, MenuItem, Order, OrderChanges, OrderLineItem, OrderStatus, SessionDevice,
    SessionStatus, TableSession, TableStatus,
};
use crate::query::{OrderFilter, SessionFilter};
use crate::schema::{
    dining_tables, menu_items, order_line_items, orders, outbox, session_devices, table_sessions,
};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().build(manager)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Applies pending migrations and returns their versions.
    pub fn run_migrations(
        &self,
    ) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;
        let versions = conn.run_pending_migrations(MIGRATIONS)?;
        Ok(versions.iter().map(|v| v.to_string()).collect())
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        Ok(self.pool.get()?)
    }
}

fn publish(conn: &mut PgConnection, event: &impl DomainEvent) -> Result<(), StoreError> {
    diesel::insert_into(outbox::table)
        .values(event.to_outbox()?)
        .execute(conn)?;
    Ok(())
}

fn with_items(conn: &mut PgConnection, rows: Vec<Order>) -> QueryResult<Vec<OrderRecord>> {
    let items = OrderLineItem::belonging_to(&rows)
        .select(OrderLineItem::as_select())
        .order(order_line_items::position.asc())
        .load(conn)?;

    Ok(items
        .grouped_by(&rows)
        .into_iter()
        .zip(rows)
        .map(|(items, order)| OrderRecord { order, items })
        .collect())
}

impl TableRegistry for PgStore {
    fn find_table_by_number(&self, number: i32) -> Result<Option<DiningTable>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(dining_tables::table
            .filter(dining_tables::number.eq(number))
            .select(DiningTable::as_select())
            .first(conn)
            .optional()?)
    }

    fn set_table_status(
        &self,
        table_id: Uuid,
        status: TableStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        let updated = diesel::update(dining_tables::table.find(table_id))
            .set((
                dining_tables::status.eq(status),
                dining_tables::updated_at.eq(now),
            ))
            .execute(conn)?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

impl MenuCatalog for PgStore {
    fn find_menu_items(&self, ids: &[String]) -> Result<Vec<MenuItem>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(menu_items::table
            .filter(menu_items::id.eq_any(ids))
            .select(MenuItem::as_select())
            .load(conn)?)
    }
}

const RECORD_ORDER_SQL: &str = r#"
UPDATE table_sessions SET
    order_count = order_count + 1,
    total_amount = total_amount + $2,
    last_order_time = $3,
    last_activity = $3,
    recent_orders_count = CASE
        WHEN recent_orders_window_start >= $3 - $4 * INTERVAL '1 second'
        THEN recent_orders_count + 1
        ELSE 1
    END,
    recent_orders_window_start = CASE
        WHEN recent_orders_window_start >= $3 - $4 * INTERVAL '1 second'
        THEN recent_orders_window_start
        ELSE $3
    END
WHERE id = $1
RETURNING *
"#;

fn charge_session(
    conn: &mut PgConnection,
    id: Uuid,
    amount: &BigDecimal,
    device_fingerprint: Option<&str>,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<TableSession, StoreError> {
    let window_seconds = window.num_milliseconds() as f64 / 1000.0;
    let session = diesel::sql_query(RECORD_ORDER_SQL)
        .bind::<sql_types::Uuid, _>(id)
        .bind::<sql_types::Numeric, _>(amount)
        .bind::<sql_types::Timestamptz, _>(now)
        .bind::<sql_types::Double, _>(window_seconds)
        .get_result::<TableSession>(conn)
        .optional()?
        .ok_or(StoreError::NotFound)?;

    if let Some(fingerprint) = device_fingerprint {
        diesel::update(session_devices::table.find((id, fingerprint)))
            .set((
                session_devices::order_count.eq(session_devices::order_count + 1),
                session_devices::last_seen.eq(now),
            ))
            .execute(conn)?;
    }
    Ok(session)
}

const FLAG_SQL: &str = r#"
UPDATE table_sessions SET
    is_suspicious = TRUE,
    suspicious_reasons = array_append(suspicious_reasons, $2),
    manually_flagged = manually_flagged OR $3,
    auto_flagged = auto_flagged OR NOT $3,
    flagged_at = $4,
    flagged_by = COALESCE($5, flagged_by)
WHERE id = $1
RETURNING *
"#;

impl SessionRepository for PgStore {
    fn find_session(&self, id: Uuid) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(table_sessions::table
            .find(id)
            .select(TableSession::as_select())
            .first(conn)
            .optional()?)
    }

    fn find_session_devices(&self, id: Uuid) -> Result<Vec<SessionDevice>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(session_devices::table
            .filter(session_devices::session_id.eq(id))
            .order(session_devices::first_seen.asc())
            .select(SessionDevice::as_select())
            .load(conn)?)
    }

    fn find_active_session(&self, table_id: Uuid) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(table_sessions::table
            .filter(table_sessions::table_id.eq(table_id))
            .filter(table_sessions::status.eq(SessionStatus::Active))
            .select(TableSession::as_select())
            .first(conn)
            .optional()?)
    }

    fn insert_session(
        &self,
        session: &TableSession,
        first_device: &SessionDevice,
    ) -> Result<TableSession, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let mut session = session.clone();
            session.total_devices = 1;

            match diesel::insert_into(table_sessions::table)
                .values(&session)
                .execute(conn)
            {
                Ok(_) => {}
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                    return Err(StoreError::Conflict)
                }
                Err(err) => return Err(err.into()),
            }
            diesel::insert_into(session_devices::table)
                .values(first_device)
                .execute(conn)?;

            publish(conn, &SessionEvent::started(&session))?;
            publish(conn, &SessionEvent::device_joined(&session, first_device))?;
            Ok(session)
        })
    }

    fn register_device(
        &self,
        session_id: Uuid,
        device: &SessionDevice,
        max_devices: usize,
    ) -> Result<DeviceRegistration, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            // The row lock serializes registrations on one session.
            let session = table_sessions::table
                .find(session_id)
                .select(TableSession::as_select())
                .for_update()
                .first(conn)
                .optional()?
                .ok_or(StoreError::NotFound)?;
            if session.status != SessionStatus::Active {
                return Err(StoreError::Conflict);
            }

            let existing = session_devices::table
                .find((session_id, device.fingerprint.as_str()))
                .select(SessionDevice::as_select())
                .first(conn)
                .optional()?;

            let (merged, is_new) = match existing {
                Some(mut existing) => {
                    device::merge(&mut existing, device);
                    diesel::update(
                        session_devices::table.find((session_id, device.fingerprint.as_str())),
                    )
                    .set(&existing)
                    .execute(conn)?;
                    (existing, false)
                }
                None => {
                    if session.total_devices.max(0) as usize >= max_devices {
                        return Err(StoreError::DeviceLimit(max_devices));
                    }
                    diesel::insert_into(session_devices::table)
                        .values(device)
                        .execute(conn)?;
                    (device.clone(), true)
                }
            };

            let added = if is_new { 1 } else { 0 };
            let session = diesel::update(table_sessions::table.find(session_id))
                .set((
                    table_sessions::total_devices.eq(table_sessions::total_devices + added),
                    table_sessions::last_activity.eq(merged.last_seen),
                ))
                .returning(TableSession::as_returning())
                .get_result(conn)?;
            if is_new {
                publish(conn, &SessionEvent::device_joined(&session, &merged))?;
            }

            Ok(DeviceRegistration {
                session,
                device: merged,
                is_new,
            })
        })
    }

    fn expire_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let session = diesel::update(
                table_sessions::table
                    .filter(table_sessions::id.eq(id))
                    .filter(table_sessions::status.eq(SessionStatus::Active))
                    .filter(table_sessions::expiry_time.le(now)),
            )
            .set(table_sessions::status.eq(SessionStatus::Expired))
            .returning(TableSession::as_returning())
            .get_result(conn)
            .optional()?;

            if let Some(session) = &session {
                publish(conn, &SessionEvent::expired(session))?;
            }
            Ok(session)
        })
    }

    fn expire_stale_sessions(
        &self,
        now: DateTime<Utc>,
        table_id: Option<Uuid>,
    ) -> Result<Vec<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let stale = table_sessions::table
                .filter(table_sessions::status.eq(SessionStatus::Active))
                .filter(table_sessions::expiry_time.le(now));
            let expired: Vec<TableSession> = match table_id {
                Some(table_id) => diesel::update(stale.filter(table_sessions::table_id.eq(table_id)))
                    .set(table_sessions::status.eq(SessionStatus::Expired))
                    .returning(TableSession::as_returning())
                    .get_results(conn)?,
                None => diesel::update(stale)
                    .set(table_sessions::status.eq(SessionStatus::Expired))
                    .returning(TableSession::as_returning())
                    .get_results(conn)?,
            };

            for session in &expired {
                publish(conn, &SessionEvent::expired(session))?;
            }
            Ok(expired)
        })
    }

    fn touch_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(diesel::update(table_sessions::table.find(id))
            .set(table_sessions::last_activity.eq(now))
            .returning(TableSession::as_returning())
            .get_result(conn)
            .optional()?)
    }

    fn extend_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let session = diesel::update(
                table_sessions::table
                    .filter(table_sessions::id.eq(id))
                    .filter(table_sessions::status.eq(SessionStatus::Active))
                    .filter(table_sessions::expiry_time.gt(now)),
            )
            .set((
                table_sessions::expiry_time.eq(expiry_time),
                table_sessions::last_activity.eq(now),
            ))
            .returning(TableSession::as_returning())
            .get_result(conn)
            .optional()?;

            if let Some(session) = &session {
                publish(conn, &SessionEvent::extended(session))?;
            }
            Ok(session)
        })
    }

    fn close_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        closed_by: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let session = diesel::update(
                table_sessions::table
                    .filter(table_sessions::id.eq(id))
                    .filter(table_sessions::status.ne(SessionStatus::Closed)),
            )
            .set((
                table_sessions::status.eq(SessionStatus::Closed),
                table_sessions::closed_at.eq(now),
                table_sessions::closed_by.eq(closed_by),
                table_sessions::close_reason.eq(reason),
            ))
            .returning(TableSession::as_returning())
            .get_result(conn)
            .optional()?;

            if let Some(session) = &session {
                publish(conn, &SessionEvent::closed(session))?;
            }
            Ok(session)
        })
    }

    fn record_order(
        &self,
        id: Uuid,
        amount: &BigDecimal,
        device_fingerprint: Option<&str>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<TableSession, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            charge_session(conn, id, amount, device_fingerprint, now, window)
        })
    }

    fn flag_session(
        &self,
        id: Uuid,
        reason: &str,
        manual: bool,
        flagged_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let session = diesel::sql_query(FLAG_SQL)
                .bind::<sql_types::Uuid, _>(id)
                .bind::<sql_types::Text, _>(reason)
                .bind::<sql_types::Bool, _>(manual)
                .bind::<sql_types::Timestamptz, _>(now)
                .bind::<sql_types::Nullable<sql_types::Text>, _>(flagged_by)
                .get_result::<TableSession>(conn)
                .optional()?;

            if session.is_some() {
                publish(
                    conn,
                    &SessionEvent::SessionFlagged {
                        session_id: id,
                        reason: reason.to_string(),
                        manual,
                    },
                )?;
            }
            Ok(session)
        })
    }

    fn unflag_session(&self, id: Uuid) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let session = diesel::update(table_sessions::table.find(id))
                .set((
                    table_sessions::is_suspicious.eq(false),
                    table_sessions::suspicious_reasons.eq(Vec::<String>::new()),
                    table_sessions::auto_flagged.eq(false),
                    table_sessions::manually_flagged.eq(false),
                    table_sessions::flagged_at.eq(None::<DateTime<Utc>>),
                    table_sessions::flagged_by.eq(None::<String>),
                ))
                .returning(TableSession::as_returning())
                .get_result(conn)
                .optional()?;

            if session.is_some() {
                publish(conn, &SessionEvent::SessionUnflagged { session_id: id })?;
            }
            Ok(session)
        })
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        let mut query = table_sessions::table
            .select(TableSession::as_select())
            .into_boxed::<Pg>();
        if !filter.statuses.is_empty() {
            query = query.filter(table_sessions::status.eq_any(filter.statuses.clone()));
        }
        if !filter.table_numbers.is_empty() {
            query = query.filter(table_sessions::table_number.eq_any(filter.table_numbers.clone()));
        }
        if let Some(flagged) = filter.flagged {
            query = query.filter(table_sessions::is_suspicious.eq(flagged));
        }
        if let Some(from) = filter.started_from {
            query = query.filter(table_sessions::start_time.ge(from));
        }
        if let Some(to) = filter.started_to {
            query = query.filter(table_sessions::start_time.le(to));
        }

        Ok(query.load(conn)?)
    }
}

impl OrderRepository for PgStore {
    fn insert_order(
        &self,
        order: &Order,
        items: &[OrderLineItem],
        rate_window: Duration,
    ) -> Result<Option<TableSession>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let session = order
                .session_id
                .map(|session_id| {
                    charge_session(
                        conn,
                        session_id,
                        &order.total_amount,
                        order.device_fingerprint.as_deref(),
                        order.created_at,
                        rate_window,
                    )
                })
                .transpose()?;
            diesel::insert_into(orders::table)
                .values(order)
                .execute(conn)?;
            diesel::insert_into(order_line_items::table)
                .values(items)
                .execute(conn)?;
            publish(conn, &OrderEvent::created(order, items))?;
            Ok(session)
        })
    }

    fn find_order(&self, id: Uuid) -> Result<Option<OrderRecord>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        let Some(order) = orders::table
            .find(id)
            .select(Order::as_select())
            .first(conn)
            .optional()?
        else {
            return Ok(None);
        };
        Ok(with_items(conn, vec![order])?.pop())
    }

    fn recent_session_orders(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        let rows = orders::table
            .filter(orders::session_id.eq(session_id))
            .filter(orders::created_at.ge(since))
            .order(orders::created_at.asc())
            .select(Order::as_select())
            .load(conn)?;
        Ok(with_items(conn, rows)?)
    }

    fn recent_table_orders(
        &self,
        table_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        let rows = orders::table
            .filter(orders::table_id.eq(table_id))
            .filter(orders::created_at.ge(since))
            .order(orders::created_at.asc())
            .select(Order::as_select())
            .load(conn)?;
        Ok(with_items(conn, rows)?)
    }

    fn update_order(
        &self,
        order: &Order,
        expected_version: i64,
        expected_status: OrderStatus,
        event: &OrderEvent,
    ) -> Result<(), StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            let updated = diesel::update(
                orders::table
                    .filter(orders::id.eq(order.id))
                    .filter(orders::version.eq(expected_version))
                    .filter(orders::status.eq(expected_status)),
            )
            .set(&OrderChanges::from(order))
            .execute(conn)?;

            if updated == 0 {
                let found: bool = diesel::select(exists(orders::table.find(order.id)))
                    .get_result(conn)?;
                return Err(if found {
                    StoreError::Conflict
                } else {
                    StoreError::NotFound
                });
            }
            publish(conn, event)
        })
    }

    fn has_open_orders(&self, table_id: Uuid, excluding: Uuid) -> Result<bool, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        Ok(diesel::select(exists(
            orders::table
                .filter(orders::table_id.eq(table_id))
                .filter(orders::id.ne(excluding))
                .filter(orders::status.ne(OrderStatus::Completed))
                .filter(orders::status.ne(OrderStatus::Cancelled)),
        ))
        .get_result(conn)?)
    }

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderRecord>, StoreError> {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;

        let mut query = orders::table.select(Order::as_select()).into_boxed::<Pg>();
        if !filter.statuses.is_empty() {
            query = query.filter(orders::status.eq_any(filter.statuses.clone()));
        }
        if !filter.payment_statuses.is_empty() {
            query = query.filter(orders::payment_status.eq_any(filter.payment_statuses.clone()));
        }
        if !filter.table_numbers.is_empty() {
            query = query.filter(orders::table_number.eq_any(filter.table_numbers.clone()));
        }
        if let Some(session_id) = filter.session_id {
            query = query.filter(orders::session_id.eq(session_id));
        }
        if let Some(from) = filter.created_from {
            query = query.filter(orders::created_at.ge(from));
        }
        if let Some(to) = filter.created_to {
            query = query.filter(orders::created_at.le(to));
        }
        if let Some(staff) = &filter.assigned_staff {
            query = query.filter(orders::assigned_staff.eq(staff.clone()));
        }
        if let Some(min) = &filter.min_amount {
            query = query.filter(orders::total_amount.ge(min.clone()));
        }
        if let Some(max) = &filter.max_amount {
            query = query.filter(orders::total_amount.le(max.clone()));
        }

        let rows = query.load(conn)?;
        let mut records = with_items(conn, rows)?;
        // Free-text search also looks at line items, so it runs here.
        records.retain(|r| filter.matches(r));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::sync::Arc;

    use super::*;

    fn store() -> PgStore {
        dotenvy::dotenv().ok();
        let url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url).unwrap();
        store.run_migrations().unwrap();
        store
    }

    fn table(store: &PgStore) -> DiningTable {
        let mut pooled = store.conn().unwrap();
        let conn: &mut PgConnection = &mut pooled;
        let table = DiningTable {
            id: Uuid::new_v4(),
            number: (rand::random::<u32>() % 1_000_000) as i32 + 1000,
            status: TableStatus::Empty,
            updated_at: Utc::now(),
        };
        diesel::insert_into(dining_tables::table)
            .values(&table)
            .execute(conn)
            .unwrap();
        table
    }

    fn device(session_id: Uuid, fingerprint: &str, now: DateTime<Utc>) -> SessionDevice {
        SessionDevice {
            session_id,
            fingerprint: fingerprint.to_string(),
            ip_address: "127.0.0.1".to_string(),
            user_agent: String::new(),
            browser: None,
            os: None,
            is_mobile: false,
            screen_resolution: None,
            first_seen: now,
            last_seen: now,
            order_count: 0,
        }
    }

    #[test]
    #[ignore = "needs a postgres database in DATABASE_URL"]
    fn test_second_active_session_conflicts() {
        let store = store();
        let table = table(&store);
        let now = Utc::now();

        let first = TableSession::new(&table, now, Duration::hours(4));
        store
            .insert_session(&first, &device(first.id, "a", now))
            .unwrap();

        let second = TableSession::new(&table, now, Duration::hours(4));
        let err = store
            .insert_session(&second, &device(second.id, "b", now))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[test]
    #[ignore = "needs a postgres database in DATABASE_URL"]
    fn test_concurrent_record_order_loses_no_update() {
        let store = Arc::new(store());
        let table = table(&store);
        let now = Utc::now();
        let session = TableSession::new(&table, now, Duration::hours(4));
        store
            .insert_session(&session, &device(session.id, "a", now))
            .unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                let id = session.id;
                std::thread::spawn(move || {
                    store
                        .record_order(id, &BigDecimal::from(3), Some("a"), now, Duration::seconds(60))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let session = store.find_session(session.id).unwrap().unwrap();
        assert_eq!(session.order_count, 10);
        assert_eq!(session.total_amount, BigDecimal::from(30));
        assert_eq!(session.recent_orders_count, 10);
        let devices = store.find_session_devices(session.id).unwrap();
        assert_eq!(devices[0].order_count, 10);
    }

    #[test]
    #[ignore = "needs a postgres database in DATABASE_URL"]
    fn test_order_insert_rolls_back_without_its_session() {
        let store = store();
        let table = table(&store);
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            version: 1,
            order_number: "ORD-20250301-0042".to_string(),
            table_id: table.id,
            table_number: table.number,
            session_id: Some(Uuid::new_v4()),
            device_fingerprint: None,
            status: OrderStatus::Pending,
            payment_status: crate::models::PaymentStatus::Pending,
            priority: crate::models::OrderPriority::Normal,
            order_type: crate::models::OrderType::DineIn,
            total_amount: BigDecimal::from(20),
            estimated_time: 15,
            notes: None,
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

        let err = store
            .insert_order(&order, &[], Duration::seconds(60))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(store.find_order(order.id).unwrap().is_none());
    }
}
