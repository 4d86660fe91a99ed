use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::error::ServiceError;
use crate::models::{SessionStatus, TableSession, TableStatus};
use crate::query::{self, SessionFilter, SessionStats};
use crate::store::{SessionRecord, Store, StoreError};

#[derive(Clone, Debug, PartialEq)]
pub struct SessionPolicy {
    pub ttl: Duration,
    pub max_devices: usize,
    /// Width of the sliding window kept on the session for rate limiting.
    pub rate_window: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(4),
            max_devices: 12,
            rate_window: Duration::seconds(60),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SessionJoin {
    pub session: TableSession,
    pub is_new: bool,
}

/// Owns the lifecycle of table sessions and decides whether a session may
/// place an order right now.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn Store>,
    policy: SessionPolicy,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Joins the table's live session or starts a new one.
    pub fn init_session(
        &self,
        table_number: i32,
        device: DeviceInfo,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionJoin, ServiceError> {
        if table_number <= 0 {
            return Err(ServiceError::Validation(
                "table number must be positive".to_string(),
            ));
        }
        let table = self
            .store
            .find_table_by_number(table_number)?
            .ok_or(ServiceError::TableNotFound(table_number))?;

        for stale in self.store.expire_stale_sessions(now, Some(table.id))? {
            info!(session_id = %stale.id, table_number, "Expired stale session");
        }

        if let Some(active) = self.store.find_active_session(table.id)? {
            return self.join(active.id, device, client_ip, now);
        }

        let session = TableSession::new(&table, now, self.policy.ttl);
        let first_device = device.clone().into_device(session.id, client_ip, now)?;
        match self.store.insert_session(&session, &first_device) {
            Ok(session) => {
                self.store
                    .set_table_status(table.id, TableStatus::Occupied, now)?;
                info!(session_id = %session.id, table_number, "Session started");
                Ok(SessionJoin {
                    session,
                    is_new: true,
                })
            }
            Err(StoreError::Conflict) => {
                let winner = self
                    .store
                    .find_active_session(table.id)?
                    .ok_or(StoreError::Conflict)?;
                self.join(winner.id, device, client_ip, now)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn join(
        &self,
        session_id: Uuid,
        device: DeviceInfo,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionJoin, ServiceError> {
        let device = device.into_device(session_id, client_ip, now)?;
        let registration = self
            .store
            .register_device(session_id, &device, self.policy.max_devices)
            .map_err(|err| match err {
                StoreError::DeviceLimit(limit) => ServiceError::DeviceLimit(limit),
                StoreError::Conflict => ServiceError::SessionExpired(session_id),
                StoreError::NotFound => ServiceError::SessionNotFound(session_id),
                other => other.into(),
            })?;
        if registration.is_new {
            info!(
                %session_id,
                total_devices = registration.session.total_devices,
                "Device joined session"
            );
        }
        Ok(SessionJoin {
            session: registration.session,
            is_new: false,
        })
    }

    /// Succeeds only for an active, unexpired session and refreshes its
    /// last activity. An active session found past its expiry is marked
    /// expired on the way out.
    pub fn validate(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<TableSession, ServiceError> {
        let session = self
            .store
            .find_session(session_id)?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        if session.status != SessionStatus::Active {
            return Err(ServiceError::SessionExpired(session_id));
        }
        if session.expiry_time <= now {
            if self.store.expire_session(session_id, now)?.is_some() {
                info!(%session_id, "Session expired");
            }
            return Err(ServiceError::SessionExpired(session_id));
        }

        self.store
            .touch_session(session_id, now)?
            .ok_or(ServiceError::SessionNotFound(session_id))
    }

    pub fn get(&self, session_id: Uuid) -> Result<SessionRecord, ServiceError> {
        let session = self
            .store
            .find_session(session_id)?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        let devices = self.store.find_session_devices(session_id)?;
        Ok(SessionRecord { session, devices })
    }

    pub fn extend(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<TableSession, ServiceError> {
        let expiry_time = now + self.policy.ttl;
        if let Some(session) = self.store.extend_session(session_id, now, expiry_time)? {
            info!(%session_id, %expiry_time, "Session extended");
            return Ok(session);
        }

        let session = self
            .store
            .find_session(session_id)?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        Err(match session.status {
            SessionStatus::Closed => ServiceError::SessionClosed(session_id),
            _ => ServiceError::SessionExpired(session_id),
        })
    }

    /// Closing an expired session is allowed; closing twice is not.
    pub fn close(
        &self,
        session_id: Uuid,
        reason: Option<&str>,
        closed_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TableSession, ServiceError> {
        let Some(session) = self
            .store
            .close_session(session_id, now, closed_by, reason)?
        else {
            return Err(match self.store.find_session(session_id)? {
                Some(_) => ServiceError::SessionClosed(session_id),
                None => ServiceError::SessionNotFound(session_id),
            });
        };
        info!(%session_id, closed_by, reason, "Session closed");

        self.release_table(&session, now)?;
        Ok(session)
    }

    pub fn flag(
        &self,
        session_id: Uuid,
        reason: &str,
        manual: bool,
        flagged_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TableSession, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::Validation("flag reason is required".to_string()));
        }
        let session = self
            .store
            .flag_session(session_id, reason, manual, flagged_by, now)?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        warn!(%session_id, reason, manual, "Session flagged");
        Ok(session)
    }

    pub fn unflag(&self, session_id: Uuid) -> Result<TableSession, ServiceError> {
        let session = self
            .store
            .unflag_session(session_id)?
            .ok_or(ServiceError::SessionNotFound(session_id))?;
        info!(%session_id, "Session unflagged");
        Ok(session)
    }

    /// Attaches an order to the session in one atomic store update.
    pub fn record_order(
        &self,
        session_id: Uuid,
        amount: &bigdecimal::BigDecimal,
        device_fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TableSession, ServiceError> {
        self.store
            .record_order(
                session_id,
                amount,
                device_fingerprint,
                now,
                self.policy.rate_window,
            )
            .map_err(|err| match err {
                StoreError::NotFound => ServiceError::SessionNotFound(session_id),
                other => other.into(),
            })
    }

    /// Marks abandoned sessions expired and frees their tables. Returns how
    /// many sessions were expired.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let expired = self.store.expire_stale_sessions(now, None)?;
        for session in &expired {
            self.release_table(session, now)?;
        }
        Ok(expired.len())
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<TableSession>, ServiceError> {
        let mut sessions = self.store.list_sessions(filter)?;
        query::sort_sessions(&mut sessions);
        Ok(sessions)
    }

    pub fn stats(&self, filter: &SessionFilter) -> Result<SessionStats, ServiceError> {
        let sessions = self.store.list_sessions(filter)?;
        Ok(query::session_stats(&sessions))
    }

    fn release_table(&self, session: &TableSession, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if self.store.find_active_session(session.table_id)?.is_none() {
            self.store
                .set_table_status(session.table_id, TableStatus::Empty, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;

    use super::*;
    use crate::error::ErrorCode;
    use crate::store::{MemoryStore, SessionRepository, TableRegistry};

    fn device(fingerprint: &str) -> DeviceInfo {
        DeviceInfo {
            fingerprint: fingerprint.to_string(),
            user_agent: Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1".to_string()),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemoryStore>, SessionService) {
        let store = Arc::new(MemoryStore::with_tables(&[7, 12]));
        let service = SessionService::new(store.clone(), SessionPolicy::default());
        (store, service)
    }

    #[test]
    fn test_second_device_joins_existing_session() {
        let (store, service) = setup();
        let now = Utc::now();

        let first = service.init_session(12, device("device-a"), "10.0.0.1", now).unwrap();
        assert!(first.is_new);
        assert_eq!(first.session.total_devices, 1);
        assert_eq!(first.session.expiry_time, now + Duration::hours(4));

        let second = service
            .init_session(12, device("device-b"), "10.0.0.2", now + Duration::seconds(5))
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.total_devices, 2);

        let table = store.find_table_by_number(12).unwrap().unwrap();
        assert_eq!(table.status, TableStatus::Occupied);
    }

    #[test]
    fn test_rejoining_device_is_not_counted_twice() {
        let (_, service) = setup();
        let now = Utc::now();

        let first = service.init_session(12, device("device-a"), "10.0.0.1", now).unwrap();
        let again = service
            .init_session(12, device("device-a"), "10.0.0.9", now + Duration::minutes(3))
            .unwrap();

        assert_eq!(again.session.total_devices, 1);
        let record = service.get(first.session.id).unwrap();
        assert_eq!(record.devices.len(), 1);
        assert_eq!(record.devices[0].last_seen, now + Duration::minutes(3));
        assert_eq!(record.devices[0].ip_address, "10.0.0.9");
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let (_, service) = setup();

        let err = service
            .init_session(99, device("device-a"), "10.0.0.1", Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TableNotFound);
    }

    #[test]
    fn test_device_limit() {
        let store = Arc::new(MemoryStore::with_tables(&[3]));
        let service = SessionService::new(
            store,
            SessionPolicy {
                max_devices: 2,
                ..SessionPolicy::default()
            },
        );
        let now = Utc::now();
        service.init_session(3, device("a"), "ip", now).unwrap();
        service.init_session(3, device("b"), "ip", now).unwrap();

        let err = service.init_session(3, device("c"), "ip", now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeviceLimitExceeded);
        assert!(service.init_session(3, device("a"), "ip", now).is_ok());
    }

    #[test]
    fn test_validate_never_succeeds_after_expiry() {
        let (_, service) = setup();
        let now = Utc::now();
        let join = service.init_session(7, device("device-a"), "ip", now).unwrap();
        let id = join.session.id;

        let touched = service.validate(id, now + Duration::minutes(30)).unwrap();
        assert_eq!(touched.last_activity, now + Duration::minutes(30));

        let later = join.session.expiry_time;
        for _ in 0..3 {
            let err = service.validate(id, later).unwrap_err();
            assert_eq!(err.code(), ErrorCode::SessionExpired);
        }
        assert_eq!(service.get(id).unwrap().session.status, SessionStatus::Expired);

        let err = service.validate(Uuid::new_v4(), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSession);
    }

    #[test]
    fn test_expired_session_is_replaced_not_revived() {
        let (store, service) = setup();
        let now = Utc::now();
        let old = service.init_session(7, device("device-a"), "ip", now).unwrap();

        let later = now + Duration::hours(5);
        let fresh = service.init_session(7, device("device-a"), "ip", later).unwrap();

        assert!(fresh.is_new);
        assert_ne!(fresh.session.id, old.session.id);
        let old = store.find_session(old.session.id).unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::Expired);
    }

    #[test]
    fn test_extend_only_while_active() {
        let (_, service) = setup();
        let now = Utc::now();
        let join = service.init_session(7, device("device-a"), "ip", now).unwrap();
        let id = join.session.id;

        let extended = service.extend(id, now + Duration::hours(1)).unwrap();
        assert_eq!(extended.expiry_time, now + Duration::hours(5));

        service.close(id, Some("paid"), Some("staff-1"), now).unwrap();
        let err = service.extend(id, now + Duration::hours(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionClosed);
    }

    #[test]
    fn test_close_frees_table_and_cannot_repeat() {
        let (store, service) = setup();
        let now = Utc::now();
        let join = service.init_session(7, device("device-a"), "ip", now).unwrap();

        let closed = service
            .close(join.session.id, Some("guests left"), Some("staff-1"), now)
            .unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.closed_at, Some(now));
        assert_eq!(closed.closed_by.as_deref(), Some("staff-1"));

        let table = store.find_table_by_number(7).unwrap().unwrap();
        assert_eq!(table.status, TableStatus::Empty);

        let err = service.close(join.session.id, None, None, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionClosed);
    }

    #[test]
    fn test_flag_and_unflag() {
        let (_, service) = setup();
        let now = Utc::now();
        let join = service.init_session(7, device("device-a"), "ip", now).unwrap();
        let id = join.session.id;

        service.flag(id, "rapid orders", false, None, now).unwrap();
        let flagged = service
            .flag(id, "rude to staff", true, Some("manager"), now)
            .unwrap();
        assert!(flagged.is_suspicious);
        assert!(flagged.auto_flagged);
        assert!(flagged.manually_flagged);
        assert_eq!(flagged.suspicious_reasons, ["rapid orders", "rude to staff"]);
        assert_eq!(flagged.flagged_by.as_deref(), Some("manager"));

        let cleared = service.unflag(id).unwrap();
        assert!(!cleared.is_suspicious);
        assert!(cleared.suspicious_reasons.is_empty());
        assert!(!cleared.auto_flagged && !cleared.manually_flagged);

        let stats = service.stats(&SessionFilter::default()).unwrap();
        assert_eq!(stats.flagged, 0);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn test_record_order_updates_aggregates() {
        let (_, service) = setup();
        let now = Utc::now();
        let join = service.init_session(7, device("device-a"), "ip", now).unwrap();
        let id = join.session.id;

        service
            .record_order(id, &BigDecimal::from(40), Some("device-a"), now)
            .unwrap();
        let session = service
            .record_order(id, &BigDecimal::from(60), Some("device-a"), now + Duration::seconds(20))
            .unwrap();

        assert_eq!(session.order_count, 2);
        assert_eq!(session.total_amount, BigDecimal::from(100));
        assert_eq!(session.recent_orders_count, 2);
        assert_eq!(session.last_order_time, Some(now + Duration::seconds(20)));
        assert_eq!(service.get(id).unwrap().devices[0].order_count, 2);
    }

    #[test]
    fn test_sweep_expires_abandoned_sessions() {
        let (store, service) = setup();
        let now = Utc::now();
        service.init_session(7, device("a"), "ip", now).unwrap();
        service.init_session(12, device("b"), "ip", now + Duration::hours(3)).unwrap();

        let swept = service.sweep_expired(now + Duration::hours(4)).unwrap();
        assert_eq!(swept, 1);
        let table = store.find_table_by_number(7).unwrap().unwrap();
        assert_eq!(table.status, TableStatus::Empty);
        let table = store.find_table_by_number(12).unwrap().unwrap();
        assert_eq!(table.status, TableStatus::Occupied);
    }

    #[test]
    fn test_concurrent_joins_share_one_session() {
        let (store, service) = setup();
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let service = service.clone();
                std::thread::spawn(move || {
                    service
                        .init_session(12, device(&format!("device-{i}")), "ip", now)
                        .unwrap()
                })
            })
            .collect();
        let joins: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(joins.iter().filter(|j| j.is_new).count(), 1);
        let table = store.find_table_by_number(12).unwrap().unwrap();
        let active = store.find_active_session(table.id).unwrap().unwrap();
        assert!(joins.iter().all(|j| j.session.id == active.id));
        assert_eq!(active.total_devices, 8);
    }
}
