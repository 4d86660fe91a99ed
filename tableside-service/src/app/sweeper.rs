use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::session::SessionService;

/// Periodically marks abandoned sessions expired and frees their tables.
/// Validation catches expiry on its own; this only keeps tables and
/// dashboards tidy.
pub fn start_session_sweeper(sessions: SessionService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(every);

        loop {
            interval_timer.tick().await;
            sweep_once(&sessions).await;
        }
    })
}

pub async fn sweep_once(sessions: &SessionService) -> usize {
    debug!("Sweeping expired sessions");

    let sessions = sessions.clone();
    let result = tokio::task::spawn_blocking(move || sessions.sweep_expired(Utc::now())).await;

    match result {
        Ok(Ok(count)) => {
            if count > 0 {
                info!(sessions_expired = count, "Expired sessions swept");
            }
            count
        }
        Ok(Err(err)) => {
            error!(error = %err, "Failed to sweep expired sessions");
            0
        }
        Err(err) => {
            error!(error = %err, "Session sweep task panicked");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::device::DeviceInfo;
    use crate::session::SessionPolicy;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_sweep_expires_sessions_past_their_ttl() {
        let store = Arc::new(MemoryStore::with_tables(&[3]));
        let sessions = SessionService::new(
            store,
            SessionPolicy {
                ttl: ChronoDuration::seconds(-1),
                ..SessionPolicy::default()
            },
        );
        let device = DeviceInfo {
            fingerprint: "device-a".to_string(),
            ..Default::default()
        };
        sessions
            .init_session(3, device, "10.0.0.1", Utc::now())
            .unwrap();

        assert_eq!(sweep_once(&sessions).await, 1);
        assert_eq!(sweep_once(&sessions).await, 0);
    }
}
