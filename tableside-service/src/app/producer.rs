use std::{thread::sleep, time::Duration};

use diesel::prelude::*;
use diesel::result::Error as DieselError;
use kafka::client::RequiredAcks;
use kafka::producer::{Producer, Record};
use tracing::{debug, error, info};

use crate::models::Outbox;
use crate::schema::outbox;
use crate::store::DbPool;

const IDLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("kafka error: {0}")]
    Kafka(#[from] kafka::Error),
}

/// Moves outbox rows to Kafka one at a time. A row is deleted only after
/// the broker acknowledged it, so delivery is at least once.
pub struct OutboxRelay {
    kafka: Producer,
}

impl OutboxRelay {
    pub fn connect(kafka_url: &str) -> Result<Self, RelayError> {
        let kafka = Producer::from_hosts(vec![kafka_url.to_string()])
            .with_ack_timeout(Duration::from_secs(1))
            .with_required_acks(RequiredAcks::One)
            .create()?;
        Ok(Self { kafka })
    }

    /// Returns `false` when the outbox was empty.
    pub fn relay_next(&mut self, conn: &mut PgConnection) -> Result<bool, RelayError> {
        conn.transaction::<_, RelayError, _>(|conn| {
            let row = match outbox::table
                .select(Outbox::as_select())
                .order(outbox::id.asc())
                .for_update()
                .skip_locked()
                .first::<Outbox>(conn)
            {
                Ok(row) => row,
                Err(DieselError::NotFound) => return Ok(false),
                Err(err) => return Err(err.into()),
            };

            self.kafka.send(&Record::from_key_value(
                &row.topic,
                row.key.clone(),
                row.value.clone(),
            ))?;

            diesel::delete(outbox::table.filter(outbox::id.eq(row.id))).execute(conn)?;
            debug!(id = row.id, topic = %row.topic, key = %row.key, "Relayed outbox row");

            Ok(true)
        })
    }

    /// Relays forever, backing off while the outbox is empty or failing.
    pub fn run(&mut self, pool: &DbPool) {
        info!("Outbox relay started");
        loop {
            let result = pool
                .get()
                .map_err(RelayError::from)
                .and_then(|mut conn| self.relay_next(&mut conn));

            match result {
                Ok(true) => {}
                Ok(false) => sleep(IDLE_DELAY),
                Err(err) => {
                    error!(error = %err, "Error relaying outbox row");
                    sleep(IDLE_DELAY);
                }
            }
        }
    }
}
