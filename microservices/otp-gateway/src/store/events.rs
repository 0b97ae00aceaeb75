//! Append-only lifecycle event log (spec §3 OtpEvent, §4.7).

use brivas_lumadb::LumaDbPool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::domain::{Channel, OtpEvent};
use crate::error::Result;

pub struct OtpEventRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> OtpEventRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn append(&self, event: &OtpEvent) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO otp_events (request_id, channel, event_type, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &event.request_id,
                    &event.channel.as_str(),
                    &event.event_type,
                    &event.payload,
                    &event.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_by_request(&self, request_id: Uuid) -> Result<Vec<OtpEvent>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                "SELECT * FROM otp_events WHERE request_id = $1 ORDER BY created_at ASC",
                &[&request_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_event).collect())
    }
}

fn row_to_event(row: &Row) -> OtpEvent {
    let channel: String = row.get("channel");
    OtpEvent {
        request_id: row.get("request_id"),
        channel: channel.parse().unwrap_or(Channel::Sms),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    }
}
