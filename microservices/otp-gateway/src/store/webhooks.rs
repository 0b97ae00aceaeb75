//! Webhook delivery attempt log (spec §3 WebhookLog, §4.9 C9).

use brivas_lumadb::LumaDbPool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::domain::WebhookLog;
use crate::error::Result;

pub struct WebhookLogRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> WebhookLogRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn record(&self, log: &WebhookLog) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO webhook_logs (request_id, url, attempt, status_code, error, sent_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &log.request_id,
                    &log.url,
                    &(log.attempt as i32),
                    &log.status_code.map(|c| c as i32),
                    &log.error,
                    &log.sent_at,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_by_request(&self, request_id: Uuid) -> Result<Vec<WebhookLog>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                "SELECT * FROM webhook_logs WHERE request_id = $1 ORDER BY attempt ASC",
                &[&request_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_log).collect())
    }

    pub async fn was_delivered(&self, request_id: Uuid) -> Result<bool> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT 1 FROM webhook_logs
                WHERE request_id = $1 AND status_code >= 200 AND status_code < 300
                LIMIT 1
                "#,
                &[&request_id],
            )
            .await?;
        Ok(row.is_some())
    }

    /// Requests with attempts logged but no successful (2xx) delivery yet and
    /// fewer than `max_attempts` tries so far — candidates for startup
    /// recovery (spec §4.9: delivery survives a gateway restart).
    pub async fn list_unterminated(&self, max_attempts: u32) -> Result<Vec<Uuid>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                SELECT request_id FROM webhook_logs
                GROUP BY request_id
                HAVING COUNT(*) FILTER (WHERE status_code >= 200 AND status_code < 300) = 0
                   AND COUNT(*) < $1
                "#,
                &[&(max_attempts as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("request_id")).collect())
    }
}

fn row_to_log(row: &Row) -> WebhookLog {
    WebhookLog {
        request_id: row.get("request_id"),
        url: row.get("url"),
        attempt: row.get::<_, i32>("attempt") as u32,
        status_code: row.get::<_, Option<i32>>("status_code").map(|c| c as u16),
        error: row.get("error"),
        sent_at: row.get("sent_at"),
    }
}
