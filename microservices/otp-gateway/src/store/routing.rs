//! Caller-ID routing table (spec §3 CallerIdRoute, §4.4 C4), keyed on
//! `(channel, prefix)` uniqueness the same way `voice-switch`'s LCR table is
//! keyed on `(carrier, prefix)`.

use brivas_lumadb::LumaDbPool;
use tokio_postgres::Row;

use crate::domain::{CallerIdRoute, Channel};
use crate::error::{Error, Result};

pub struct CallerIdRouteRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> CallerIdRouteRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn list_enabled(&self) -> Result<Vec<CallerIdRoute>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                "SELECT * FROM caller_id_routes WHERE enabled = true",
                &[],
            )
            .await?;
        Ok(rows.iter().map(row_to_route).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<CallerIdRoute>> {
        let client = self.db.get().await?;
        let rows = client.query("SELECT * FROM caller_id_routes", &[]).await?;
        Ok(rows.iter().map(row_to_route).collect())
    }

    pub async fn create(&self, route: &CallerIdRoute) -> Result<()> {
        let client = self.db.get().await?;
        let existing = client
            .query_opt(
                "SELECT 1 FROM caller_id_routes WHERE channel = $1 AND prefix = $2",
                &[&route.channel.as_str(), &route.prefix],
            )
            .await?;
        if existing.is_some() {
            return Err(Error::DuplicatePrefix);
        }
        client
            .execute(
                r#"
                INSERT INTO caller_id_routes (channel, prefix, caller_id, description, enabled)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &route.channel.as_str(),
                    &route.prefix,
                    &route.caller_id,
                    &route.description,
                    &route.enabled,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, channel: Channel, prefix: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                "DELETE FROM caller_id_routes WHERE channel = $1 AND prefix = $2",
                &[&channel.as_str(), &prefix],
            )
            .await?;
        Ok(())
    }
}

fn row_to_route(row: &Row) -> CallerIdRoute {
    let channel: String = row.get("channel");
    CallerIdRoute {
        channel: channel.parse().unwrap_or(Channel::Sms),
        prefix: row.get("prefix"),
        caller_id: row.get("caller_id"),
        description: row.get("description"),
        enabled: row.get("enabled"),
    }
}
