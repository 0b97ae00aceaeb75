//! Static and semi-static fraud-control lists: ASN blocklist, honeypot
//! subnets, whitelist overrides, and persisted circuit-breaker snapshots
//! (spec §3, §4.3, §4.4).

use brivas_lumadb::LumaDbPool;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::domain::{AsnBlocklistEntry, HoneypotEntry, WhitelistEntry, WhitelistKind};
use crate::error::Result;

pub struct AsnBlocklistRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> AsnBlocklistRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn is_blocked(&self, asn: u32) -> Result<bool> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT asn FROM asn_blocklist WHERE asn = $1",
                &[&(asn as i64)],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_all(&self) -> Result<Vec<AsnBlocklistEntry>> {
        let client = self.db.get().await?;
        let rows = client.query("SELECT * FROM asn_blocklist", &[]).await?;
        Ok(rows
            .iter()
            .map(|r| AsnBlocklistEntry {
                asn: r.get::<_, i64>("asn") as u32,
                provider: r.get("provider"),
                category: r.get("category"),
                reason: r.get("reason"),
            })
            .collect())
    }

    pub async fn add(&self, entry: &AsnBlocklistEntry) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO asn_blocklist (asn, provider, category, reason)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (asn) DO UPDATE SET provider = $2, category = $3, reason = $4
                "#,
                &[
                    &(entry.asn as i64),
                    &entry.provider,
                    &entry.category,
                    &entry.reason,
                ],
            )
            .await?;
        Ok(())
    }
}

pub struct HoneypotRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> HoneypotRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    /// A subnet is an active honeypot if it has no expiry, or its expiry is
    /// still in the future.
    pub async fn is_active(&self, subnet: &str, now: DateTime<Utc>) -> Result<bool> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT expires_at FROM honeypots WHERE subnet = $1",
                &[&subnet],
            )
            .await?;
        Ok(match row {
            None => false,
            Some(r) => {
                let expires_at: Option<DateTime<Utc>> = r.get("expires_at");
                expires_at.map(|exp| exp > now).unwrap_or(true)
            }
        })
    }

    pub async fn add(&self, subnet: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO honeypots (subnet, expires_at)
                VALUES ($1, $2)
                ON CONFLICT (subnet) DO UPDATE SET expires_at = $2
                "#,
                &[&subnet, &expires_at],
            )
            .await?;
        Ok(())
    }

    pub async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<HoneypotEntry>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                "SELECT * FROM honeypots WHERE expires_at IS NULL OR expires_at > $1",
                &[&now],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| HoneypotEntry {
                subnet: r.get("subnet"),
                expires_at: r.get("expires_at"),
            })
            .collect())
    }
}

pub struct WhitelistRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> WhitelistRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn is_whitelisted(&self, kind: WhitelistKind, value: &str) -> Result<bool> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT value FROM whitelist WHERE kind = $1 AND value = $2",
                &[&kind_str(kind), &value],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_all(&self) -> Result<Vec<WhitelistEntry>> {
        let client = self.db.get().await?;
        let rows = client.query("SELECT * FROM whitelist", &[]).await?;
        Ok(rows.iter().map(row_to_whitelist_entry).collect())
    }

    pub async fn add(&self, entry: &WhitelistEntry) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO whitelist (kind, value)
                VALUES ($1, $2)
                ON CONFLICT (kind, value) DO NOTHING
                "#,
                &[&kind_str(entry.kind), &entry.value],
            )
            .await?;
        Ok(())
    }
}

fn kind_str(kind: WhitelistKind) -> &'static str {
    match kind {
        WhitelistKind::Ip => "ip",
        WhitelistKind::Phone => "phone",
    }
}

fn row_to_whitelist_entry(row: &Row) -> WhitelistEntry {
    let kind: String = row.get("kind");
    WhitelistEntry {
        kind: if kind == "ip" {
            WhitelistKind::Ip
        } else {
            WhitelistKind::Phone
        },
        value: row.get("value"),
    }
}

/// Persisted snapshot of an in-memory circuit breaker, written on every state
/// change so a restart doesn't have to relearn a carrier/channel outage from
/// scratch (spec §4.4: breakers survive process restarts).
pub struct CircuitBreakerRepo<'a> {
    db: &'a LumaDbPool,
}

pub struct CircuitBreakerSnapshot {
    pub key: String,
    pub state: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl<'a> CircuitBreakerRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, snapshot: &CircuitBreakerSnapshot) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO circuit_breakers (key, state, failure_count, success_count, opened_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (key) DO UPDATE SET
                    state = $2, failure_count = $3, success_count = $4, opened_at = $5
                "#,
                &[
                    &snapshot.key,
                    &snapshot.state,
                    &(snapshot.failure_count as i32),
                    &(snapshot.success_count as i32),
                    &snapshot.opened_at,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<CircuitBreakerSnapshot>> {
        let client = self.db.get().await?;
        let rows = client.query("SELECT * FROM circuit_breakers", &[]).await?;
        Ok(rows
            .iter()
            .map(|r| CircuitBreakerSnapshot {
                key: r.get("key"),
                state: r.get("state"),
                failure_count: r.get::<_, i32>("failure_count") as u32,
                success_count: r.get::<_, i32>("success_count") as u32,
                opened_at: r.get("opened_at"),
            })
            .collect())
    }
}
