//! IP-subnet and phone-prefix reputation aggregates (spec §3, §4.3, §4.9).
//!
//! Both tables maintain the invariant `verified + failed <= total`; every
//! mutation happens inside a single `UPDATE ... SET total = total + 1`
//! statement rather than read-modify-write from the application side, so
//! concurrent touches from different requests cannot race each other.

use brivas_lumadb::LumaDbPool;
use tokio_postgres::Row;

use crate::domain::{IpReputation, PrefixReputation};
use crate::error::Result;

pub struct IpReputationRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> IpReputationRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn find(&self, subnet: &str) -> Result<Option<IpReputation>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt("SELECT * FROM ip_reputation WHERE subnet = $1", &[&subnet])
            .await?;
        Ok(row.map(|r| row_to_ip_reputation(&r)))
    }

    /// Increment `total`, creating the row if it doesn't exist yet.
    pub async fn touch(&self, subnet: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO ip_reputation (subnet, total, verified, failed, banned, ban_reason)
                VALUES ($1, 1, 0, 0, false, NULL)
                ON CONFLICT (subnet) DO UPDATE SET total = ip_reputation.total + 1
                "#,
                &[&subnet],
            )
            .await?;
        Ok(())
    }

    pub async fn record_verified(&self, subnet: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                "UPDATE ip_reputation SET verified = verified + 1 WHERE subnet = $1",
                &[&subnet],
            )
            .await?;
        Ok(())
    }

    pub async fn record_failed(&self, subnet: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                "UPDATE ip_reputation SET failed = failed + 1 WHERE subnet = $1",
                &[&subnet],
            )
            .await?;
        Ok(())
    }

    pub async fn ban(&self, subnet: &str, reason: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO ip_reputation (subnet, total, verified, failed, banned, ban_reason)
                VALUES ($1, 0, 0, 0, true, $2)
                ON CONFLICT (subnet) DO UPDATE SET banned = true, ban_reason = $2
                "#,
                &[&subnet, &reason],
            )
            .await?;
        Ok(())
    }
}

fn row_to_ip_reputation(row: &Row) -> IpReputation {
    IpReputation {
        subnet: row.get("subnet"),
        total: row.get::<_, i64>("total") as u64,
        verified: row.get::<_, i64>("verified") as u64,
        failed: row.get::<_, i64>("failed") as u64,
        banned: row.get("banned"),
        ban_reason: row.get("ban_reason"),
    }
}

pub struct PrefixReputationRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> PrefixReputationRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn find(&self, prefix: &str) -> Result<Option<PrefixReputation>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM prefix_reputation WHERE prefix = $1",
                &[&prefix],
            )
            .await?;
        Ok(row.map(|r| row_to_prefix_reputation(&r)))
    }

    pub async fn touch(&self, prefix: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO prefix_reputation (prefix, total, verified, failed)
                VALUES ($1, 1, 0, 0)
                ON CONFLICT (prefix) DO UPDATE SET total = prefix_reputation.total + 1
                "#,
                &[&prefix],
            )
            .await?;
        Ok(())
    }

    /// Unlike `IpReputation` (touched on every admission), `PrefixReputation`
    /// is "aggregated from auth feedback joined on requests" (spec §3): its
    /// `total` only grows as feedback arrives, so each record is an upsert
    /// rather than an update against a row `touch()` would have pre-created.
    pub async fn record_verified(&self, prefix: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO prefix_reputation (prefix, total, verified, failed)
                VALUES ($1, 1, 1, 0)
                ON CONFLICT (prefix) DO UPDATE SET
                    total = prefix_reputation.total + 1,
                    verified = prefix_reputation.verified + 1
                "#,
                &[&prefix],
            )
            .await?;
        Ok(())
    }

    pub async fn record_failed(&self, prefix: &str) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO prefix_reputation (prefix, total, verified, failed)
                VALUES ($1, 1, 0, 1)
                ON CONFLICT (prefix) DO UPDATE SET
                    total = prefix_reputation.total + 1,
                    failed = prefix_reputation.failed + 1
                "#,
                &[&prefix],
            )
            .await?;
        Ok(())
    }
}

fn row_to_prefix_reputation(row: &Row) -> PrefixReputation {
    PrefixReputation {
        prefix: row.get("prefix"),
        total: row.get::<_, i64>("total") as u64,
        verified: row.get::<_, i64>("verified") as u64,
        failed: row.get::<_, i64>("failed") as u64,
    }
}
