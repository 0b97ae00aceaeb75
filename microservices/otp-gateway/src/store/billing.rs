//! CDR intake, learned carrier rates, and the fraud-savings ledger (spec §3
//! CdrRecord/CarrierRate/FraudSaving, §4.10 C10).

use brivas_lumadb::LumaDbPool;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::domain::{CarrierRate, CdrRecord, Channel, FraudSaving};
use crate::error::Result;

pub struct CdrRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> CdrRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn insert(&self, cdr: &CdrRecord) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO cdr_records (
                    id, channel, source, destination, dst_prefix, src_prefix,
                    duration_seconds, billing_duration_seconds, price_units,
                    success, disconnect_code, processed_for_rates, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, false, $12)
                "#,
                &[
                    &cdr.id,
                    &cdr.channel.as_str(),
                    &cdr.source,
                    &cdr.destination,
                    &cdr.dst_prefix,
                    &cdr.src_prefix,
                    &(cdr.duration_seconds as i32),
                    &(cdr.billing_duration_seconds as i32),
                    &cdr.price_units,
                    &cdr.success,
                    &cdr.disconnect_code,
                    &cdr.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    /// Fetch up to `limit` CDRs not yet folded into `carrier_rates`
    /// (spec §4.10: the rate-learning cycle batches unprocessed records).
    pub async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<CdrRecord>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                "SELECT * FROM cdr_records WHERE processed_for_rates = false ORDER BY created_at ASC LIMIT $1",
                &[&(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(row_to_cdr).collect())
    }

    pub async fn mark_processed(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let client = self.db.get().await?;
        client
            .execute(
                "UPDATE cdr_records SET processed_for_rates = true WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(())
    }
}

fn row_to_cdr(row: &Row) -> CdrRecord {
    let channel: String = row.get("channel");
    CdrRecord {
        id: row.get("id"),
        channel: channel.parse().unwrap_or(Channel::Voice),
        source: row.get("source"),
        destination: row.get("destination"),
        dst_prefix: row.get("dst_prefix"),
        src_prefix: row.get("src_prefix"),
        duration_seconds: row.get::<_, i32>("duration_seconds") as u32,
        billing_duration_seconds: row.get::<_, i32>("billing_duration_seconds") as u32,
        price_units: row.get("price_units"),
        success: row.get("success"),
        disconnect_code: row.get("disconnect_code"),
        processed_for_rates: row.get("processed_for_rates"),
        created_at: row.get("created_at"),
    }
}

/// Learned per-prefix rates, updated with an exponential moving average as
/// new CDRs are folded in (`rating::engine::RatingEngine` does the same
/// table-per-prefix bookkeeping for pre-negotiated rates; here the rates
/// themselves are inferred rather than configured).
pub struct CarrierRateRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> CarrierRateRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    /// Prefix-hierarchy lookup (spec §4.9): longest `dst_prefix` match wins,
    /// and within ties a row whose `src_prefix` equals `src` is preferred
    /// over one with `src_prefix IS NULL`. `src = None` only matches rows
    /// with `src_prefix IS NULL`.
    pub async fn find_best_match(
        &self,
        channel: Channel,
        dst: &str,
        src: Option<&str>,
    ) -> Result<Option<CarrierRate>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT * FROM carrier_rates
                WHERE channel = $1
                  AND $2 LIKE (dst_prefix || '%')
                  AND (src_prefix IS NULL OR src_prefix = $3)
                ORDER BY (src_prefix IS NOT NULL AND src_prefix = $3) DESC, LENGTH(dst_prefix) DESC
                LIMIT 1
                "#,
                &[&channel.as_str(), &dst, &src],
            )
            .await?;
        Ok(row.map(|r| row_to_rate(&r)))
    }

    pub async fn upsert(&self, rate: &CarrierRate) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO carrier_rates (
                    channel, dst_prefix, src_prefix, rate_avg, rate_min, rate_max,
                    billing_increment, sample_count, confidence_score, last_seen_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (channel, dst_prefix, (coalesce(src_prefix, ''))) DO UPDATE SET
                    rate_avg = $4, rate_min = $5, rate_max = $6,
                    billing_increment = $7, sample_count = $8,
                    confidence_score = $9, last_seen_at = $10
                "#,
                &[
                    &rate.channel.as_str(),
                    &rate.dst_prefix,
                    &rate.src_prefix,
                    &rate.rate_avg,
                    &rate.rate_min,
                    &rate.rate_max,
                    &(rate.billing_increment as i32),
                    &(rate.sample_count as i64),
                    &rate.confidence_score,
                    &rate.last_seen_at,
                ],
            )
            .await?;
        Ok(())
    }
}

fn row_to_rate(row: &Row) -> CarrierRate {
    let channel: String = row.get("channel");
    CarrierRate {
        channel: channel.parse().unwrap_or(Channel::Voice),
        dst_prefix: row.get("dst_prefix"),
        src_prefix: row.get("src_prefix"),
        rate_avg: row.get("rate_avg"),
        rate_min: row.get("rate_min"),
        rate_max: row.get("rate_max"),
        billing_increment: row.get::<_, i32>("billing_increment") as u32,
        sample_count: row.get::<_, i64>("sample_count") as u64,
        confidence_score: row.get("confidence_score"),
        last_seen_at: row.get("last_seen_at"),
    }
}

/// Ledger of estimated costs avoided by rejecting/shadow-banning fraudulent
/// requests before they reached a carrier, priced via `CarrierRateRepo`.
pub struct FraudSavingRepo<'a> {
    db: &'a LumaDbPool,
}

impl<'a> FraudSavingRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn record(&self, saving: &FraudSaving) -> Result<()> {
        let client = self.db.get().await?;
        client
            .execute(
                r#"
                INSERT INTO fraud_savings (request_id, estimated_cost_units, created_at)
                VALUES ($1, $2, $3)
                "#,
                &[&saving.request_id, &saving.estimated_cost_units, &saving.created_at],
            )
            .await?;
        Ok(())
    }

    pub async fn total_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let client = self.db.get().await?;
        let row = client
            .query_one(
                "SELECT COALESCE(SUM(estimated_cost_units), 0) AS total FROM fraud_savings WHERE created_at >= $1",
                &[&since],
            )
            .await?;
        Ok(row.get("total"))
    }
}
