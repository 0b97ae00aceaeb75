//! CDR-driven rate-learning service (spec §4.10 C10): periodically folds
//! unprocessed CDRs into per-prefix `CarrierRate` estimates via an
//! exponential moving average, the same `DashMap` rate-cache /
//! `rust_decimal` money-math shape `billing::rating::engine::RatingEngine`
//! uses for pre-negotiated rates — here the rates are inferred rather than
//! configured.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::domain::{CarrierRate, CdrRecord};
use crate::error::Result;
use crate::store::Store;

const EMA_ALPHA: Decimal = dec!(0.2);
const STORAGE_SCALE: Decimal = dec!(10000);

pub struct RateLearningService {
    store: Arc<Store>,
    batch_size: usize,
}

impl RateLearningService {
    pub fn new(store: Arc<Store>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    /// Spawns the periodic background task; returns its `JoinHandle` so the
    /// caller can hold/abort it as part of orderly shutdown (spec §9:
    /// "initialize in a defined order at startup, tear down in reverse").
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_cycle().await {
                    tracing::warn!(error = %err, "rate learning cycle failed");
                }
            }
        })
    }

    /// One cycle per spec §4.10: fetch up to `batch_size` unprocessed CDRs,
    /// fold successful ones into `carrier_rates` via EMA, then mark the
    /// whole fetched batch processed regardless of whether each one
    /// contributed (this advances the cursor).
    pub async fn run_cycle(&self) -> Result<usize> {
        let cdrs = self.store.cdrs().fetch_unprocessed(self.batch_size).await?;
        if cdrs.is_empty() {
            return Ok(0);
        }

        let mut contributed = 0;
        for cdr in &cdrs {
            if self.fold_into_rate(cdr).await? {
                contributed += 1;
            }
        }

        let ids: Vec<Uuid> = cdrs.iter().map(|c| c.id).collect();
        self.store.cdrs().mark_processed(&ids).await?;
        Ok(contributed)
    }

    async fn fold_into_rate(&self, cdr: &CdrRecord) -> Result<bool> {
        if !cdr.success || cdr.price_units <= 0 || cdr.billing_duration_seconds == 0 {
            return Ok(false);
        }

        let price = Decimal::new(cdr.price_units, 4);
        let billing_minutes = Decimal::from(cdr.billing_duration_seconds) / dec!(60);
        let rate_per_minute = price / billing_minutes;
        let new_rate_units = (rate_per_minute * STORAGE_SCALE)
            .round()
            .to_i64()
            .unwrap_or(0);

        let existing = self
            .store
            .carrier_rates()
            .find_best_match(cdr.channel, &cdr.dst_prefix, cdr.src_prefix.as_deref())
            .await?;

        let updated = match existing {
            Some(mut rate) if rate.dst_prefix == cdr.dst_prefix && rate.src_prefix == cdr.src_prefix => {
                let avg = Decimal::from(rate.rate_avg);
                let new = Decimal::from(new_rate_units);
                let ema = (EMA_ALPHA * new + (Decimal::ONE - EMA_ALPHA) * avg)
                    .round()
                    .to_i64()
                    .unwrap_or(rate.rate_avg);
                rate.rate_avg = ema;
                rate.rate_min = rate.rate_min.min(new_rate_units);
                rate.rate_max = rate.rate_max.max(new_rate_units);
                rate.sample_count += 1;
                rate.confidence_score = (rate.sample_count as f64 / 100.0).min(1.0);
                rate.last_seen_at = cdr.created_at;
                rate
            }
            _ => CarrierRate {
                channel: cdr.channel,
                dst_prefix: cdr.dst_prefix.clone(),
                src_prefix: cdr.src_prefix.clone(),
                rate_avg: new_rate_units,
                rate_min: new_rate_units,
                rate_max: new_rate_units,
                billing_increment: 1,
                sample_count: 1,
                confidence_score: 0.01,
                last_seen_at: cdr.created_at,
            },
        };

        self.store.carrier_rates().upsert(&updated).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spec §8 scenario 6: seed `rate_avg=100, sample_count=1`; a CDR with
    /// `price=0.02, billing_duration=60` yields `rate_per_minute=0.02*10000=200`
    /// storage units, EMA `round(0.2*200 + 0.8*100) = 120`.
    #[test]
    fn ema_matches_spec_worked_example() {
        let avg = Decimal::from(100i64);
        let new = Decimal::from(200i64);
        let ema = (EMA_ALPHA * new + (Decimal::ONE - EMA_ALPHA) * avg)
            .round()
            .to_i64()
            .unwrap();
        assert_eq!(ema, 120);
    }

    #[test]
    fn price_to_rate_per_minute_conversion() {
        // price_units = 0.02 USD * 10000 = 200; billing_duration = 60s = 1 minute.
        let price = Decimal::new(200, 4);
        let minutes = Decimal::from(60u32) / dec!(60);
        let rate_per_minute = price / minutes;
        let storage_units = (rate_per_minute * STORAGE_SCALE).round().to_i64().unwrap();
        assert_eq!(storage_units, 200);
    }

    #[test]
    fn repeated_identical_observations_converge_within_ema_bound() {
        // |rate_avg - r| <= r * (1-alpha)^k after k identical observations r.
        let r = Decimal::from(100i64);
        let mut avg = Decimal::ZERO;
        let one_minus_alpha = Decimal::ONE - EMA_ALPHA;
        let mut factor = Decimal::ONE;
        for _ in 1..=10u32 {
            avg = (EMA_ALPHA * r + one_minus_alpha * avg).round();
            factor *= one_minus_alpha;
            let bound = r * factor;
            assert!((avg - r).abs() <= bound + Decimal::ONE);
        }
    }
}
