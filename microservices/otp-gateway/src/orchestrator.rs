//! Dispatch orchestrator (spec §4.6 C6): admits a request through the fraud
//! engine, persists it, then either runs the shadow-ban simulator or walks
//! `channels_requested` in order with failover — the same ordered-candidate
//! shape `voice-switch::lcr::LcrEngine::route` uses for carrier selection,
//! generalized from "pick a carrier" to "pick a channel, with failover".

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerManager;
use crate::domain::{Channel, DeliveryStatus, FraudSaving, OtpRequest};
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::fraud::{FraudContext, FraudEngine};
use crate::providers::ChannelProvider;
use crate::store::otp_requests::NewOtpRequest;
use crate::store::Store;

/// Circuit breaker key for a channel, shared with the fraud engine's hard
/// blocker check (spec §4.3/§4.6: both gate on "breaker open on this
/// channel", keyed identically so a trip in one place is visible in both).
pub fn channel_breaker_key(channel: Channel) -> String {
    format!("channel:{}", channel.as_str())
}

pub struct DispatchInput {
    pub phone: String,
    pub code: String,
    pub client_ip: IpAddr,
    pub phone_country: Option<String>,
    pub channels_requested: Vec<Channel>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub request_id: Uuid,
    pub status: DeliveryStatus,
    pub channel: Option<Channel>,
    pub error: Option<String>,
}

pub struct DispatchOrchestrator {
    store: Arc<Store>,
    fraud: Arc<FraudEngine>,
    event_bus: Arc<EventBus>,
    breakers: Arc<CircuitBreakerManager>,
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
    code_digest_salt: String,
    otp_ttl: Duration,
    failover_enabled: bool,
}

impl DispatchOrchestrator {
    pub fn new(
        store: Arc<Store>,
        fraud: Arc<FraudEngine>,
        event_bus: Arc<EventBus>,
        breakers: Arc<CircuitBreakerManager>,
        providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
        code_digest_salt: String,
        otp_ttl: Duration,
        failover_enabled: bool,
    ) -> Self {
        Self {
            store,
            fraud,
            event_bus,
            breakers,
            providers,
            code_digest_salt,
            otp_ttl,
            failover_enabled,
        }
    }

    /// `dispatch()` per spec §4.6: score, persist, then shadow-simulate or
    /// attempt channels in order. The returned outcome reflects only
    /// admission and the first-attempt result (spec §7): later state
    /// changes surface through webhooks, not this call.
    pub async fn dispatch(&self, input: DispatchInput) -> Result<DispatchOutcome> {
        let fraud_ctx = FraudContext {
            phone: input.phone.clone(),
            ip: input.client_ip,
            phone_country: input.phone_country.clone(),
            channels_requested: input.channels_requested.clone(),
        };
        let fraud_outcome = self.fraud.score(&fraud_ctx).await?;

        let request_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let code_digest = digest_code(&input.code, &self.code_digest_salt);
        let expires_at = now + chrono::Duration::from_std(self.otp_ttl).unwrap_or_default();

        let request = self
            .store
            .otp_requests()
            .create(NewOtpRequest {
                request_id,
                destination: input.phone.clone(),
                phone_prefix: fraud_outcome.phone_prefix.clone(),
                code_digest,
                channels_requested: input.channels_requested.clone(),
                client_ip: input.client_ip.to_string(),
                ip_subnet: fraud_outcome.ip_subnet.clone(),
                asn: fraud_outcome.asn,
                ip_country: fraud_outcome.ip_country.clone(),
                phone_country: input.phone_country.clone(),
                fraud_score: fraud_outcome.score,
                fraud_reasons: fraud_outcome.reasons.clone(),
                shadow_banned: fraud_outcome.shadow,
                webhook_url: input.webhook_url.clone(),
                created_at: now,
                expires_at,
            })
            .await?;

        if fraud_outcome.shadow {
            self.record_fraud_saving(&request).await;
            self.spawn_shadow_ban_simulator(request_id, input.channels_requested.clone());
            let channel = input.channels_requested.first().copied();
            return Ok(DispatchOutcome {
                request_id,
                status: DeliveryStatus::Sending,
                channel,
                error: None,
            });
        }

        self.attempt_channels(request_id, &input.phone, &input.code, &input.channels_requested)
            .await
    }

    async fn attempt_channels(
        &self,
        request_id: Uuid,
        phone: &str,
        code: &str,
        channels: &[Channel],
    ) -> Result<DispatchOutcome> {
        let mut last_error: Option<String> = None;

        for channel in channels {
            let Some(provider) = self.providers.get(channel) else {
                continue;
            };
            if !provider.is_available().await {
                continue;
            }
            if !self.breakers.is_available(&channel_breaker_key(*channel)).await {
                last_error = Some(format!("circuit breaker open for {}", channel.as_str()));
                continue;
            }

            let result = provider.send(phone, code, request_id).await;
            if result.success {
                return Ok(DispatchOutcome {
                    request_id,
                    status: DeliveryStatus::Sending,
                    channel: Some(*channel),
                    error: None,
                });
            }

            last_error = result.error_message.clone();
            if !self.failover_enabled {
                self.store
                    .otp_requests()
                    .force_terminal(request_id, DeliveryStatus::Failed, last_error.as_deref())
                    .await?;
                return Ok(DispatchOutcome {
                    request_id,
                    status: DeliveryStatus::Failed,
                    channel: Some(*channel),
                    error: last_error,
                });
            }
        }

        let error = last_error.unwrap_or_else(|| "All channels failed".to_string());
        self.store
            .otp_requests()
            .force_terminal(request_id, DeliveryStatus::Failed, Some(&error))
            .await?;
        Ok(DispatchOutcome {
            request_id,
            status: DeliveryStatus::Failed,
            channel: None,
            error: Some(error),
        })
    }

    /// Emits a plausible synthetic event sequence for the first requested
    /// channel so a shadow-banned caller sees an indistinguishable response
    /// schema (spec §4.6, §7, §8 "round-trip test on JSON output"). Runs in
    /// the background: the HTTP response never waits on these delays.
    fn spawn_shadow_ban_simulator(&self, request_id: Uuid, channels: Vec<Channel>) {
        let Some(channel) = channels.into_iter().next() else {
            return;
        };
        let event_bus = self.event_bus.clone();
        tokio::spawn(async move {
            let sequence: &[&str] = match channel {
                Channel::Sms => &["sms:sending", "sms:sent", "sms:delivered"],
                Channel::Voice => &[
                    "voice:calling",
                    "voice:ringing",
                    "voice:answered",
                    "voice:playing",
                    "voice:completed",
                ],
            };
            for event_type in sequence {
                let delay_ms = rand::thread_rng().gen_range(150..600);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                event_bus
                    .publish(crate::domain::OtpEvent {
                        request_id,
                        channel,
                        event_type: event_type.to_string(),
                        payload: serde_json::json!({"synthetic": true}),
                        created_at: chrono::Utc::now(),
                    })
                    .await;
            }
        });
    }

    /// Best-effort fraud-savings ledger entry: the estimated per-minute (or
    /// per-message) cost this blocked request would have incurred, priced
    /// off the learned carrier rate for its destination prefix. A missing
    /// rate (no CDRs observed yet for this prefix) simply skips the entry.
    async fn record_fraud_saving(&self, request: &OtpRequest) {
        let Some(channel) = request.channels_requested.first().copied() else {
            return;
        };
        let rate = match self
            .store
            .carrier_rates()
            .find_best_match(channel, &request.phone_prefix, None)
            .await
        {
            Ok(Some(rate)) => rate,
            _ => return,
        };
        let saving = FraudSaving {
            request_id: request.request_id,
            estimated_cost_units: rate.rate_avg,
            created_at: chrono::Utc::now(),
        };
        if let Err(err) = self.store.fraud_savings().record(&saving).await {
            tracing::warn!(request_id = %request.request_id, error = %err, "failed to record fraud saving");
        }
    }
}

fn digest_code(code: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_never_contains_the_plaintext_code() {
        let digest = digest_code("123456", "pepper");
        assert!(!digest.contains("123456"));
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn digest_is_deterministic_for_same_inputs() {
        assert_eq!(digest_code("123456", "pepper"), digest_code("123456", "pepper"));
    }

    #[test]
    fn digest_differs_across_salts() {
        assert_ne!(digest_code("123456", "a"), digest_code("123456", "b"));
    }
}
