//! Status state machine (spec §4.8 C8): folds channel events into the
//! authoritative `(delivery_status, auth_status)` pair, enforcing the legal
//! transition table and freezing terminal requests.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerManager;
use crate::domain::{AuthStatus, Channel, DeliveryStatus, OtpEvent, OtpRequest, WebhookPayload};
use crate::error::Result;
use crate::store::Store;
use crate::webhook::WebhookService;

/// Maps a raw channel event type to the delivery status it would establish,
/// per the exhaustive table in spec §4.8. Unknown event types map to
/// `None` and are ignored.
pub fn candidate_status(event_type: &str) -> Option<DeliveryStatus> {
    match event_type {
        "sms:queued" | "voice:queued" => Some(DeliveryStatus::Pending),
        "sms:sending" | "voice:calling" => Some(DeliveryStatus::Sending),
        "sms:sent" | "voice:ringing" | "voice:answered" | "voice:playing" => {
            Some(DeliveryStatus::Sent)
        }
        "sms:delivered" | "voice:completed" => Some(DeliveryStatus::Delivered),
        "sms:failed" | "sms:undelivered" | "voice:failed" | "voice:no_answer" | "voice:busy"
        | "voice:hangup" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

/// Whether `from -> to` is a legal delivery-status transition. Same-status
/// is always legal (idempotent replay); regressions are not.
pub fn is_legal_transition(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    if from == to {
        return true;
    }
    use DeliveryStatus::*;
    matches!(
        (from, to),
        (Pending, Sending) | (Pending, Failed) | (Pending, Expired)
            | (Sending, Sent) | (Sending, Failed) | (Sending, Expired)
            | (Sent, Delivered) | (Sent, Failed) | (Sent, Expired)
            | (Delivered, Verified) | (Delivered, Rejected) | (Delivered, Expired)
    )
}

pub struct StateMachine {
    store: Arc<Store>,
    webhook: Arc<WebhookService>,
    breakers: Arc<CircuitBreakerManager>,
}

impl StateMachine {
    pub fn new(store: Arc<Store>, webhook: Arc<WebhookService>, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self { store, webhook, breakers }
    }

    /// Apply one channel event to its request's projection. No-ops (with a
    /// warning log) for unknown event types, illegal transitions, and
    /// events for already-terminal or missing requests.
    pub async fn apply(&self, event: &OtpEvent) -> Result<()> {
        let Some(candidate) = candidate_status(&event.event_type) else {
            warn!(event_type = %event.event_type, "ignoring unrecognized event type");
            return Ok(());
        };

        let Some(request) = self.store.otp_requests().find_by_id(event.request_id).await? else {
            warn!(request_id = %event.request_id, "event for unknown request");
            return Ok(());
        };

        if request.status.is_terminal() {
            warn!(request_id = %event.request_id, status = ?request.status, "dropping event on terminal request");
            return Ok(());
        }

        if !is_legal_transition(request.status, candidate) {
            warn!(
                request_id = %event.request_id,
                from = ?request.status,
                to = ?candidate,
                "dropping illegal transition"
            );
            return Ok(());
        }

        if candidate == request.status {
            return Ok(());
        }

        let error_message = if candidate == DeliveryStatus::Failed {
            event
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        } else {
            None
        };

        // Provider/channel ids surface under different keys depending on
        // which provider emitted the event (`sms:sent`'s carrier message id
        // vs `voice:ringing`'s ARI channel id); either is "the provider's
        // handle for this attempt" from the request's point of view.
        let provider_external_id = event
            .payload
            .get("provider_id")
            .or_else(|| event.payload.get("channel_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let updated = self
            .store
            .otp_requests()
            .transition(
                event.request_id,
                request.status,
                candidate,
                Some(event.channel),
                provider_external_id.as_deref(),
                error_message.as_deref(),
            )
            .await?;

        if !updated {
            warn!(request_id = %event.request_id, "transition raced away by concurrent writer");
            return Ok(());
        }

        if candidate == DeliveryStatus::Failed {
            let key = crate::orchestrator::channel_breaker_key(event.channel);
            self.breakers.record_failure(&key).await;
        } else if matches!(candidate, DeliveryStatus::Sent | DeliveryStatus::Delivered) {
            let key = crate::orchestrator::channel_breaker_key(event.channel);
            self.breakers.record_success(&key).await;
        }

        self.notify_webhook(event.request_id, &request, candidate, Some(event.channel))
            .await;

        Ok(())
    }

    /// Auth feedback: `delivered -> verified|wrong_code`, exactly once.
    /// Updates reputation and, on repeated abuse, the IP ban.
    pub async fn apply_auth_feedback(&self, request_id: Uuid, outcome: AuthStatus) -> Result<()> {
        let Some(request) = self.store.otp_requests().find_by_id(request_id).await? else {
            return Err(crate::error::Error::NotFound(request_id.to_string()));
        };

        let combined = match outcome {
            AuthStatus::Verified => DeliveryStatus::Verified,
            AuthStatus::WrongCode => DeliveryStatus::Rejected,
        };

        let updated = self
            .store
            .otp_requests()
            .apply_auth_feedback(request_id, outcome, combined)
            .await?;

        if !updated {
            return Ok(());
        }

        match outcome {
            AuthStatus::Verified => {
                self.store.ip_reputation().record_verified(&request.ip_subnet).await?;
                self.store.prefix_reputation().record_verified(&request.phone_prefix).await?;
            }
            AuthStatus::WrongCode => {
                self.store.ip_reputation().record_failed(&request.ip_subnet).await?;
                self.store.prefix_reputation().record_failed(&request.phone_prefix).await?;

                if let Some(ip_rep) = self.store.ip_reputation().find(&request.ip_subnet).await? {
                    if ip_rep.total >= 10 && ip_rep.trust_score() < 0.05 {
                        self.store
                            .ip_reputation()
                            .ban(&request.ip_subnet, "repeated wrong-code abuse")
                            .await?;
                    }
                }
            }
        }

        self.notify_webhook(request_id, &request, combined, request.chosen_channel)
            .await;
        Ok(())
    }

    /// Periodic sweep: flip any non-terminal, past-TTL request to `expired`.
    pub async fn expire_due(&self) -> Result<usize> {
        let now = Utc::now();
        let expired_ids = self.store.otp_requests().expire_due(now).await?;
        for id in &expired_ids {
            if let Some(request) = self.store.otp_requests().find_by_id(*id).await? {
                self.notify_webhook(*id, &request, DeliveryStatus::Expired, request.chosen_channel)
                    .await;
            }
        }
        Ok(expired_ids.len())
    }

    async fn notify_webhook(
        &self,
        request_id: Uuid,
        request: &OtpRequest,
        status: DeliveryStatus,
        channel: Option<Channel>,
    ) {
        let Some(url) = request.webhook_url.clone() else {
            return;
        };
        let payload = WebhookPayload {
            event: format!("otp.{}", status_event_name(status)),
            request_id,
            session_id: None,
            phone: request.destination.clone(),
            status,
            channel,
            timestamp: Utc::now().timestamp_millis(),
            metadata: None,
        };
        self.webhook.enqueue(url, payload).await;
    }
}

fn status_event_name(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Sending => "sending",
        DeliveryStatus::Sent => "sent",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Failed => "failed",
        DeliveryStatus::Verified => "verified",
        DeliveryStatus::Rejected => "rejected",
        DeliveryStatus::Expired => "expired",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_taxonomy_maps_exhaustively() {
        assert_eq!(candidate_status("sms:queued"), Some(DeliveryStatus::Pending));
        assert_eq!(candidate_status("voice:calling"), Some(DeliveryStatus::Sending));
        assert_eq!(candidate_status("voice:answered"), Some(DeliveryStatus::Sent));
        assert_eq!(candidate_status("voice:completed"), Some(DeliveryStatus::Delivered));
        assert_eq!(candidate_status("voice:hangup"), Some(DeliveryStatus::Failed));
        assert_eq!(candidate_status("sms:undelivered"), Some(DeliveryStatus::Failed));
        assert_eq!(candidate_status("unknown:event"), None);
    }

    #[test]
    fn legal_transition_table_matches_spec() {
        use DeliveryStatus::*;
        assert!(is_legal_transition(Pending, Sending));
        assert!(is_legal_transition(Sending, Sent));
        assert!(is_legal_transition(Sent, Delivered));
        assert!(is_legal_transition(Delivered, Verified));
        assert!(is_legal_transition(Delivered, Rejected));
        assert!(!is_legal_transition(Sent, Pending));
        assert!(!is_legal_transition(Failed, Pending));
        assert!(!is_legal_transition(Delivered, Sending));
    }

    #[test]
    fn same_status_is_idempotent() {
        assert!(is_legal_transition(DeliveryStatus::Sent, DeliveryStatus::Sent));
    }

    #[test]
    fn terminal_statuses_accept_nothing_new() {
        use DeliveryStatus::*;
        for terminal in [Failed, Verified, Rejected, Expired] {
            for to in [Pending, Sending, Sent, Delivered] {
                assert!(!is_legal_transition(terminal, to));
            }
        }
    }
}
