//! Webhook delivery subsystem (spec §4.9 C9): at-least-once delivery with
//! retry, exponential backoff and jitter, and strict per-request ordering.
//!
//! Retry/backoff/jitter is grounded on the dispatch loop in
//! `svix-webhooks`' worker (`other_examples/.../worker.rs`): a capped
//! exponential schedule with a ±20% jitter window so a thundering herd of
//! retries doesn't resynchronize. Per-request ordering is kept by draining
//! one small in-memory queue per `request_id` with at most one active
//! drainer at a time; a full queue drops its oldest entry, matching the
//! bus-wide "bounded, drop oldest" back-pressure policy (spec §4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

use crate::domain::WebhookLog;
use crate::store::Store;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 4;
const JITTER_DELTA: f32 = 0.2;
const MAX_QUEUE_DEPTH: usize = 50;

struct RequestQueue {
    pending: Mutex<VecDeque<(String, crate::domain::WebhookPayload)>>,
    draining: AtomicBool,
}

pub struct WebhookService {
    store: Arc<Store>,
    http: reqwest::Client,
    queues: Arc<DashMap<Uuid, Arc<RequestQueue>>>,
}

impl WebhookService {
    pub fn new(store: Arc<Store>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build webhook http client");
        Self {
            store,
            http,
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Enqueue a payload for asynchronous delivery; returns immediately.
    pub async fn enqueue(&self, url: String, payload: crate::domain::WebhookPayload) {
        let request_id = payload.request_id;
        let queue = self
            .queues
            .entry(request_id)
            .or_insert_with(|| {
                Arc::new(RequestQueue {
                    pending: Mutex::new(VecDeque::new()),
                    draining: AtomicBool::new(false),
                })
            })
            .clone();

        {
            let mut pending = queue.pending.lock();
            if pending.len() >= MAX_QUEUE_DEPTH {
                pending.pop_front();
                tracing::warn!(request_id = %request_id, "webhook queue full, dropped oldest payload");
            }
            pending.push_back((url, payload));
        }

        if queue
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let store = self.store.clone();
            let http = self.http.clone();
            tokio::spawn(drain(store, http, queue));
        }
    }

    pub async fn was_delivered(&self, request_id: Uuid) -> crate::error::Result<bool> {
        self.store.webhook_logs().was_delivered(request_id).await
    }

    /// Startup recovery: re-synthesize a payload from the current request
    /// state for any request whose webhook logs show incomplete delivery
    /// (spec §4.9's "delivery survives a restart" — `WebhookLog` itself has
    /// no payload column, so the current row is the best available source).
    pub async fn recover_pending(&self) -> crate::error::Result<usize> {
        let ids = self.store.webhook_logs().list_unterminated(MAX_ATTEMPTS).await?;
        let mut recovered = 0;
        for id in ids {
            let Some(request) = self.store.otp_requests().find_by_id(id).await? else {
                continue;
            };
            let Some(url) = request.webhook_url.clone() else {
                continue;
            };
            let payload = crate::domain::WebhookPayload {
                event: format!("otp.{}", status_event_name(request.status)),
                request_id: id,
                session_id: None,
                phone: request.destination.clone(),
                status: request.status,
                channel: request.chosen_channel,
                timestamp: chrono::Utc::now().timestamp_millis(),
                metadata: None,
            };
            self.enqueue(url, payload).await;
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn status_event_name(status: crate::domain::DeliveryStatus) -> &'static str {
    use crate::domain::DeliveryStatus::*;
    match status {
        Pending => "pending",
        Sending => "sending",
        Sent => "sent",
        Delivered => "delivered",
        Failed => "failed",
        Verified => "verified",
        Rejected => "rejected",
        Expired => "expired",
    }
}

async fn drain(store: Arc<Store>, http: reqwest::Client, queue: Arc<RequestQueue>) {
    loop {
        let next = queue.pending.lock().pop_front();
        let Some((url, payload)) = next else {
            queue.draining.store(false, Ordering::SeqCst);
            return;
        };
        deliver_with_retry(&store, &http, &url, &payload).await;
    }
}

async fn deliver_with_retry(
    store: &Arc<Store>,
    http: &reqwest::Client,
    url: &str,
    payload: &crate::domain::WebhookPayload,
) {
    for attempt in 1..=MAX_ATTEMPTS {
        let outcome = http.post(url).json(payload).send().await;

        let (status_code, error) = match &outcome {
            Ok(resp) => (Some(resp.status().as_u16()), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let success = status_code.map(|c| (200..300).contains(&c)).unwrap_or(false);

        let log = WebhookLog {
            request_id: payload.request_id,
            url: url.to_string(),
            attempt,
            status_code,
            error: error.clone(),
            sent_at: chrono::Utc::now(),
        };
        if let Err(err) = store.webhook_logs().record(&log).await {
            tracing::warn!(request_id = %payload.request_id, error = %err, "failed to record webhook attempt");
        }

        if success {
            return;
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(backoff_with_jitter(attempt)).await;
        } else {
            tracing::warn!(
                request_id = %payload.request_id,
                url,
                "webhook delivery exhausted all attempts"
            );
        }
    }
}

/// `BASE_DELAY * BACKOFF_FACTOR^(attempt-1)` (1s, 4s, 16s, 64s, 256s),
/// jittered by ±`JITTER_DELTA` so concurrent retriers don't resynchronize.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base = BASE_DELAY.saturating_mul(BACKOFF_FACTOR.saturating_pow(exponent));
    let lower = base.mul_f32(1.0 - JITTER_DELTA);
    let upper = base.mul_f32(1.0 + JITTER_DELTA);
    rand::thread_rng().gen_range(lower..upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_within_jitter_band() {
        let first = backoff_with_jitter(1);
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));

        let third = backoff_with_jitter(3);
        assert!(third >= Duration::from_secs(12) && third <= Duration::from_secs(20));
    }

    #[test]
    fn backoff_is_monotonically_increasing_in_expectation() {
        let early = BASE_DELAY.saturating_mul(BACKOFF_FACTOR.saturating_pow(0));
        let later = BASE_DELAY.saturating_mul(BACKOFF_FACTOR.saturating_pow(3));
        assert!(later > early);
    }
}
