//! In-process publish/subscribe event bus (spec §4.2 C2).
//!
//! Per-`request_id` ordering is preserved by hashing the id onto a fixed
//! pool of single-consumer worker queues: all events for one request always
//! land on the same worker, so that worker's sequential processing gives
//! per-request FIFO delivery to the state machine while different requests
//! are handled by different workers concurrently. Cross-request ordering is
//! explicitly not guaranteed (spec §4.2).
//!
//! The live feed and the webhook service subscribe via `tokio::broadcast`,
//! whose lagged-receiver semantics are exactly the "bounded queue, drop
//! oldest on overflow" back-pressure policy the spec asks for — a slow
//! subscriber skips forward instead of blocking the bus.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use crate::domain::OtpEvent;
use crate::state_machine::StateMachine;
use crate::store::Store;

const WORKER_QUEUE_DEPTH: usize = 256;
const LIVE_FEED_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    workers: Arc<Vec<mpsc::Sender<OtpEvent>>>,
    live_feed: broadcast::Sender<OtpEvent>,
}

impl EventBus {
    /// Spawns `worker_count` persistent tasks, each owning one queue and
    /// applying events to the state machine in receipt order.
    pub fn start(worker_count: usize, store: Arc<Store>, state_machine: Arc<StateMachine>) -> Self {
        let worker_count = worker_count.max(1);
        let (live_feed, _) = broadcast::channel(LIVE_FEED_CAPACITY);

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<OtpEvent>(WORKER_QUEUE_DEPTH);
            let store = store.clone();
            let state_machine = state_machine.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(err) = store.otp_events().append(&event).await {
                        warn!(worker_id, request_id = %event.request_id, error = %err, "failed to persist event");
                    }
                    if let Err(err) = state_machine.apply(&event).await {
                        warn!(worker_id, request_id = %event.request_id, error = %err, "state machine rejected event");
                    }
                }
            });
            workers.push(tx);
        }

        Self {
            workers: Arc::new(workers),
            live_feed,
        }
    }

    /// Hand the event to its worker (per-request ordered) and fan it out to
    /// any live-feed/webhook subscribers (best-effort, lossy).
    pub async fn publish(&self, event: OtpEvent) {
        let worker = &self.workers[worker_index(event.request_id, self.workers.len())];
        let _ = self.live_feed.send(event.clone());
        if let Err(err) = worker.send(event).await {
            warn!(error = %err, "event bus worker queue closed");
        }
    }

    pub fn subscribe_live_feed(&self) -> broadcast::Receiver<OtpEvent> {
        self.live_feed.subscribe()
    }
}

fn worker_index(request_id: Uuid, worker_count: usize) -> usize {
    let bytes = request_id.as_bytes();
    let hash = bytes.iter().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64));
    (hash as usize) % worker_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_request_id_always_hashes_to_same_worker() {
        let id = Uuid::new_v4();
        let a = worker_index(id, 8);
        let b = worker_index(id, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn worker_index_is_in_range() {
        for _ in 0..100 {
            let id = Uuid::new_v4();
            assert!(worker_index(id, 5) < 5);
        }
    }
}
