//! OTP Gateway
//!
//! Fraud-aware, multi-channel (SMS/voice) one-time-password delivery:
//! - Fraud/admission pipeline with whitelist, hard blockers and weighted
//!   soft signals
//! - Channel-selection and failover orchestration with circuit breakers
//! - Status lifecycle state machine fed by an in-process event bus
//! - At-least-once webhook delivery with backoff and strict per-request
//!   ordering
//! - CDR-driven carrier rate learning

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use brivas_core::{BrivasService, HealthStatus, MicroserviceRuntime, ReadinessStatus, Result};
use tracing::info;

mod call_tracker;
mod caller_id;
mod circuit_breaker;
mod config;
mod domain;
mod error;
mod event_bus;
mod fraud;
mod http;
mod orchestrator;
mod providers;
mod rate_learning;
mod state_machine;
mod store;
mod webhook;

use call_tracker::CallTracker;
use caller_id::CallerIdRouter;
use circuit_breaker::CircuitBreakerManager;
use config::Config;
use event_bus::EventBus;
use fraud::{FraudEngine, NullAsnResolver};
use orchestrator::DispatchOrchestrator;
use providers::{ChannelProvider, SmsProvider, VoiceProvider};
use rate_learning::RateLearningService;
use state_machine::StateMachine;
use store::Store;
use webhook::WebhookService;

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;
const CIRCUIT_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUS_WORKERS: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = brivas_telemetry::init("otp-gateway")
        .map_err(|e| brivas_core::BrivasError::Config(e.to_string()))?;

    info!("Starting OTP Gateway");

    let service = Arc::new(OtpGatewayService::new().await?);
    MicroserviceRuntime::run(service).await
}

pub struct OtpGatewayService {
    config: Arc<Config>,
    store: Arc<Store>,
    orchestrator: Arc<DispatchOrchestrator>,
    state_machine: Arc<StateMachine>,
    event_bus: Arc<EventBus>,
    webhook: Arc<WebhookService>,
    caller_id_router: Arc<CallerIdRouter>,
    call_tracker: Arc<CallTracker>,
    voice_provider: Arc<VoiceProvider>,
    breakers: Arc<CircuitBreakerManager>,
    rate_learning: Arc<RateLearningService>,
    start_time: std::time::Instant,
}

impl OtpGatewayService {
    pub async fn new() -> Result<Self> {
        let config = Arc::new(
            Config::from_env().map_err(|e| brivas_core::BrivasError::Config(e.to_string()))?,
        );

        let pool = brivas_lumadb::LumaDbPool::new(brivas_lumadb::PoolConfig {
            url: config.database_url.clone(),
            ..Default::default()
        })
        .await
        .map_err(|e| brivas_core::BrivasError::Database(e.to_string()))?;
        let store = Arc::new(Store::new(pool));

        let breakers = Arc::new(CircuitBreakerManager::new(
            CIRCUIT_FAILURE_THRESHOLD,
            CIRCUIT_SUCCESS_THRESHOLD,
            CIRCUIT_TIMEOUT,
        ));
        restore_circuit_breakers(&store, &breakers).await;
        breakers.attach_store(store.clone()).await;

        let caller_id_router = Arc::new(CallerIdRouter::new(store.clone()));
        caller_id_router
            .reload()
            .await
            .map_err(|e| brivas_core::BrivasError::Database(e.to_string()))?;

        let call_tracker = Arc::new(CallTracker::new());

        let fraud = Arc::new(FraudEngine::new(
            store.clone(),
            breakers.clone(),
            Arc::new(NullAsnResolver),
            &config,
        ));

        let webhook = Arc::new(WebhookService::new(store.clone(), config.webhook_timeout));
        let state_machine = Arc::new(StateMachine::new(store.clone(), webhook.clone(), breakers.clone()));

        let event_bus = Arc::new(EventBus::start(EVENT_BUS_WORKERS, store.clone(), state_machine.clone()));

        let sms_provider: Arc<dyn ChannelProvider> = Arc::new(SmsProvider::new(
            config.sms_api_base_url.clone(),
            config.sms_api_username.clone(),
            config.sms_api_password.clone(),
            Some(format!("{}/webhooks/dlr", config.public_base_url)),
            config.provider_timeout,
            caller_id_router.clone(),
            event_bus.clone(),
        ));
        let voice_provider = Arc::new(VoiceProvider::new(
            config.ari_base_url.clone(),
            config.ari_username.clone(),
            config.ari_password.clone(),
            config.ari_app.clone(),
            config.sip_trunk_host.clone(),
            config.sip_public_ip.clone(),
            config.provider_timeout,
            caller_id_router.clone(),
            call_tracker.clone(),
            event_bus.clone(),
        ));

        let mut providers: std::collections::HashMap<domain::Channel, Arc<dyn ChannelProvider>> =
            std::collections::HashMap::new();
        providers.insert(domain::Channel::Sms, sms_provider);
        providers.insert(domain::Channel::Voice, voice_provider.clone());

        let orchestrator = Arc::new(DispatchOrchestrator::new(
            store.clone(),
            fraud,
            event_bus.clone(),
            breakers.clone(),
            providers,
            config.code_digest_salt.clone(),
            config.otp_ttl,
            true,
        ));

        let rate_learning = Arc::new(RateLearningService::new(
            store.clone(),
            config.rate_learning_batch_size,
        ));

        if let Err(err) = webhook.recover_pending().await {
            tracing::warn!(error = %err, "failed to recover pending webhooks at startup");
        }

        Ok(Self {
            config,
            store,
            orchestrator,
            state_machine,
            event_bus,
            webhook,
            caller_id_router,
            call_tracker,
            voice_provider,
            breakers,
            rate_learning,
            start_time: std::time::Instant::now(),
        })
    }
}

async fn restore_circuit_breakers(store: &Arc<Store>, breakers: &Arc<CircuitBreakerManager>) {
    match store.circuit_breakers().list_all().await {
        Ok(snapshots) => {
            for snapshot in snapshots {
                let was_open = snapshot.state == "open";
                breakers
                    .restore(&snapshot.key, snapshot.failure_count, snapshot.success_count, was_open)
                    .await;
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to restore circuit breaker snapshots");
        }
    }
}

#[async_trait::async_trait]
impl BrivasService for OtpGatewayService {
    fn service_id(&self) -> &'static str {
        "otp-gateway"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let db_ok = self.store.pool().get().await.is_ok();
        ReadinessStatus {
            ready: db_ok,
            dependencies: vec![brivas_core::DependencyStatus {
                name: "lumadb".to_string(),
                available: db_ok,
                latency_ms: None,
            }],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down OTP Gateway");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let state_machine = self.state_machine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if let Err(err) = state_machine.expire_due().await {
                    tracing::warn!(error = %err, "expiry sweep failed");
                }
            }
        });

        self.rate_learning.clone().spawn(self.config.rate_learning_interval);

        let router = http::create_router(http::AppState {
            store: self.store.clone(),
            orchestrator: self.orchestrator.clone(),
            state_machine: self.state_machine.clone(),
            event_bus: self.event_bus.clone(),
            call_tracker: self.call_tracker.clone(),
            voice_provider: self.voice_provider.clone(),
            config: self.config.clone(),
        });

        let addr = self.config.bind_address();
        info!(%addr, "Starting OTP Gateway HTTP server");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| brivas_core::BrivasError::Network(e.to_string()))?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| brivas_core::BrivasError::Network(e.to_string()))?;

        Ok(())
    }
}
