//! HTTP surface (spec §6): the caller-facing `/send-otp` dispatch endpoint
//! plus the three inbound webhook callbacks. Thin glue in the same shape as
//! `billing::api::rest::create_router` / `voice-switch::routes::create_router`
//! — one `AppState`, one router, handlers that map straight onto the core
//! pieces they front.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::call_tracker::CallTracker;
use crate::config::Config;
use crate::domain::{AuthStatus, CdrRecord, Channel};
use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use crate::orchestrator::{DispatchInput, DispatchOrchestrator};
use crate::providers::VoiceProvider;
use crate::state_machine::StateMachine;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub orchestrator: Arc<DispatchOrchestrator>,
    pub state_machine: Arc<StateMachine>,
    pub event_bus: Arc<EventBus>,
    pub call_tracker: Arc<CallTracker>,
    pub voice_provider: Arc<VoiceProvider>,
    pub config: Arc<Config>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/send-otp", post(send_otp))
        .route("/webhooks/auth", post(webhooks_auth))
        .route("/webhooks/dlr", post(webhooks_dlr))
        .route("/webhooks/cdr", post(webhooks_cdr))
        .route("/webhooks/ari", post(webhooks_ari))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.store.pool().get().await.is_ok();
    Json(serde_json::json!({"ready": db_ok, "database": db_ok}))
}

fn validate_e164(phone: &str) -> std::result::Result<(), ValidationError> {
    let digits_ok = phone
        .strip_prefix('+')
        .map_or(false, |rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
    if digits_ok && phone.len() <= 16 {
        Ok(())
    } else {
        Err(ValidationError::new("not_e164"))
    }
}

fn validate_otp_code(code: &str) -> std::result::Result<(), ValidationError> {
    if (4..=8).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::new("not_numeric_4_to_8"))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendOtpRequest {
    #[validate(custom(function = "validate_e164"))]
    pub phone: String,
    #[validate(custom(function = "validate_otp_code"))]
    pub code: String,
    pub secret: Option<String>,
    pub session_id: Option<String>,
    pub phone_country: Option<String>,
    pub channels: Option<Vec<String>>,
    #[validate(url)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendOtpResponse {
    status: &'static str,
    request_id: Uuid,
    phone: String,
    channel: Option<Channel>,
}

/// `POST /send-otp` (spec §6): shared-secret auth, validate shape, dispatch.
/// A shadow-banned or successfully-attempted request both answer `202
/// dispatched` — the caller must not be able to tell them apart.
async fn send_otp(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<SendOtpRequest>,
) -> Result<(StatusCode, Json<SendOtpResponse>)> {
    body.validate()
        .map_err(|err| Error::Validation(err.to_string()))?;

    let header_secret = headers
        .get("x-api-secret")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let presented = body.secret.clone().or(header_secret);
    if presented.as_deref() != Some(state.config.api_secret.as_str()) {
        return Err(Error::Forbidden);
    }

    let channels = parse_channels(body.channels.as_deref())?;
    let client_ip = client_ip_of(&headers, peer.ip());

    let outcome = state
        .orchestrator
        .dispatch(DispatchInput {
            phone: body.phone.clone(),
            code: body.code.clone(),
            client_ip,
            phone_country: body.phone_country.clone(),
            channels_requested: channels,
            webhook_url: body.webhook_url.clone(),
        })
        .await?;

    if outcome.status.is_terminal() {
        return Err(Error::ServiceUnavailable(
            outcome.error.unwrap_or_else(|| "no channel available".to_string()),
        ));
    }

    let response = SendOtpResponse {
        status: "dispatched",
        request_id: outcome.request_id,
        phone: body.phone,
        channel: outcome.channel,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

fn parse_channels(requested: Option<&[String]>) -> Result<Vec<Channel>> {
    let Some(requested) = requested else {
        return Ok(vec![Channel::Sms]);
    };
    if requested.is_empty() {
        return Err(Error::Validation("channels must not be empty".to_string()));
    }
    requested
        .iter()
        .map(|c| c.parse::<Channel>().map_err(Error::Validation))
        .collect()
}

/// The public-facing client IP: `X-Forwarded-For`'s first hop when present
/// (this service sits behind a load balancer in production), else the raw
/// peer address.
fn client_ip_of(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

#[derive(Debug, Deserialize)]
struct AuthWebhookBody {
    request_id: Uuid,
    success: bool,
}

/// `POST /webhooks/auth` (spec §6): upstream authenticator reports whether
/// the end user entered the code correctly.
async fn webhooks_auth(
    State(state): State<AppState>,
    Json(body): Json<AuthWebhookBody>,
) -> Result<StatusCode> {
    let outcome = if body.success {
        AuthStatus::Verified
    } else {
        AuthStatus::WrongCode
    };
    state.state_machine.apply_auth_feedback(body.request_id, outcome).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct DlrBody {
    data: DlrData,
}

#[derive(Debug, Deserialize)]
struct DlrData {
    id: String,
    attributes: DlrAttributes,
}

#[derive(Debug, Deserialize)]
struct DlrAttributes {
    status: String,
    error_code: Option<String>,
    error_message: Option<String>,
}

/// `POST /webhooks/dlr` (spec §6): carrier delivery-report callback,
/// correlated back to a request by the provider-id recorded on send. Always
/// acknowledges `200`, even when the body can't be parsed or no matching
/// request is found — the carrier has no use for a 4xx/5xx here and will
/// just keep retrying.
async fn webhooks_dlr(State(state): State<AppState>, body: axum::body::Bytes) -> StatusCode {
    let Ok(parsed) = serde_json::from_slice::<DlrBody>(&body) else {
        tracing::warn!("unparseable dlr webhook body");
        return StatusCode::OK;
    };

    let request = match state
        .store
        .otp_requests()
        .find_by_provider_external_id(&parsed.data.id)
        .await
    {
        Ok(Some(request)) => request,
        Ok(None) => {
            tracing::warn!(provider_id = %parsed.data.id, "dlr for unknown request");
            return StatusCode::OK;
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to look up request for dlr");
            return StatusCode::OK;
        }
    };

    let event_type = match parsed.data.attributes.status.as_str() {
        "delivered" => "sms:delivered",
        _ => "sms:undelivered",
    };
    let payload = serde_json::json!({
        "provider_id": parsed.data.id,
        "error": parsed.data.attributes.error_message,
        "error_code": parsed.data.attributes.error_code,
    });

    let event = crate::domain::OtpEvent {
        request_id: request.request_id,
        channel: Channel::Sms,
        event_type: event_type.to_string(),
        payload,
        created_at: chrono::Utc::now(),
    };
    state.event_bus.publish(event).await;

    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct AriEventBody {
    #[serde(rename = "type")]
    event_type: String,
    channel: Option<AriChannel>,
    cause: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct AriChannel {
    id: String,
    state: Option<String>,
}

/// `POST /webhooks/ari` (spec §4.5): the Asterisk control plane's call-
/// progress events, correlated back to a request via `CallTracker`'s
/// channel-id index. Drives the lifecycle `voice:answered` -> `voice:
/// playing` -> `voice:completed`/`voice:hangup` that the gateway, not
/// Asterisk, is responsible for recording (spec §4.5 C5). Always
/// acknowledges `200` like the other carrier-facing webhooks: a bad or
/// untracked event has nothing useful to reject it with.
async fn webhooks_ari(State(state): State<AppState>, body: axum::body::Bytes) -> StatusCode {
    let Ok(parsed) = serde_json::from_slice::<AriEventBody>(&body) else {
        tracing::warn!("unparseable ari event body");
        return StatusCode::OK;
    };
    let Some(channel) = parsed.channel else {
        return StatusCode::OK;
    };
    let Some(request_id) = state.call_tracker.find_by_channel_id(&channel.id) else {
        tracing::debug!(channel_id = %channel.id, "ari event for untracked channel");
        return StatusCode::OK;
    };

    match parsed.event_type.as_str() {
        "ChannelStateChange" if channel.state.as_deref() == Some("Up") => {
            state.voice_provider.handle_answered(request_id).await;
        }
        "PlaybackStarted" => {
            state.voice_provider.handle_playing(request_id).await;
        }
        "StasisEnd" => {
            let otp_played = state
                .call_tracker
                .get(request_id)
                .map(|call| call.otp_played)
                .unwrap_or(false);
            if otp_played {
                state.voice_provider.handle_completed(request_id).await;
            } else {
                state
                    .voice_provider
                    .handle_failure(request_id, "voice:hangup", parsed.cause)
                    .await;
            }
        }
        _ => {}
    }

    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct CdrBatchItem {
    channel: String,
    source: String,
    destination: String,
    duration_seconds: u32,
    billing_duration_seconds: u32,
    price_units: i64,
    success: bool,
    disconnect_code: Option<String>,
}

/// `POST /webhooks/cdr` (spec §6): bulk-inserts carrier CDRs, accepted as
/// either a JSON array or newline-delimited JSON objects.
async fn webhooks_cdr(State(state): State<AppState>, body: String) -> StatusCode {
    let trimmed = body.trim();
    let items: Vec<CdrBatchItem> = if trimmed.starts_with('[') {
        match serde_json::from_str(trimmed) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable cdr batch");
                return StatusCode::OK;
            }
        }
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    };

    for item in items {
        let Ok(channel) = item.channel.parse::<Channel>() else {
            continue;
        };
        let record = CdrRecord {
            id: Uuid::new_v4(),
            channel,
            source: item.source,
            destination: item.destination.clone(),
            dst_prefix: crate::fraud::phone_prefix_of(&item.destination),
            src_prefix: None,
            duration_seconds: item.duration_seconds,
            billing_duration_seconds: item.billing_duration_seconds,
            price_units: item.price_units,
            success: item.success,
            disconnect_code: item.disconnect_code,
            processed_for_rates: false,
            created_at: chrono::Utc::now(),
        };
        if let Err(err) = state.store.cdrs().insert(&record).await {
            tracing::warn!(error = %err, "failed to insert cdr record");
        }
    }

    StatusCode::OK
}
