//! Voice channel provider (spec §4.5, §6): originates a PJSIP call over the
//! ARI (Asterisk REST Interface) control plane and tracks it in the
//! `CallTracker` so later ARI/AMI events can be attributed back to a
//! request. The SIP media plane and the TTS subprocess are external
//! collaborators (spec Non-goals); this provider only drives the control
//! plane HTTP surface and records lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::call_tracker::{CallTracker, HangupCause};
use crate::caller_id::CallerIdRouter;
use crate::domain::Channel;
use crate::event_bus::EventBus;
use crate::error::Error;

use super::{ChannelProvider, DeliveryResult};

#[derive(Debug, Serialize)]
struct OriginateRequest<'a> {
    endpoint: String,
    app: &'a str,
    #[serde(rename = "callerId")]
    caller_id: &'a str,
    variables: OriginateVariables<'a>,
}

#[derive(Debug, Serialize)]
struct OriginateVariables<'a> {
    #[serde(rename = "CALLERID(num/name)")]
    caller_id_num_name: &'a str,
    #[serde(rename = "PJSIP_HEADER(add,P-Asserted-Identity)")]
    pai_header: String,
    #[serde(rename = "PJSIP_SEND_RPID")]
    send_rpid: &'static str,
    otp_code: &'a str,
}

pub struct VoiceProvider {
    http: reqwest::Client,
    ari_base_url: String,
    ari_username: String,
    ari_password: String,
    ari_app: String,
    trunk_host: String,
    sip_host: String,
    caller_id_router: Arc<CallerIdRouter>,
    call_tracker: Arc<CallTracker>,
    event_bus: Arc<EventBus>,
}

impl VoiceProvider {
    pub fn new(
        ari_base_url: String,
        ari_username: String,
        ari_password: String,
        ari_app: String,
        trunk_host: String,
        sip_host: String,
        timeout: Duration,
        caller_id_router: Arc<CallerIdRouter>,
        call_tracker: Arc<CallTracker>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build voice provider http client");
        Self {
            http,
            ari_base_url,
            ari_username,
            ari_password,
            ari_app,
            trunk_host,
            sip_host,
            caller_id_router,
            call_tracker,
            event_bus,
        }
    }

    async fn emit(&self, request_id: Uuid, event_type: &str, payload: serde_json::Value) {
        self.event_bus
            .publish(crate::domain::OtpEvent {
                request_id,
                channel: Channel::Voice,
                event_type: event_type.to_string(),
                payload,
                created_at: chrono::Utc::now(),
            })
            .await;
    }

    /// Driven by the ARI event listener (external to the core) when the far
    /// end answers. Idempotent with `voice:ringing` de-duplication left to
    /// the state machine's terminal-freeze and same-status rules.
    pub async fn handle_answered(&self, request_id: Uuid) {
        let ring = self.call_tracker.mark_answered(request_id);
        self.emit(
            request_id,
            "voice:answered",
            json!({"ring_duration_ms": ring.map(|d| d.as_millis())}),
        )
        .await;
    }

    pub async fn handle_playing(&self, request_id: Uuid) {
        self.call_tracker.mark_otp_played(request_id);
        self.emit(request_id, "voice:playing", json!({})).await;
    }

    pub async fn handle_completed(&self, request_id: Uuid) {
        self.call_tracker.mark_completed(request_id);
        self.call_tracker.mark_system_hangup(request_id);
        let durations = self.call_tracker.end_call(request_id);
        self.emit(
            request_id,
            "voice:completed",
            json!({
                "talk_duration_ms": durations.map(|d| d.talk_duration.as_millis()),
            }),
        )
        .await;
    }

    /// `q850_cause` carries the ITU disconnect cause for a network-side
    /// failure; `None` for a clean far-end hangup with no OTP played.
    pub async fn handle_failure(&self, request_id: Uuid, event_type: &str, q850_cause: Option<u16>) {
        let durations = self.call_tracker.end_call(request_id);
        let hangup_cause = durations.map(|d| match d.hangup_cause {
            HangupCause::User => "user",
            HangupCause::System => "system",
        });
        self.emit(
            request_id,
            event_type,
            json!({"q850_cause": q850_cause, "hangup_cause": hangup_cause}),
        )
        .await;
    }
}

#[async_trait]
impl ChannelProvider for VoiceProvider {
    fn channel_type(&self) -> Channel {
        Channel::Voice
    }

    async fn send(&self, phone: &str, code: &str, request_id: Uuid) -> DeliveryResult {
        let caller_id = match self.caller_id_router.lookup(Channel::Voice, phone) {
            Ok(cid) => cid,
            Err(err) => {
                self.emit(
                    request_id,
                    "voice:failed",
                    json!({"error": err.to_string(), "error_code": err.code()}),
                )
                .await;
                return DeliveryResult::failed(err.code(), err.to_string());
            }
        };

        self.call_tracker
            .register_call(request_id, Some(caller_id.clone()));
        self.emit(request_id, "voice:calling", json!({"caller_id": caller_id})).await;

        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        let originate = OriginateRequest {
            endpoint: format!("PJSIP/{digits}@{}", self.trunk_host),
            app: &self.ari_app,
            caller_id: &caller_id,
            variables: OriginateVariables {
                caller_id_num_name: &caller_id,
                pai_header: format!("sip:{caller_id}@{}", self.sip_host),
                send_rpid: "send_pai",
                otp_code: code,
            },
        };

        let response = self
            .http
            .post(format!("{}/channels", self.ari_base_url))
            .basic_auth(&self.ari_username, Some(&self.ari_password))
            .json(&originate)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let channel_id = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));
                if let Some(channel_id) = channel_id.clone() {
                    self.call_tracker.set_channel_id(request_id, channel_id);
                }
                self.emit(
                    request_id,
                    "voice:ringing",
                    json!({"channel_id": channel_id}),
                )
                .await;
                DeliveryResult::ok(channel_id.unwrap_or_else(|| request_id.to_string()))
            }
            Ok(resp) if resp.status().as_u16() == 503 => {
                self.call_tracker.end_call(request_id);
                self.emit(
                    request_id,
                    "voice:failed",
                    json!({"error_code": "ARI_DISCONNECTED"}),
                )
                .await;
                DeliveryResult::failed("ARI_DISCONNECTED", Error::AriDisconnected.to_string())
            }
            Ok(resp) => {
                self.call_tracker.end_call(request_id);
                let status = resp.status().as_u16();
                let detail = resp.text().await.unwrap_or_default();
                self.emit(
                    request_id,
                    "voice:failed",
                    json!({"error": detail, "error_code": format!("HTTP_{status}")}),
                )
                .await;
                DeliveryResult::failed(format!("HTTP_{status}"), detail)
            }
            Err(err) => {
                self.call_tracker.end_call(request_id);
                self.emit(
                    request_id,
                    "voice:failed",
                    json!({"error": err.to_string(), "error_code": "NETWORK_ERROR"}),
                )
                .await;
                DeliveryResult::failed("NETWORK_ERROR", err.to_string())
            }
        }
    }

    async fn is_available(&self) -> bool {
        let response = self
            .http
            .get(format!("{}/asterisk/ping", self.ari_base_url))
            .basic_auth(&self.ari_username, Some(&self.ari_password))
            .send()
            .await;
        matches!(response, Ok(resp) if resp.status().is_success())
    }
}
