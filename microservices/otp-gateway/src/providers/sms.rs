//! SMS channel provider (spec §4.5, §6): delivers the code over the
//! carrier's JSON:API, Basic-authenticated, the same
//! `reqwest::Client`-once / `.timeout(..)`-per-call shape `webhook.rs` and
//! `voice-switch::carrier` use for outbound HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::caller_id::CallerIdRouter;
use crate::domain::Channel;
use crate::event_bus::EventBus;

use super::{ChannelProvider, DeliveryResult};

const TEMPLATE: &str = "Your verification code is {code}. It expires in 10 minutes.";

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    data: MessageData,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    data: CreateMessageBody<'a>,
}

#[derive(Debug, Serialize)]
struct CreateMessageBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    attributes: CreateMessageAttributes<'a>,
}

#[derive(Debug, Serialize)]
struct CreateMessageAttributes<'a> {
    destination: &'a str,
    source: &'a str,
    content: String,
    callback_url: Option<&'a str>,
}

pub struct SmsProvider {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    dlr_callback_url: Option<String>,
    caller_id_router: Arc<CallerIdRouter>,
    event_bus: Arc<EventBus>,
}

impl SmsProvider {
    pub fn new(
        base_url: String,
        username: String,
        password: String,
        dlr_callback_url: Option<String>,
        timeout: Duration,
        caller_id_router: Arc<CallerIdRouter>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build sms provider http client");
        Self {
            http,
            base_url,
            username,
            password,
            dlr_callback_url,
            caller_id_router,
            event_bus,
        }
    }

    async fn emit(&self, request_id: Uuid, event_type: &str, payload: serde_json::Value) {
        self.event_bus
            .publish(crate::domain::OtpEvent {
                request_id,
                channel: Channel::Sms,
                event_type: event_type.to_string(),
                payload,
                created_at: chrono::Utc::now(),
            })
            .await;
    }
}

#[async_trait]
impl ChannelProvider for SmsProvider {
    fn channel_type(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, phone: &str, code: &str, request_id: Uuid) -> DeliveryResult {
        let source = match self.caller_id_router.lookup(Channel::Sms, phone) {
            Ok(cid) => cid,
            Err(err) => {
                self.emit(
                    request_id,
                    "sms:failed",
                    json!({"error": err.to_string(), "error_code": err.code()}),
                )
                .await;
                return DeliveryResult::failed(err.code(), err.to_string());
            }
        };

        self.emit(request_id, "sms:sending", json!({"source": source})).await;

        let content = TEMPLATE.replace("{code}", code);
        let body = CreateMessageRequest {
            data: CreateMessageBody {
                kind: "outbound_messages",
                attributes: CreateMessageAttributes {
                    destination: phone,
                    source: &source,
                    content,
                    callback_url: self.dlr_callback_url.as_deref(),
                },
            },
        };

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<CreateMessageResponse>().await {
                    Ok(parsed) => {
                        self.emit(
                            request_id,
                            "sms:sent",
                            json!({"provider_id": parsed.data.id}),
                        )
                        .await;
                        DeliveryResult::ok(parsed.data.id)
                    }
                    Err(err) => {
                        self.emit(
                            request_id,
                            "sms:failed",
                            json!({"error": err.to_string(), "error_code": "NETWORK_ERROR"}),
                        )
                        .await;
                        DeliveryResult::failed("NETWORK_ERROR", err.to_string())
                    }
                }
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let detail = resp.text().await.unwrap_or_default();
                self.emit(
                    request_id,
                    "sms:failed",
                    json!({"error": detail, "error_code": format!("HTTP_{status}")}),
                )
                .await;
                DeliveryResult::failed(format!("HTTP_{status}"), detail)
            }
            Err(err) => {
                self.emit(
                    request_id,
                    "sms:failed",
                    json!({"error": err.to_string(), "error_code": "NETWORK_ERROR"}),
                )
                .await;
                DeliveryResult::failed("NETWORK_ERROR", err.to_string())
            }
        }
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_code() {
        let rendered = TEMPLATE.replace("{code}", "123456");
        assert!(rendered.contains("123456"));
        assert!(!rendered.contains("{code}"));
    }
}
