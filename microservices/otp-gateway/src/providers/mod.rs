//! Channel providers (spec §4.5 C5): stateless delivery adapters that only
//! emit lifecycle events. They never read or mutate the request record
//! directly — the dispatch orchestrator and the event bus own that.

pub mod sms;
pub mod voice;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::Channel;

pub use sms::SmsProvider;
pub use voice::VoiceProvider;

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_external_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl DeliveryResult {
    pub fn ok(provider_external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_external_id: Some(provider_external_id.into()),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_external_id: None,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
        }
    }
}

#[async_trait]
pub trait ChannelProvider: Send + Sync {
    fn channel_type(&self) -> Channel;

    async fn send(&self, phone: &str, code: &str, request_id: Uuid) -> DeliveryResult;

    async fn is_available(&self) -> bool;
}
