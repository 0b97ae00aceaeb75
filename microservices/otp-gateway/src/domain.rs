//! Core domain types for the OTP dispatch and lifecycle engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel a code can be delivered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Voice,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Voice => "voice",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Channel::Sms),
            "voice" => Ok(Channel::Voice),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Authoritative delivery status of an OtpRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Failed,
    Verified,
    Rejected,
    Expired,
}

impl DeliveryStatus {
    /// Terminal statuses freeze the request: no further mutation is legal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Failed
                | DeliveryStatus::Verified
                | DeliveryStatus::Rejected
                | DeliveryStatus::Expired
        )
    }
}

/// Auth feedback reported by the caller after the end user enters the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Verified,
    WrongCode,
}

/// An OTP delivery request, identified by an opaque request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpRequest {
    pub request_id: Uuid,
    pub destination: String,
    pub phone_prefix: String,
    pub code_digest: String,
    pub status: DeliveryStatus,
    pub auth_status: Option<AuthStatus>,
    pub channels_requested: Vec<Channel>,
    pub chosen_channel: Option<Channel>,
    pub client_ip: String,
    pub ip_subnet: String,
    pub asn: Option<u32>,
    pub ip_country: Option<String>,
    pub phone_country: Option<String>,
    pub fraud_score: u8,
    pub fraud_reasons: Vec<String>,
    pub shadow_banned: bool,
    pub webhook_url: Option<String>,
    pub provider_external_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OtpRequest {
    /// `combined_status` exposed externally: delivery status unless the
    /// request has been fed back through auth feedback, in which case the
    /// caller cares about verified/rejected instead of delivered/sent.
    pub fn combined_status(&self) -> DeliveryStatus {
        self.status
    }
}

/// Append-only lifecycle event for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpEvent {
    pub request_id: Uuid,
    pub channel: Channel,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Reputation aggregate keyed by IP subnet (IPv4 /24 or IPv6 /64).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpReputation {
    pub subnet: String,
    pub total: u64,
    pub verified: u64,
    pub failed: u64,
    pub banned: bool,
    pub ban_reason: Option<String>,
}

impl IpReputation {
    pub fn trust_score(&self) -> f64 {
        self.verified as f64 / self.total.max(1) as f64
    }
}

/// Reputation aggregate keyed by phone prefix, analogous to IpReputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixReputation {
    pub prefix: String,
    pub total: u64,
    pub verified: u64,
    pub failed: u64,
}

impl PrefixReputation {
    pub fn verification_rate(&self) -> f64 {
        self.verified as f64 / self.total.max(1) as f64
    }
}

/// ASN flagged as a zero-tolerance bot source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsnBlocklistEntry {
    pub asn: u32,
    pub provider: Option<String>,
    pub category: Option<String>,
    pub reason: Option<String>,
}

/// IP subnet flagged as a honeypot: any request from it is shadow-banned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoneypotEntry {
    pub subnet: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Caller-ID routing entry. `prefix = "*"` is the wildcard fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerIdRoute {
    pub channel: Channel,
    pub prefix: String,
    pub caller_id: String,
    pub description: Option<String>,
    pub enabled: bool,
}

/// Entry that short-circuits fraud scoring to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub kind: WhitelistKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistKind {
    Ip,
    Phone,
}

/// Immutable billing record, used to learn per-prefix rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdrRecord {
    pub id: Uuid,
    pub channel: Channel,
    pub source: String,
    pub destination: String,
    pub dst_prefix: String,
    pub src_prefix: Option<String>,
    pub duration_seconds: u32,
    pub billing_duration_seconds: u32,
    /// Price in integer units of 1/10000 USD.
    pub price_units: i64,
    pub success: bool,
    pub disconnect_code: Option<String>,
    pub processed_for_rates: bool,
    pub created_at: DateTime<Utc>,
}

/// Learned per-prefix carrier rate, money stored as integer 1/10000 USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierRate {
    pub channel: Channel,
    pub dst_prefix: String,
    pub src_prefix: Option<String>,
    pub rate_avg: i64,
    pub rate_min: i64,
    pub rate_max: i64,
    pub billing_increment: u32,
    pub sample_count: u64,
    pub confidence_score: f64,
    pub last_seen_at: DateTime<Utc>,
}

/// Ledger entry recording the estimated cost avoided on a blocked request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudSaving {
    pub request_id: Uuid,
    pub estimated_cost_units: i64,
    pub created_at: DateTime<Utc>,
}

/// One row per webhook delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub request_id: Uuid,
    pub url: String,
    pub attempt: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Webhook payload shape delivered to the caller's `webhook_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub request_id: Uuid,
    pub session_id: Option<String>,
    pub phone: String,
    pub status: DeliveryStatus,
    pub channel: Option<Channel>,
    pub timestamp: i64,
    pub metadata: Option<serde_json::Value>,
}
