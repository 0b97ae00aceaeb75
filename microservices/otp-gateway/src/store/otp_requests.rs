//! Repository for `otp_requests`: the central entity of the dispatch and
//! lifecycle engine (spec §3 OtpRequest, §4.1).

use std::time::Duration;

use brivas_lumadb::LumaDbPool;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::domain::{AuthStatus, Channel, DeliveryStatus, OtpRequest};
use crate::error::{Error, Result};

use super::Page;

pub struct OtpRequestRepo<'a> {
    db: &'a LumaDbPool,
}

/// Fields needed to admit a brand-new request (spec §4.6 step 1).
pub struct NewOtpRequest {
    pub request_id: Uuid,
    pub destination: String,
    pub phone_prefix: String,
    pub code_digest: String,
    pub channels_requested: Vec<Channel>,
    pub client_ip: String,
    pub ip_subnet: String,
    pub asn: Option<u32>,
    pub ip_country: Option<String>,
    pub phone_country: Option<String>,
    pub fraud_score: u8,
    pub fraud_reasons: Vec<String>,
    pub shadow_banned: bool,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<'a> OtpRequestRepo<'a> {
    pub fn new(db: &'a LumaDbPool) -> Self {
        Self { db }
    }

    pub async fn create(&self, req: NewOtpRequest) -> Result<OtpRequest> {
        let client = self.db.get().await?;
        let channels: Vec<String> = req
            .channels_requested
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        client
            .execute(
                r#"
                INSERT INTO otp_requests (
                    request_id, destination, phone_prefix, code_digest, status,
                    auth_status, channels_requested, chosen_channel, client_ip,
                    ip_subnet, asn, ip_country, phone_country, fraud_score,
                    fraud_reasons, shadow_banned, webhook_url, provider_external_id,
                    error_message, created_at, updated_at, expires_at
                ) VALUES (
                    $1, $2, $3, $4, 'pending',
                    NULL, $5, NULL, $6,
                    $7, $8, $9, $10, $11,
                    $12, $13, $14, NULL,
                    NULL, $15, $15, $16
                )
                "#,
                &[
                    &req.request_id,
                    &req.destination,
                    &req.phone_prefix,
                    &req.code_digest,
                    &channels,
                    &req.client_ip,
                    &req.ip_subnet,
                    &req.asn.map(|a| a as i64),
                    &req.ip_country,
                    &req.phone_country,
                    &(req.fraud_score as i16),
                    &req.fraud_reasons,
                    &req.shadow_banned,
                    &req.webhook_url,
                    &req.created_at,
                    &req.expires_at,
                ],
            )
            .await?;

        self.find_by_id(req.request_id)
            .await?
            .ok_or_else(|| Error::Internal("failed to read back created otp_request".into()))
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<OtpRequest>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt("SELECT * FROM otp_requests WHERE request_id = $1", &[&id])
            .await?;
        Ok(row.map(|r| row_to_request(&r)))
    }

    /// Looks a request up by the provider's external id (carrier message id
    /// / ARI channel id), used to correlate an asynchronous DLR webhook back
    /// to the request that triggered it (spec §6 `/webhooks/dlr`).
    pub async fn find_by_provider_external_id(&self, external_id: &str) -> Result<Option<OtpRequest>> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM otp_requests WHERE provider_external_id = $1",
                &[&external_id],
            )
            .await?;
        Ok(row.map(|r| row_to_request(&r)))
    }

    pub async fn list(&self, page: &Page) -> Result<Vec<OtpRequest>> {
        let client = self.db.get().await?;
        let order = page.order_by_clause("otp_requests")?;
        let sql = format!(
            "SELECT * FROM otp_requests ORDER BY {order} LIMIT $1 OFFSET $2"
        );
        let rows = client
            .query(&sql, &[&(page.limit as i64), &page.offset()])
            .await?;
        Ok(rows.iter().map(row_to_request).collect())
    }

    /// Count requests from this phone within the trailing `window`.
    pub async fn count_by_phone(&self, phone: &str, window: Duration) -> Result<i64> {
        let client = self.db.get().await?;
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM otp_requests WHERE destination = $1 AND created_at >= $2",
                &[&phone, &since],
            )
            .await?;
        Ok(row.get::<_, i64>("n"))
    }

    /// Count requests from this IP subnet within the trailing `window`.
    pub async fn count_by_ip_subnet(&self, subnet: &str, window: Duration) -> Result<i64> {
        let client = self.db.get().await?;
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM otp_requests WHERE ip_subnet = $1 AND created_at >= $2",
                &[&subnet, &since],
            )
            .await?;
        Ok(row.get::<_, i64>("n"))
    }

    /// Apply a status transition iff the row is currently in `from` and not
    /// already terminal. Returns whether the row was actually updated, so
    /// callers (the state machine) can tell a legal-but-stale transition
    /// from one raced away by a concurrent writer.
    pub async fn transition(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
        chosen_channel: Option<Channel>,
        provider_external_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let client = self.db.get().await?;
        let now = Utc::now();
        let rows = client
            .execute(
                r#"
                UPDATE otp_requests SET
                    status = $1,
                    chosen_channel = COALESCE($2, chosen_channel),
                    provider_external_id = COALESCE($3, provider_external_id),
                    error_message = COALESCE($4, error_message),
                    updated_at = $5
                WHERE request_id = $6 AND status = $7
                "#,
                &[
                    &status_str(to),
                    &chosen_channel.map(|c| c.as_str().to_string()),
                    &provider_external_id,
                    &error_message,
                    &now,
                    &id,
                    &status_str(from),
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Force a terminal transition regardless of current status, as long as
    /// the row is not already terminal (dispatch-level failures: no route,
    /// all channels exhausted). Guarded the same way as `transition`.
    pub async fn force_terminal(
        &self,
        id: Uuid,
        to: DeliveryStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(to.is_terminal());
        let client = self.db.get().await?;
        let now = Utc::now();
        let rows = client
            .execute(
                r#"
                UPDATE otp_requests SET
                    status = $1,
                    error_message = COALESCE($2, error_message),
                    updated_at = $3
                WHERE request_id = $4
                  AND status NOT IN ('failed', 'verified', 'rejected', 'expired')
                "#,
                &[&status_str(to), &error_message, &now, &id],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Auth feedback: `null -> verified|wrong_code`, once, and only while the
    /// delivery status has reached `delivered` (spec §4.8).
    pub async fn apply_auth_feedback(
        &self,
        id: Uuid,
        auth_status: AuthStatus,
        combined_status: DeliveryStatus,
    ) -> Result<bool> {
        let client = self.db.get().await?;
        let now = Utc::now();
        let rows = client
            .execute(
                r#"
                UPDATE otp_requests SET
                    auth_status = $1,
                    status = $2,
                    updated_at = $3
                WHERE request_id = $4 AND auth_status IS NULL AND status = 'delivered'
                "#,
                &[&auth_status_str(auth_status), &status_str(combined_status), &now, &id],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Expiry sweep: transition any non-terminal row past its TTL to
    /// `expired`. Returns the ids that were actually flipped.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                UPDATE otp_requests SET status = 'expired', updated_at = $1
                WHERE expires_at < $1
                  AND status NOT IN ('failed', 'verified', 'rejected', 'expired')
                RETURNING request_id
                "#,
                &[&now],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("request_id")).collect())
    }
}

pub(crate) fn status_str(status: DeliveryStatus) -> &'static str {
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

fn auth_status_str(status: AuthStatus) -> &'static str {
    match status {
        AuthStatus::Verified => "verified",
        AuthStatus::WrongCode => "wrong_code",
    }
}

fn row_to_request(row: &Row) -> OtpRequest {
    let channels: Vec<String> = row.get("channels_requested");
    let chosen: Option<String> = row.get("chosen_channel");
    let status: String = row.get("status");
    let auth: Option<String> = row.get("auth_status");

    OtpRequest {
        request_id: row.get("request_id"),
        destination: row.get("destination"),
        phone_prefix: row.get("phone_prefix"),
        code_digest: row.get("code_digest"),
        status: parse_status(&status),
        auth_status: auth.as_deref().map(parse_auth_status),
        channels_requested: channels
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect(),
        chosen_channel: chosen.and_then(|c| c.parse().ok()),
        client_ip: row.get("client_ip"),
        ip_subnet: row.get("ip_subnet"),
        asn: row.get::<_, Option<i64>>("asn").map(|a| a as u32),
        ip_country: row.get("ip_country"),
        phone_country: row.get("phone_country"),
        fraud_score: row.get::<_, i16>("fraud_score") as u8,
        fraud_reasons: row.get("fraud_reasons"),
        shadow_banned: row.get("shadow_banned"),
        webhook_url: row.get("webhook_url"),
        provider_external_id: row.get("provider_external_id"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        expires_at: row.get("expires_at"),
    }
}

fn parse_status(s: &str) -> DeliveryStatus {
    match s {
        "pending" => DeliveryStatus::Pending,
        "sending" => DeliveryStatus::Sending,
        "sent" => DeliveryStatus::Sent,
        "delivered" => DeliveryStatus::Delivered,
        "verified" => DeliveryStatus::Verified,
        "rejected" => DeliveryStatus::Rejected,
        "expired" => DeliveryStatus::Expired,
        _ => DeliveryStatus::Failed,
    }
}

fn parse_auth_status(s: &str) -> AuthStatus {
    match s {
        "verified" => AuthStatus::Verified,
        _ => AuthStatus::WrongCode,
    }
}
