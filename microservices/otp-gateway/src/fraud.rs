//! Fraud / admission pipeline (spec §4.3 C3): normalize, whitelist
//! short-circuit, hard blockers, weighted soft signals, threshold decision.
//! Structured the same way `voice-switch::fraud::FraudEngine` structures
//! IRSF/wangiri/velocity scoring — a `DashMap`-backed velocity cache plus a
//! sequence of scoring steps accumulating into one `FraudResult`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::Config;
use crate::domain::{Channel, WhitelistKind};
use crate::error::Result;
use crate::store::Store;

/// Resolves an IP to its announcing ASN. The MMDB/GeoIP lookup itself is an
/// external collaborator (spec Non-goals); the fraud engine only needs the
/// resolved value.
#[async_trait]
pub trait AsnResolver: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> Option<AsnInfo>;
}

#[derive(Debug, Clone)]
pub struct AsnInfo {
    pub asn: u32,
    pub ip_country: Option<String>,
}

/// Resolver used when no ASN database is configured: every lookup is
/// unresolved, which the scoring pipeline treats per
/// `fraud_shadow_ban_unresolved_asn` policy.
pub struct NullAsnResolver;

#[async_trait]
impl AsnResolver for NullAsnResolver {
    async fn resolve(&self, _ip: IpAddr) -> Option<AsnInfo> {
        None
    }
}

pub struct FraudContext {
    pub phone: String,
    pub ip: IpAddr,
    pub phone_country: Option<String>,
    pub channels_requested: Vec<Channel>,
}

#[derive(Debug, Clone)]
pub struct FraudOutcome {
    pub score: u8,
    pub reasons: Vec<String>,
    pub shadow: bool,
    pub ip_subnet: String,
    pub asn: Option<u32>,
    pub ip_country: Option<String>,
    pub phone_prefix: String,
}

pub struct FraudEngine {
    store: Arc<Store>,
    breakers: Arc<CircuitBreakerManager>,
    asn_resolver: Arc<dyn AsnResolver>,
    shadow_ban_threshold: u8,
    honeypot_threshold: u8,
    shadow_ban_unresolved_asn: bool,
    burst_subnet_count: u32,
    burst_subnet_window: Duration,
    burst_phone_count: u32,
    burst_phone_window: Duration,
    prefix_min_attempts: u32,
    prefix_verification_floor: f64,
    honeypot_add_ttl: Duration,
}

impl FraudEngine {
    pub fn new(
        store: Arc<Store>,
        breakers: Arc<CircuitBreakerManager>,
        asn_resolver: Arc<dyn AsnResolver>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            breakers,
            asn_resolver,
            shadow_ban_threshold: config.fraud_shadow_ban_threshold,
            honeypot_threshold: config.fraud_honeypot_threshold,
            shadow_ban_unresolved_asn: config.fraud_shadow_ban_unresolved_asn,
            burst_subnet_count: config.fraud_burst_subnet_count,
            burst_subnet_window: config.fraud_burst_subnet_window,
            burst_phone_count: config.fraud_burst_phone_count,
            burst_phone_window: config.fraud_burst_phone_window,
            prefix_min_attempts: config.fraud_prefix_min_attempts,
            prefix_verification_floor: config.fraud_prefix_verification_floor,
            honeypot_add_ttl: config.honeypot_add_ttl,
        }
    }

    pub async fn score(&self, ctx: &FraudContext) -> Result<FraudOutcome> {
        let ip_subnet = subnet_of(ctx.ip);
        let phone_prefix = phone_prefix_of(&ctx.phone);

        // Whitelist short-circuit.
        let ip_whitelisted = self
            .store
            .whitelist()
            .is_whitelisted(WhitelistKind::Ip, &ip_subnet)
            .await?;
        let phone_whitelisted = self
            .store
            .whitelist()
            .is_whitelisted(WhitelistKind::Phone, &ctx.phone)
            .await?;
        if ip_whitelisted || phone_whitelisted {
            self.store.ip_reputation().touch(&ip_subnet).await?;
            return Ok(FraudOutcome {
                score: 0,
                reasons: vec!["whitelisted".to_string()],
                shadow: false,
                ip_subnet,
                asn: None,
                ip_country: None,
                phone_prefix,
            });
        }

        let asn_info = self.asn_resolver.resolve(ctx.ip).await;
        let asn = asn_info.as_ref().map(|i| i.asn);
        let ip_country = asn_info.as_ref().and_then(|i| i.ip_country.clone());

        let mut reasons = Vec::new();

        // Hard blockers: always score=100, shadow=true.
        if self.store.honeypot().is_active(&ip_subnet, chrono::Utc::now()).await? {
            reasons.push("honeypot_subnet".to_string());
        }
        if let Some(ip_rep) = self.store.ip_reputation().find(&ip_subnet).await? {
            if ip_rep.banned {
                reasons.push("banned_subnet".to_string());
            }
        }
        if let Some(asn) = asn {
            if self.store.asn_blocklist().is_blocked(asn).await? {
                reasons.push("asn_blocklist".to_string());
            }
        }
        // Chosen channel isn't selected yet at admission time; the first
        // requested channel stands in for "the channel about to be tried".
        if let Some(first_channel) = ctx.channels_requested.first() {
            let key = crate::orchestrator::channel_breaker_key(*first_channel);
            if self.breakers.get_state(&key).await == crate::circuit_breaker::CircuitState::Open {
                reasons.push("circuit_breaker_open".to_string());
            }
        }

        self.store.ip_reputation().touch(&ip_subnet).await?;

        if !reasons.is_empty() {
            return Ok(FraudOutcome {
                score: 100,
                reasons,
                shadow: true,
                ip_subnet,
                asn,
                ip_country,
                phone_prefix,
            });
        }

        // Soft signals.
        let mut score: u32 = 0;

        if asn.is_none() && self.shadow_ban_unresolved_asn {
            score += 40;
            reasons.push("asn_unresolved".to_string());
        }

        if let (Some(ip_country), Some(phone_country)) = (&ip_country, &ctx.phone_country) {
            if ip_country != phone_country {
                score += 15;
                reasons.push("ip_phone_country_mismatch".to_string());
            }
        }

        let subnet_count = self
            .store
            .otp_requests()
            .count_by_ip_subnet(&ip_subnet, self.burst_subnet_window)
            .await?;
        if subnet_count as u32 >= self.burst_subnet_count {
            score += 25;
            reasons.push("subnet_burst".to_string());
        }

        let phone_count = self
            .store
            .otp_requests()
            .count_by_phone(&ctx.phone, self.burst_phone_window)
            .await?;
        if phone_count as u32 >= self.burst_phone_count {
            score += 20;
            reasons.push("phone_burst".to_string());
        }

        if let Some(prefix_rep) = self.store.prefix_reputation().find(&phone_prefix).await? {
            if prefix_rep.total >= self.prefix_min_attempts as u64
                && prefix_rep.verification_rate() < self.prefix_verification_floor
            {
                score += 20;
                reasons.push("prefix_low_verification".to_string());
            }
        }

        if let Some(ip_rep) = self.store.ip_reputation().find(&ip_subnet).await? {
            if ip_rep.total >= 10 && ip_rep.trust_score() < 0.1 {
                score += 15;
                reasons.push("subnet_low_trust".to_string());
            }
        }

        let score = score.min(100) as u8;
        let shadow = score >= self.shadow_ban_threshold;

        if score >= self.honeypot_threshold {
            let expires_at = chrono::Utc::now()
                + chrono::Duration::from_std(self.honeypot_add_ttl).unwrap_or_default();
            self.store.honeypot().add(&ip_subnet, Some(expires_at)).await?;
        }

        Ok(FraudOutcome {
            score,
            reasons,
            shadow,
            ip_subnet,
            asn,
            ip_country,
            phone_prefix,
        })
    }
}

/// IPv4 → /24, IPv6 → /64; an IPv4-mapped IPv6 address is unwrapped first.
pub fn subnet_of(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return subnet_of(IpAddr::V4(v4));
            }
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
    }
}

/// E.164 prefix: country code plus up to three digits, approximated as the
/// first four digits after the leading `+` is stripped (e.g.
/// `+14155551234` -> `"1415"`).
pub fn phone_prefix_of(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.chars().take(4).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_subnet_is_slash_24() {
        assert_eq!(subnet_of("203.0.113.42".parse().unwrap()), "203.0.113.0/24");
    }

    #[test]
    fn ipv4_mapped_ipv6_is_unwrapped() {
        let mapped: IpAddr = "::ffff:203.0.113.42".parse().unwrap();
        assert_eq!(subnet_of(mapped), "203.0.113.0/24");
    }

    #[test]
    fn ipv6_subnet_is_slash_64() {
        let addr: IpAddr = "2001:db8:abcd:1234::5678".parse().unwrap();
        assert_eq!(subnet_of(addr), "2001:db8:abcd:1234::/64");
    }

    #[test]
    fn phone_prefix_takes_leading_digits() {
        assert_eq!(phone_prefix_of("+14155551234"), "1415");
        assert_eq!(phone_prefix_of("+442071838750"), "4420");
    }
}
