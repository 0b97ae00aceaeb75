//! Persistence layer: one repository per entity over a shared connection
//! pool. The embedded SQL engine itself is an external collaborator (spec
//! Non-goals); this module is the repository contract the rest of the core
//! depends on, implemented against the same Postgres-wire pool
//! (`brivas_lumadb`) the rest of the platform uses.

pub mod billing;
pub mod events;
pub mod fraud_control;
pub mod otp_requests;
pub mod reputation;
pub mod routing;
pub mod webhooks;

pub use billing::{CarrierRateRepo, CdrRepo, FraudSavingRepo};
pub use events::OtpEventRepo;
pub use fraud_control::{AsnBlocklistRepo, CircuitBreakerRepo, HoneypotRepo, WhitelistRepo};
pub use otp_requests::OtpRequestRepo;
pub use reputation::{IpReputationRepo, PrefixReputationRepo};
pub use routing::CallerIdRouteRepo;
pub use webhooks::WebhookLogRepo;

use brivas_lumadb::LumaDbPool;

/// Tables the generic paginated-listing surface may touch. Anything else is
/// rejected before a query is composed (spec §4.1: "Listing endpoints accept
/// only a whitelisted set of table names").
pub const LISTABLE_TABLES: &[&str] = &[
    "otp_requests",
    "otp_events",
    "ip_reputation",
    "prefix_reputation",
    "webhook_logs",
    "caller_id_routes",
    "cdr_records",
    "carrier_rates",
];

/// Columns a given listable table may be sorted by, checked before the sort
/// column is spliced into SQL.
pub fn sortable_columns(table: &str) -> &'static [&'static str] {
    match table {
        "otp_requests" => &["created_at", "updated_at", "fraud_score", "status"],
        "otp_events" => &["created_at"],
        "ip_reputation" => &["total", "verified", "failed"],
        "prefix_reputation" => &["total", "verified", "failed"],
        "webhook_logs" => &["sent_at", "attempt"],
        "caller_id_routes" => &["prefix", "channel"],
        "cdr_records" => &["created_at"],
        "carrier_rates" => &["last_seen_at", "confidence_score"],
        _ => &[],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// `(page, limit, sort)` as accepted by every paginated listing operation.
#[derive(Debug, Clone)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
    pub sort: Option<(String, SortDir)>,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page.saturating_sub(1) as i64) * self.limit as i64
    }

    /// Validate and render `ORDER BY <col> <dir>` for `table`, defaulting to
    /// `created_at DESC` (or the table's first sortable column) when no sort
    /// was requested, and rejecting unknown columns outright.
    pub fn order_by_clause(&self, table: &str) -> crate::error::Result<String> {
        let allowed = sortable_columns(table);
        match &self.sort {
            Some((col, dir)) => {
                if !allowed.contains(&col.as_str()) {
                    return Err(crate::error::Error::Validation(format!(
                        "column {col} is not sortable on {table}"
                    )));
                }
                Ok(format!("{col} {}", dir.as_sql()))
            }
            None => {
                let default_col = allowed.first().copied().unwrap_or("created_at");
                Ok(format!("{default_col} DESC"))
            }
        }
    }
}

/// Shared store: one connection pool, one repository per entity. Cloned
/// cheaply (the pool itself is a handle) and passed around as `Arc<Store>`.
#[derive(Clone)]
pub struct Store {
    db: LumaDbPool,
}

impl Store {
    pub fn new(db: LumaDbPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &LumaDbPool {
        &self.db
    }

    pub fn otp_requests(&self) -> OtpRequestRepo<'_> {
        OtpRequestRepo::new(&self.db)
    }

    pub fn otp_events(&self) -> OtpEventRepo<'_> {
        OtpEventRepo::new(&self.db)
    }

    pub fn ip_reputation(&self) -> IpReputationRepo<'_> {
        IpReputationRepo::new(&self.db)
    }

    pub fn prefix_reputation(&self) -> PrefixReputationRepo<'_> {
        PrefixReputationRepo::new(&self.db)
    }

    pub fn whitelist(&self) -> WhitelistRepo<'_> {
        WhitelistRepo::new(&self.db)
    }

    pub fn honeypot(&self) -> HoneypotRepo<'_> {
        HoneypotRepo::new(&self.db)
    }

    pub fn asn_blocklist(&self) -> AsnBlocklistRepo<'_> {
        AsnBlocklistRepo::new(&self.db)
    }

    pub fn circuit_breakers(&self) -> CircuitBreakerRepo<'_> {
        CircuitBreakerRepo::new(&self.db)
    }

    pub fn caller_id_routes(&self) -> CallerIdRouteRepo<'_> {
        CallerIdRouteRepo::new(&self.db)
    }

    pub fn cdrs(&self) -> CdrRepo<'_> {
        CdrRepo::new(&self.db)
    }

    pub fn carrier_rates(&self) -> CarrierRateRepo<'_> {
        CarrierRateRepo::new(&self.db)
    }

    pub fn fraud_savings(&self) -> FraudSavingRepo<'_> {
        FraudSavingRepo::new(&self.db)
    }

    pub fn webhook_logs(&self) -> WebhookLogRepo<'_> {
        WebhookLogRepo::new(&self.db)
    }
}
