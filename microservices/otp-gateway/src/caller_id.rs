//! Longest-prefix-match caller-ID routing (spec §4.4 C4), the same shape as
//! `voice-switch::lcr::LcrEngine` minus carrier selection: here there is
//! exactly one candidate per `(channel, destination)` pair, the longest
//! matching prefix, with `"*"` as the wildcard fallback.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::{CallerIdRoute, Channel};
use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Clone)]
pub struct CallerIdRouter {
    store: Arc<Store>,
    /// `channel -> sorted(longest-prefix-first) routes`, rebuilt wholesale on
    /// `reload()` rather than patched incrementally — the table is small and
    /// changes rarely enough that this is simpler than tracking deltas.
    cache: Arc<DashMap<Channel, Vec<CallerIdRoute>>>,
}

impl CallerIdRouter {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub async fn reload(&self) -> Result<()> {
        let routes = self.store.caller_id_routes().list_enabled().await?;
        let mut by_channel: HashMap<Channel, Vec<CallerIdRoute>> = HashMap::new();
        for route in routes {
            by_channel.entry(route.channel).or_default().push(route);
        }
        for routes in by_channel.values_mut() {
            sort_longest_prefix_first(routes);
        }
        self.cache.clear();
        for (channel, routes) in by_channel {
            self.cache.insert(channel, routes);
        }
        Ok(())
    }

    /// Find the caller id to present when dialing `destination` over
    /// `channel`: the longest matching non-wildcard prefix, or `"*"` if
    /// present, or `NoCallerIdRoute` if neither exists. `destination` is
    /// E.164 (`+`-prefixed); routes are stored and matched as bare digits
    /// (spec §4.4: "strip `+`").
    pub fn lookup(&self, channel: Channel, destination: &str) -> Result<String> {
        let digits = destination.trim_start_matches('+');
        let routes = self
            .cache
            .get(&channel)
            .ok_or_else(|| Error::NoCallerIdRoute(destination.to_string()))?;
        longest_prefix_match(&routes, digits)
            .ok_or_else(|| Error::NoCallerIdRoute(destination.to_string()))
    }

    pub async fn create_route(&self, route: CallerIdRoute) -> Result<()> {
        self.store.caller_id_routes().create(&route).await?;
        self.reload().await
    }

    pub async fn delete_route(&self, channel: Channel, prefix: &str) -> Result<()> {
        self.store.caller_id_routes().delete(channel, prefix).await?;
        self.reload().await
    }
}

fn sort_longest_prefix_first(routes: &mut [CallerIdRoute]) {
    routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
}

/// Pure lookup over an already-sorted (longest prefix first) route list,
/// factored out so the matching logic is testable without a live `Store`.
fn longest_prefix_match(routes: &[CallerIdRoute], destination: &str) -> Option<String> {
    let mut wildcard: Option<&str> = None;
    for route in routes {
        if route.prefix == "*" {
            wildcard = Some(route.caller_id.as_str());
            continue;
        }
        if destination.starts_with(&route.prefix) {
            return Some(route.caller_id.clone());
        }
    }
    wildcard.map(|c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(channel: Channel, prefix: &str, caller_id: &str) -> CallerIdRoute {
        CallerIdRoute {
            channel,
            prefix: prefix.to_string(),
            caller_id: caller_id.to_string(),
            description: None,
            enabled: true,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut routes = vec![
            route(Channel::Voice, "1", "+10000000000"),
            route(Channel::Voice, "1415", "+14155550000"),
        ];
        sort_longest_prefix_first(&mut routes);
        assert_eq!(
            longest_prefix_match(&routes, "14155551234"),
            Some("+14155550000".to_string())
        );
    }

    #[test]
    fn wildcard_fallback_when_no_prefix_matches() {
        let routes = vec![
            route(Channel::Sms, "44", "+440000"),
            route(Channel::Sms, "*", "+10000000000"),
        ];
        assert_eq!(
            longest_prefix_match(&routes, "81901234567"),
            Some("+10000000000".to_string())
        );
    }

    #[test]
    fn no_route_and_no_wildcard_is_none() {
        let routes = vec![route(Channel::Sms, "44", "+440000")];
        assert_eq!(longest_prefix_match(&routes, "81901234567"), None);
    }
}
