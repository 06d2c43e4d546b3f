//! Provider discovery.
//!
//! The directory enumerates providers by category; the driver asks each one
//! for its plug status and routes the replies into the reconciler.

use tracing::debug;

use crate::client::{Outbound, Reply};
use crate::plugs::Reconciler;

/// Service category of plug providers.
pub const CONTROL_CATEGORY: &str = "control";

/// Source of provider URLs.
pub trait Directory: Send + Sync {
    /// Invoke `visit` once per known provider of `category`.
    fn discovered(&self, category: &str, visit: &mut dyn FnMut(&str));
}

/// Fixed provider list, taken from the settings file.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    control: Vec<String>,
}

impl StaticDirectory {
    pub fn new(control: Vec<String>) -> Self {
        Self { control }
    }
}

impl Directory for StaticDirectory {
    fn discovered(&self, category: &str, visit: &mut dyn FnMut(&str)) {
        if category != CONTROL_CATEGORY {
            return;
        }
        for url in &self.control {
            visit(url.trim_end_matches('/'));
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct DiscoveryDriver {
    directory: Box<dyn Directory>,
}

impl DiscoveryDriver {
    pub fn new(directory: Box<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Queue a status request to every control provider. Providers that gave
    /// a cursor are only asked for what changed since.
    pub fn request_scan(&self, reconciler: &mut Reconciler, _now: i64) {
        let mut found = Vec::new();
        self.directory
            .discovered(CONTROL_CATEGORY, &mut |url| found.push(url.to_string()));

        for provider in found {
            let id = reconciler.providers_mut().find_or_create(&provider);
            let cursor = reconciler
                .providers()
                .get(id)
                .map(|p| p.cursor)
                .unwrap_or(0);
            let url = if cursor > 0 {
                format!("{provider}/status?known={cursor}")
            } else {
                format!("{provider}/status")
            };
            debug!(%provider, cursor, "scanning");
            reconciler.enqueue(Outbound::Status { provider, url });
        }
    }

    pub fn on_status_response(
        &self,
        reconciler: &mut Reconciler,
        provider: &str,
        reply: Result<Reply, String>,
        now: i64,
    ) {
        match reply {
            Err(e) => reconciler.log().failure(provider, e),
            Ok(Reply { status: 200, body }) => {
                reconciler.ingest_discovery_payload(provider, &body, now)
            }
            // Nothing changed since the cursor we sent.
            Ok(Reply { status: 304, .. }) => reconciler.refresh_provider(provider, now),
            Ok(Reply { status, .. }) => reconciler
                .log()
                .failure(provider, format!("HTTP error {status}")),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;

    const RELAY: &str = "http://relay.local/relay";

    fn setup() -> (DiscoveryDriver, Reconciler) {
        let dir = StaticDirectory::new(vec![format!("{RELAY}/"), "http://b/relay".into()]);
        (
            DiscoveryDriver::new(Box::new(dir)),
            Reconciler::new(EventLog::new()),
        )
    }

    fn ok(status: u16, body: &str) -> Result<Reply, String> {
        Ok(Reply {
            status,
            body: body.to_string(),
        })
    }

    #[test]
    fn static_directory_ignores_other_categories() {
        let dir = StaticDirectory::new(vec![RELAY.into()]);
        let mut seen = Vec::new();
        dir.discovered("history", &mut |u| seen.push(u.to_string()));
        assert!(seen.is_empty());
        dir.discovered(CONTROL_CATEGORY, &mut |u| seen.push(u.to_string()));
        assert_eq!(seen, vec![RELAY]);
    }

    #[test]
    fn scan_registers_providers_and_queues_requests() {
        let (driver, mut rec) = setup();
        driver.request_scan(&mut rec, 1);
        assert_eq!(rec.providers().len(), 2);

        let urls: Vec<_> = rec
            .take_outbound()
            .iter()
            .map(|o| o.url().to_string())
            .collect();
        assert_eq!(
            urls,
            vec![format!("{RELAY}/status"), "http://b/relay/status".to_string()]
        );
    }

    #[test]
    fn status_200_is_ingested() {
        let (driver, mut rec) = setup();
        let body = r#"{"latest":4,"control":{"status":{"porch":{"state":"on"}}}}"#;
        driver.on_status_response(&mut rec, RELAY, ok(200, body), 10);
        assert_eq!(rec.get("porch").unwrap().url, RELAY);
    }

    #[test]
    fn status_304_is_silent() {
        let (driver, mut rec) = setup();
        driver.on_status_response(&mut rec, RELAY, ok(304, ""), 10);
        assert_eq!(rec.log().count_failures(), 0);
        assert!(rec.log().entries().is_empty());
    }

    #[test]
    fn other_status_and_transport_errors_fail() {
        let (driver, mut rec) = setup();
        driver.on_status_response(&mut rec, RELAY, ok(500, "oops"), 10);
        driver.on_status_response(&mut rec, RELAY, Err("cannot reach".into()), 11);
        let entries = rec.log().entries();
        assert_eq!(rec.log().count_failures(), 2);
        assert_eq!(entries[1].detail, "HTTP error 500");
        assert_eq!(entries[1].subject, RELAY);
    }
}
