//! Known control providers and their incremental-sync cursors.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub url: String,
    /// Last `latest` value the provider reported. Zero forces a full status.
    pub cursor: u64,
    /// Unix seconds of the last successful reply, zero if none yet.
    pub last_response: i64,
}

/// Index into the registry. Only valid until the next `reset_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderId(usize);

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, url: &str) -> Option<ProviderId> {
        self.providers
            .iter()
            .position(|p| p.url == url)
            .map(ProviderId)
    }

    pub fn find_or_create(&mut self, url: &str) -> ProviderId {
        if let Some(id) = self.find(url) {
            return id;
        }
        self.providers.push(Provider {
            url: url.to_string(),
            cursor: 0,
            last_response: 0,
        });
        ProviderId(self.providers.len() - 1)
    }

    pub fn get(&self, id: ProviderId) -> Option<&Provider> {
        self.providers.get(id.0)
    }

    /// Store the outcome of a successful reply. `latest` is only taken when
    /// the provider reported one; otherwise the cursor is left unchanged.
    pub fn record_response(&mut self, url: &str, latest: Option<u64>, now: i64) {
        let id = self.find_or_create(url);
        let provider = &mut self.providers[id.0];
        if let Some(latest) = latest {
            provider.cursor = latest;
        }
        provider.last_response = now;
    }

    /// Forget every provider. Outstanding `ProviderId`s become invalid.
    pub fn reset_all(&mut self) {
        self.providers.clear();
    }

    /// Force a full resync on the next scan of every provider.
    pub fn reset_cursors(&mut self) {
        for p in &mut self.providers {
            p.cursor = 0;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
