use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::errors::ServiceError;

pub mod b2b;
pub mod payment;

/// Replay guard for inbound webhooks. Provider event ids are remembered
/// for a TTL at least as long as the longest provider retry window, so a
/// redelivered event is recognized and acknowledged without reprocessing.
pub struct WebhookDedup {
    seen: DashMap<(String, String), Instant>,
    ttl: Duration,
}

impl WebhookDedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Records `(provider, event_id)`; a second call within the TTL fails
    /// with `REPLAY`.
    pub fn check_and_record(&self, provider: &str, event_id: &str) -> Result<(), ServiceError> {
        self.purge_expired();

        let key = (provider.to_string(), event_id.to_string());
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().elapsed() < self.ttl {
                    return Err(ServiceError::ReplayedWebhook(format!(
                        "{}:{}",
                        provider, event_id
                    )));
                }
                entry.insert(Instant::now());
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                Ok(())
            }
        }
    }

    fn purge_expired(&self) {
        self.seen.retain(|_, inserted| inserted.elapsed() < self.ttl);
    }
}
