use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::protocol::{RequestType, Response};

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Response,
    expires_at: Instant,
    ttl: Duration,
}

/// Expiring responses for the read-only aggregate endpoints, keyed by
/// endpoint plus canonical parameters.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints that are cached at all, and for how long.
    pub fn ttl_for(request_type: RequestType) -> Option<Duration> {
        let secs = match request_type {
            RequestType::ProgressStats => Config::PROGRESS_TTL_SECS,
            RequestType::RecentlyActiveWorkers => Config::ACTIVE_WORKERS_TTL_SECS,
            RequestType::AddressDistributionStats => Config::DISTRIBUTION_TTL_SECS,
            RequestType::HeaderNameStats | RequestType::HeaderValueStats => Config::HEADER_STATS_TTL_SECS,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }

    /// Hex SHA-256 of `"<type>|<json>"`. Object keys serialize sorted, so
    /// equal parameters always hash equally.
    pub fn key(request_type: RequestType, params: &Value) -> String {
        let composite = format!("{}|{}", request_type.as_str(), params);
        let digest = Sha256::digest(composite.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Live entry for `key`. An entry expiring exactly now is already dead.
    pub fn get(&self, key: &str) -> Option<Response> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.response.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Store a response. Failures are never cached.
    pub fn insert(&self, key: String, response: &Response, ttl: Duration) -> bool {
        if !response.success {
            return false;
        }
        self.entries.insert(
            key,
            CacheEntry {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        true
    }

    /// Missing, or within `max(ttl / 10, min_lead)` of expiring.
    pub fn needs_warming(&self, key: &str, min_lead: Duration) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return true;
        };
        let lead = (entry.ttl / 10).max(min_lead);
        entry.expires_at.saturating_duration_since(Instant::now()) <= lead
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
