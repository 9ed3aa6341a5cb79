//! Read-only endpoints for the dashboard and the response-cache warmer.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Coordinator, CoordinatorError};
use crate::address::index_to_address;
use crate::config::Config;
use crate::models::{AddressBatch, HeaderEntry};
use crate::progress::format_eta;
use crate::protocol::{
    DistributionBucket, DistributionRequest, DistributionResponse, HeaderCount, HeaderNameStatsRequest, HeaderStats,
    HeaderValueStatsRequest, ProgressStats, Request, RequestType, Response, SearchHit, SearchQuery, SearchResults,
};
use crate::response_cache::ResponseCache;

/// Parameter sets recomputed ahead of expiry.
fn warm_set() -> Vec<(RequestType, Value)> {
    vec![
        (RequestType::ProgressStats, Value::Null),
        (RequestType::RecentlyActiveWorkers, Value::Null),
        (
            RequestType::AddressDistributionStats,
            serde_json::json!({ "numBuckets": Config::DEFAULT_DISTRIBUTION_BUCKETS }),
        ),
        (
            RequestType::HeaderNameStats,
            serde_json::json!({ "topN": Config::DEFAULT_HEADER_TOP_N }),
        ),
    ]
}

impl Coordinator {
    pub(super) async fn search_features(&self, request: &Request) -> Result<Response, CoordinatorError> {
        let SearchQuery { query } = request.payload_or_default()?;
        let query = query.trim();
        if query.is_empty() {
            return Ok(Response::ok(&SearchResults { hits: Vec::new() })?);
        }

        let features = self.store.search_features(query, Config::SEARCH_RESULT_LIMIT).await?;
        let mut hits = Vec::with_capacity(features.len());
        for feature in features {
            let parent = match &feature.parent_id {
                Some(id) => self.store.get_feature(id).await?,
                None => None,
            };
            let host = self.store.get_host_record(&feature.host_record_id).await?;
            hits.push(SearchHit { feature, parent, host });
        }
        Ok(Response::ok(&SearchResults { hits })?)
    }

    pub(super) async fn random_record(&self) -> Result<Response, CoordinatorError> {
        match self.random_records.next().await? {
            Some(view) => Ok(Response::ok(&view)?),
            None => Err(CoordinatorError::NoRecords),
        }
    }

    pub(super) async fn random_image(&self) -> Result<Response, CoordinatorError> {
        match self.random_images.next().await? {
            Some(view) => Ok(Response::ok(&view)?),
            None => Err(CoordinatorError::NoImages),
        }
    }

    /// Serve a cacheable aggregate, computing and caching it on a miss.
    pub(super) async fn cached_aggregate(&self, request: &Request) -> Result<Response, CoordinatorError> {
        let request_type = request.request_type;
        let params = normalized_params(request)?;
        let Some(ttl) = ResponseCache::ttl_for(request_type) else {
            return self.aggregate(request_type, &params).await;
        };

        let key = ResponseCache::key(request_type, &params);
        if let Some(hit) = self.responses.get(&key) {
            self.metrics.cache_hits.inc();
            return Ok(hit);
        }
        self.metrics.cache_misses.inc();

        let response = self.aggregate(request_type, &params).await?;
        self.responses.insert(key, &response, ttl);
        Ok(response)
    }

    async fn aggregate(&self, request_type: RequestType, params: &Value) -> Result<Response, CoordinatorError> {
        match request_type {
            RequestType::ProgressStats => Ok(Response::ok(&self.progress_stats().await?)?),
            RequestType::RecentlyActiveWorkers => Ok(Response::ok(&self.recently_active_workers().await?)?),
            RequestType::AddressDistributionStats => {
                let DistributionRequest { num_buckets } = serde_json::from_value(params.clone())?;
                let batches = self.store.all_batches().await?;
                let buckets = compress_batches(&batches, num_buckets);
                Ok(Response::ok(&DistributionResponse { buckets })?)
            }
            RequestType::HeaderNameStats => {
                let HeaderNameStatsRequest { top_n } = serde_json::from_value(params.clone())?;
                let headers = self.store.all_headers().await?;
                Ok(Response::ok(&HeaderStats {
                    top: top_header_names(&headers, top_n),
                })?)
            }
            RequestType::HeaderValueStats => {
                let HeaderValueStatsRequest { header_name, top_n } = serde_json::from_value(params.clone())?;
                let header_name = header_name.trim();
                if header_name.is_empty() {
                    return Err(CoordinatorError::EmptyHeaderName);
                }
                let headers = self.store.all_headers().await?;
                Ok(Response::ok(&HeaderStats {
                    top: top_header_values(&headers, header_name, top_n),
                })?)
            }
            other => {
                debug!(request = other.as_str(), "not an aggregate endpoint");
                Ok(Response::failure(format!("{} is not an aggregate endpoint", other.as_str())))
            }
        }
    }

    async fn progress_stats(&self) -> Result<ProgressStats, CoordinatorError> {
        let current_index = self.progress.current_index();
        let eta = self.progress.eta();
        Ok(ProgressStats {
            current_index,
            current_address: index_to_address(current_index),
            percent_complete: self.progress.percent_complete(),
            eta_seconds: eta.map(|d| d.as_secs()),
            eta_display: format_eta(eta),
            found_hosts: self.store.count_host_records().await?,
        })
    }

    /// Recompute warm entries that are missing or close to expiry.
    pub(super) async fn warm_caches(&self) {
        let min_lead = Duration::from_secs(Config::WARM_MIN_LEAD_SECS);
        for (request_type, params) in warm_set() {
            let Some(ttl) = ResponseCache::ttl_for(request_type) else {
                continue;
            };
            let key = ResponseCache::key(request_type, &params);
            if !self.responses.needs_warming(&key, min_lead) {
                continue;
            }
            match self.aggregate(request_type, &params).await {
                Ok(response) => {
                    self.responses.insert(key, &response, ttl);
                    self.metrics.cache_refreshes.inc();
                }
                Err(e) => warn!(request = request_type.as_str(), error = %e, "cache warm failed"),
            }
        }
    }
}

/// Decode into the endpoint's typed parameters (filling defaults) and back,
/// so equivalent requests share a cache key.
fn normalized_params(request: &Request) -> Result<Value, CoordinatorError> {
    let params = match request.request_type {
        RequestType::AddressDistributionStats => {
            serde_json::to_value(request.payload_or_default::<DistributionRequest>()?)?
        }
        RequestType::HeaderNameStats => serde_json::to_value(request.payload_or_default::<HeaderNameStatsRequest>()?)?,
        RequestType::HeaderValueStats => {
            serde_json::to_value(request.payload_or_default::<HeaderValueStatsRequest>()?)?
        }
        _ => Value::Null,
    };
    Ok(params)
}

/// Group batches (already in `(epoch, start)` order) into at most
/// `num_buckets` runs of `ceil(len / num_buckets)`.
pub(crate) fn compress_batches(batches: &[AddressBatch], num_buckets: usize) -> Vec<DistributionBucket> {
    if batches.is_empty() {
        return Vec::new();
    }
    let chunk = batches.len().div_ceil(num_buckets.max(1));
    batches
        .chunks(chunk)
        .map(|group| DistributionBucket {
            start_address: group[0].start_address(),
            end_address: group[group.len() - 1].end_address(),
            host_count: group.iter().map(|b| b.found_count.unwrap_or(0) as u64).sum(),
        })
        .collect()
}

/// Case-insensitive header-name histogram, most common first.
pub(crate) fn top_header_names(headers: &[HeaderEntry], top_n: usize) -> Vec<HeaderCount> {
    top_counts(headers.iter().map(|h| h.name.to_ascii_lowercase()), top_n)
}

pub(crate) fn top_header_values(headers: &[HeaderEntry], header_name: &str, top_n: usize) -> Vec<HeaderCount> {
    top_counts(
        headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(header_name))
            .map(|h| h.value.clone()),
        top_n,
    )
}

fn top_counts(keys: impl Iterator<Item = String>, top_n: usize) -> Vec<HeaderCount> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for key in keys {
        *counts.entry(key).or_default() += 1;
    }
    let mut top: Vec<HeaderCount> = counts.into_iter().map(|(key, count)| HeaderCount { key, count }).collect();
    top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    top.truncate(top_n.max(1));
    top
}
