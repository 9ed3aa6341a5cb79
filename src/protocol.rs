//! Request/response envelopes shared by the coordinator, workers and dashboard.

use serde::de::DeserializeOwned;
use std::collections::HashSet;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::{Feature, FeaturePayload, HeaderEntry, HostRecord, RequestMethod, WorkerSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    // Worker-facing
    Connect,
    NewAddressRange,
    SubmitAddressRange,
    NewFeatureRange,
    SubmitFeatureRange,
    // Dashboard-facing
    ProgressStats,
    SearchFeatures,
    RecentlyActiveWorkers,
    AddressDistributionStats,
    GetRandomRecord,
    GetRandomImage,
    HeaderNameStats,
    HeaderValueStats,
}

impl RequestType {
    pub fn is_worker_facing(&self) -> bool {
        matches!(
            self,
            RequestType::Connect
                | RequestType::NewAddressRange
                | RequestType::SubmitAddressRange
                | RequestType::NewFeatureRange
                | RequestType::SubmitFeatureRange
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Connect => "Connect",
            RequestType::NewAddressRange => "NewAddressRange",
            RequestType::SubmitAddressRange => "SubmitAddressRange",
            RequestType::NewFeatureRange => "NewFeatureRange",
            RequestType::SubmitFeatureRange => "SubmitFeatureRange",
            RequestType::ProgressStats => "ProgressStats",
            RequestType::SearchFeatures => "SearchFeatures",
            RequestType::RecentlyActiveWorkers => "RecentlyActiveWorkers",
            RequestType::AddressDistributionStats => "AddressDistributionStats",
            RequestType::GetRandomRecord => "GetRandomRecord",
            RequestType::GetRandomImage => "GetRandomImage",
            RequestType::HeaderNameStats => "HeaderNameStats",
            RequestType::HeaderValueStats => "HeaderValueStats",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_type: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_slot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            worker_id: None,
            nickname: None,
            task_slot: None,
            data: None,
        }
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self, serde_json::Error> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Decode the payload, falling back to `T::default()` when absent.
    pub fn payload_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => T::deserialize(value),
        }
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => T::deserialize(value).map(Some),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    /// Successful response carrying `data` serialized to JSON.
    pub fn ok<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::success(serde_json::to_value(data)?))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => T::deserialize(value).map(Some),
        }
    }
}

// ============================================================================
// WORKER-FACING PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAddressRange {
    pub batch_id: String,
    pub epoch: u32,
    pub start: u32,
    pub count: u32,
    pub is_validation: bool,
}

/// A host found by a probe, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredHost {
    pub address_index: u32,
    pub address: String,
    pub hostname: String,
    pub method: RequestMethod,
    pub headers: Vec<HeaderEntry>,
    pub features: Vec<FeaturePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAddressRange {
    pub batch_id: String,
    pub hosts: Vec<DiscoveredHost>,
}

impl SubmitAddressRange {
    /// Reported host count: one per address, however many schemes answered.
    pub fn found_count(&self) -> u32 {
        self.hosts
            .iter()
            .map(|h| h.address_index)
            .collect::<HashSet<_>>()
            .len() as u32
    }
}

/// An unelaborated feature plus the host context needed to resolve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureWorkItem {
    pub feature_id: String,
    pub host_record_id: String,
    pub payload: FeaturePayload,
    pub hostname: String,
    pub address: String,
    pub method: RequestMethod,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRange {
    pub items: Vec<FeatureWorkItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElaboratedFeature {
    pub parent_id: String,
    pub payload: FeaturePayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFeatureRange {
    pub features: Vec<ElaboratedFeature>,
}

// ============================================================================
// DASHBOARD PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub feature: Feature,
    pub parent: Option<Feature>,
    pub host: Option<HostRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
}

/// A host record with its feature arena resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecordView {
    pub record: HostRecord,
    pub features: Vec<Feature>,
}

/// A base64 feature with the host it was found on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub feature: Feature,
    pub host: HostRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentlyActiveWorkers {
    pub workers: Vec<WorkerSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRequest {
    #[serde(default = "default_buckets")]
    pub num_buckets: usize,
}

impl Default for DistributionRequest {
    fn default() -> Self {
        Self {
            num_buckets: default_buckets(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBucket {
    pub start_address: String,
    pub end_address: String,
    pub host_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionResponse {
    pub buckets: Vec<DistributionBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderNameStatsRequest {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for HeaderNameStatsRequest {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValueStatsRequest {
    #[serde(default)]
    pub header_name: String,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for HeaderValueStatsRequest {
    fn default() -> Self {
        Self {
            header_name: String::new(),
            top_n: default_top_n(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderCount {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderStats {
    pub top: Vec<HeaderCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStats {
    pub current_index: u32,
    pub current_address: String,
    pub percent_complete: f64,
    pub eta_seconds: Option<u64>,
    pub eta_display: String,
    pub found_hosts: u64,
}

fn default_buckets() -> usize {
    Config::DEFAULT_DISTRIBUTION_BUCKETS
}

fn default_top_n() -> usize {
    Config::DEFAULT_HEADER_TOP_N
}
