use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::address;

/// Seconds since the UNIX epoch; every persisted timestamp uses this unit.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Random alphanumeric identifier used for sessions, hosts and features.
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// One complete sweep over the address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    pub ordinal: u32,
    pub started_at: u64,
    pub completed_at: Option<u64>,
}

impl Epoch {
    pub fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            started_at: now_secs(),
            completed_at: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.completed_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    NotValidated,
    Validating,
    Validated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationState {
    pub status: ValidationStatus,
    pub issued_to: Option<String>,
    pub issued_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub found_count: Option<u32>,
}

impl ValidationState {
    /// Whether a validation run may be issued at `cutoff`.
    pub fn is_open_at(&self, cutoff: u64) -> bool {
        match self.status {
            ValidationStatus::NotValidated => true,
            ValidationStatus::Validating => self.issued_at.map(|at| at < cutoff).unwrap_or(true),
            ValidationStatus::Validated | ValidationStatus::Failed => false,
        }
    }
}

impl Default for ValidationState {
    fn default() -> Self {
        Self {
            status: ValidationStatus::NotValidated,
            issued_to: None,
            issued_at: None,
            completed_at: None,
            found_count: None,
        }
    }
}

/// A contiguous slice `[start, start + count)` of one epoch's address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBatch {
    pub id: String,
    pub epoch: u32,
    pub start: u32,
    pub count: u32,
    pub issued_to: String,
    pub issued_at: u64,
    pub completed: bool,
    pub completed_at: Option<u64>,
    pub found_count: Option<u32>,
    pub validation: ValidationState,
}

impl AddressBatch {
    pub fn new(epoch: u32, start: u32, count: u32, issued_to: &str) -> Self {
        Self {
            id: Self::batch_id(epoch, start),
            epoch,
            start,
            count,
            issued_to: issued_to.to_string(),
            issued_at: now_secs(),
            completed: false,
            completed_at: None,
            found_count: None,
            validation: ValidationState::default(),
        }
    }

    /// Ids sort by `(epoch, start)` so store scans come back in address order.
    pub fn batch_id(epoch: u32, start: u32) -> String {
        format!("{:05}-{:010}", epoch, start)
    }

    /// Exclusive upper bound, widened so the top of the space does not overflow.
    pub fn end_exclusive(&self) -> u64 {
        self.start as u64 + self.count as u64
    }

    pub fn start_address(&self) -> String {
        address::index_to_address(self.start)
    }

    pub fn end_address(&self) -> String {
        let last = self.end_exclusive().saturating_sub(1).min(u32::MAX as u64) as u32;
        address::index_to_address(last)
    }

    /// Issued but never completed, and issued before `cutoff`.
    pub fn is_stale(&self, epoch: u32, cutoff: u64) -> bool {
        self.epoch == epoch && !self.completed && self.issued_at < cutoff
    }

    /// Completed with hosts and not yet settled by a validation run.
    pub fn awaits_validation(&self) -> bool {
        self.completed
            && self.found_count.unwrap_or(0) > 0
            && matches!(
                self.validation.status,
                ValidationStatus::NotValidated | ValidationStatus::Validating
            )
    }

    /// Completed work eligible for a cross-check by `worker_id`.
    ///
    /// Batches already in `Validating` re-enter the pool once their
    /// validation issuance is older than `cutoff`.
    pub fn is_validation_candidate(&self, epoch: u32, worker_id: &str, cutoff: u64) -> bool {
        self.epoch == epoch
            && self.awaits_validation()
            && self.issued_to != worker_id
            && self.validation.is_open_at(cutoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestMethod {
    Http,
    Https,
}

impl RequestMethod {
    pub fn scheme(&self) -> &'static str {
        match self {
            RequestMethod::Http => "http",
            RequestMethod::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    Title,
    Text,
    Link,
    Image,
    Base64,
}

/// Feature content; exactly one payload slot per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum FeaturePayload {
    Title(String),
    Text(String),
    Link(String),
    Image(String),
    Base64(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl FeaturePayload {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeaturePayload::Title(_) => FeatureKind::Title,
            FeaturePayload::Text(_) => FeatureKind::Text,
            FeaturePayload::Link(_) => FeatureKind::Link,
            FeaturePayload::Image(_) => FeatureKind::Image,
            FeaturePayload::Base64(_) => FeatureKind::Base64,
        }
    }

    /// Textual content; `None` only for binary payloads.
    pub fn text(&self) -> Option<&str> {
        match self {
            FeaturePayload::Title(s)
            | FeaturePayload::Text(s)
            | FeaturePayload::Link(s)
            | FeaturePayload::Image(s) => Some(s),
            FeaturePayload::Base64(_) => None,
        }
    }

    /// Links and images can be deepened into child features.
    pub fn is_elaboratable(&self) -> bool {
        matches!(self, FeaturePayload::Link(_) | FeaturePayload::Image(_))
    }
}

/// Arena entry: parent/child edges are ids, never owned references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub host_record_id: String,
    pub parent_id: Option<String>,
    pub payload: FeaturePayload,
    pub elaborated: bool,
}

impl Feature {
    pub fn root(host_record_id: &str, payload: FeaturePayload) -> Self {
        Self {
            id: random_id(24),
            host_record_id: host_record_id.to_string(),
            parent_id: None,
            payload,
            elaborated: false,
        }
    }

    pub fn child(parent: &Feature, payload: FeaturePayload) -> Self {
        Self {
            id: random_id(24),
            host_record_id: parent.host_record_id.clone(),
            parent_id: Some(parent.id.clone()),
            payload,
            elaborated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub id: String,
    pub address_index: u32,
    pub epoch: u32,
    pub address: String,
    pub hostname: String,
    pub found_by: String,
    pub found_at: u64,
    pub method: RequestMethod,
    pub headers: Vec<HeaderEntry>,
    pub feature_ids: Vec<String>,
    pub features_elaborated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSession {
    pub id: String,
    pub nickname: Option<String>,
    pub task_slot: Option<String>,
    pub created_at: u64,
    pub last_active_at: u64,
}

impl WorkerSession {
    pub fn new(nickname: Option<String>, task_slot: Option<String>) -> Self {
        let now = now_secs();
        Self {
            id: random_id(32),
            nickname,
            task_slot,
            created_at: now,
            last_active_at: now,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
