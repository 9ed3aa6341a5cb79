use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::models::{FeaturePayload, RequestMethod};
use crate::network::HttpClient;
use crate::parser::extract_features;
use crate::protocol::FeatureWorkItem;

#[async_trait]
pub trait Elaborate: Send + Sync {
    /// Child payloads for `item`, or `None` when nothing could be produced.
    async fn elaborate(&self, item: &FeatureWorkItem) -> Option<Vec<FeaturePayload>>;
}

/// Deepens links into page features and images into their bytes.
pub struct FeatureElaborator {
    http: Arc<HttpClient>,
}

impl FeatureElaborator {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Elaborate for FeatureElaborator {
    async fn elaborate(&self, item: &FeatureWorkItem) -> Option<Vec<FeaturePayload>> {
        let (target, is_image) = match &item.payload {
            FeaturePayload::Image(src) => (src, true),
            FeaturePayload::Link(href) => (href, false),
            _ => return None,
        };
        let host = if item.hostname.is_empty() { &item.address } else { &item.hostname };
        let url = resolve_feature_uri(target, item.method, host)?;

        let response = match self.http.fetch(&url).await {
            Ok(response) => response,
            Err(e) => {
                debug!(feature = %item.feature_id, url = %url, error = %e, "elaboration fetch failed");
                return None;
            }
        };

        if is_image {
            return Some(vec![FeaturePayload::Base64(response.body.to_vec())]);
        }

        let children = extract_features(&response.text(), &response.final_url);
        (!children.is_empty()).then_some(children)
    }
}

/// Host-relative paths resolve against `method://hostname`; absolute
/// http(s) URLs pass through; anything else is unresolvable.
pub fn resolve_feature_uri(content: &str, method: RequestMethod, hostname: &str) -> Option<Url> {
    let content = content.trim();
    if let Some(rest) = content.strip_prefix("//") {
        return Url::parse(&format!("{}://{}", method.scheme(), rest)).ok();
    }
    if content.starts_with('/') {
        return Url::parse(&format!("{}://{}{}", method.scheme(), hostname, content)).ok();
    }
    let lower = content.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Url::parse(content).ok();
    }
    None
}
