use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::address::is_ipv4_literal;
use crate::certificate::CertificateNames;
use crate::models::RequestMethod;
use crate::network::{FetchError, HttpClient};
use crate::parser::extract_features;
use crate::protocol::DiscoveredHost;

#[async_trait]
pub trait Probe: Send + Sync {
    /// One GET against `method://address`; `None` on any failure.
    async fn probe(&self, address_index: u32, address: &str, method: RequestMethod) -> Option<DiscoveredHost>;

    /// Fleet-wide timeout for subsequent probes.
    fn set_timeout(&self, timeout: Duration) -> Result<(), FetchError>;
}

pub struct HostProber {
    http: Arc<HttpClient>,
    certificates: Arc<dyn CertificateNames>,
}

impl HostProber {
    pub fn new(http: Arc<HttpClient>, certificates: Arc<dyn CertificateNames>) -> Self {
        Self { http, certificates }
    }

    /// Apply the hostname policy to the host a probe ended on.
    async fn resolve_hostname(&self, final_host: Option<&str>, address: &str, method: RequestMethod) -> String {
        let hostname = reconcile_hostname(final_host, address);
        if needs_certificate_lookup(method, &hostname, address)
            && let Some(name) = self.certificates.hostname_for(address).await
        {
            return name;
        }
        hostname
    }
}

#[async_trait]
impl Probe for HostProber {
    async fn probe(&self, address_index: u32, address: &str, method: RequestMethod) -> Option<DiscoveredHost> {
        let url = Url::parse(&format!("{}://{}/", method.scheme(), address)).ok()?;
        let response = match self.http.fetch(&url).await {
            Ok(response) => response,
            Err(e) => {
                debug!(address, error = %e, "probe failed");
                return None;
            }
        };

        let hostname = self
            .resolve_hostname(response.final_url.host_str(), address, method)
            .await;

        let features = extract_features(&response.text(), &url);
        Some(DiscoveredHost {
            address_index,
            address: address.to_string(),
            hostname,
            method,
            headers: response.headers,
            features,
        })
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), FetchError> {
        self.http.set_timeout(timeout)
    }
}

/// Trust the redirect target's host unless it is empty, `localhost`, or a
/// different IPv4 literal; those fall back to the probed address.
pub fn reconcile_hostname(final_host: Option<&str>, probed: &str) -> String {
    let host = final_host.map(str::trim).unwrap_or("");
    if host.is_empty() || host.eq_ignore_ascii_case("localhost") || (is_ipv4_literal(host) && host != probed) {
        return probed.to_string();
    }
    host.to_string()
}

pub fn needs_certificate_lookup(method: RequestMethod, hostname: &str, probed: &str) -> bool {
    method == RequestMethod::Https && (hostname.is_empty() || hostname == probed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, LOCATION};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Answers with a fixed name and counts lookups.
    #[derive(Default)]
    struct FixedNames {
        name: Option<String>,
        lookups: AtomicUsize,
    }

    impl FixedNames {
        fn answering(name: &str) -> Self {
            Self {
                name: Some(name.to_string()),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CertificateNames for FixedNames {
        async fn hostname_for(&self, _address: &str) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.name.clone()
        }
    }

    #[derive(Clone, Copy)]
    enum Root {
        Page,
        RedirectToLocalhost,
        Missing,
    }

    /// Serves `/` per `root` on an ephemeral port; `/home` is always the page.
    async fn spawn_device(root: Root) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let port = addr.port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| async move {
                        let page = || {
                            let mut page = hyper::Response::new(Full::new(Bytes::from_static(
                                b"<html><title>Camera</title><body>live view</body></html>",
                            )));
                            let headers = page.headers_mut();
                            headers.insert("server", HeaderValue::from_static("tiny-httpd"));
                            headers.insert("x-empty", HeaderValue::from_static(""));
                            page
                        };
                        let response = match (req.uri().path(), root) {
                            ("/home", _) | ("/", Root::Page) => page(),
                            ("/", Root::RedirectToLocalhost) => {
                                let mut moved = hyper::Response::new(Full::new(Bytes::new()));
                                *moved.status_mut() = hyper::StatusCode::FOUND;
                                let target = format!("http://localhost:{}/home", port);
                                moved
                                    .headers_mut()
                                    .insert(LOCATION, HeaderValue::from_str(&target).unwrap());
                                moved
                            }
                            _ => {
                                let mut missing = hyper::Response::new(Full::new(Bytes::from_static(b"gone")));
                                *missing.status_mut() = hyper::StatusCode::NOT_FOUND;
                                missing
                            }
                        };
                        Ok::<_, Infallible>(response)
                    });
                    let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
                });
            }
        });
        addr.to_string()
    }

    fn prober(names: Arc<FixedNames>) -> HostProber {
        HostProber::new(Arc::new(HttpClient::new("test".into(), 5).unwrap()), names)
    }

    #[tokio::test]
    async fn test_page_becomes_discovered_host() {
        let address = spawn_device(Root::Page).await;
        let names = Arc::new(FixedNames::default());
        let host = prober(names.clone())
            .probe(7, &address, RequestMethod::Http)
            .await
            .unwrap();

        assert_eq!(host.address_index, 7);
        assert_eq!(host.address, address);
        assert_eq!(host.hostname, address);
        assert_eq!(host.method, RequestMethod::Http);
        assert!(host.headers.iter().any(|h| h.name == "server" && h.value == "tiny-httpd"));
        assert!(host.headers.iter().all(|h| h.name != "x-empty"));
        assert_eq!(host.features[0], crate::models::FeaturePayload::Title("Camera".into()));
        assert_eq!(names.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_success_status_is_not_a_host() {
        let address = spawn_device(Root::Missing).await;
        let names = Arc::new(FixedNames::default());
        assert!(prober(names).probe(1, &address, RequestMethod::Http).await.is_none());
    }

    #[tokio::test]
    async fn test_redirect_to_localhost_keeps_probed_address() {
        let address = spawn_device(Root::RedirectToLocalhost).await;
        let names = Arc::new(FixedNames::default());
        let host = prober(names).probe(2, &address, RequestMethod::Http).await.unwrap();
        assert_eq!(host.hostname, address);
        assert_eq!(host.features[0], crate::models::FeaturePayload::Title("Camera".into()));
    }

    #[tokio::test]
    async fn test_https_bare_address_asks_certificate() {
        let names = Arc::new(FixedNames::answering("nvr.example.com"));
        let prober = prober(names.clone());

        let name = prober.resolve_hostname(Some("203.0.113.9"), "203.0.113.9", RequestMethod::Https).await;
        assert_eq!(name, "nvr.example.com");
        assert_eq!(names.lookups.load(Ordering::SeqCst), 1);

        let name = prober.resolve_hostname(None, "203.0.113.9", RequestMethod::Https).await;
        assert_eq!(name, "nvr.example.com");
        assert_eq!(names.lookups.load(Ordering::SeqCst), 2);

        let name = prober
            .resolve_hostname(Some("portal.example.net"), "203.0.113.9", RequestMethod::Https)
            .await;
        assert_eq!(name, "portal.example.net");
        let name = prober.resolve_hostname(None, "203.0.113.9", RequestMethod::Http).await;
        assert_eq!(name, "203.0.113.9");
        assert_eq!(names.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_certificate_without_name_keeps_address() {
        let names = Arc::new(FixedNames::default());
        let name = prober(names.clone())
            .resolve_hostname(Some("localhost"), "203.0.113.9", RequestMethod::Https)
            .await;
        assert_eq!(name, "203.0.113.9");
        assert_eq!(names.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_localhost_is_replaced_by_probed_address() {
        assert_eq!(reconcile_hostname(Some("localhost"), "203.0.113.9"), "203.0.113.9");
        assert_eq!(reconcile_hostname(Some("LOCALHOST"), "203.0.113.9"), "203.0.113.9");
    }

    #[test]
    fn test_foreign_ipv4_literal_is_replaced() {
        assert_eq!(reconcile_hostname(Some("203.0.113.5"), "203.0.113.9"), "203.0.113.9");
        assert_eq!(reconcile_hostname(Some("203.0.113.9"), "203.0.113.9"), "203.0.113.9");
    }

    #[test]
    fn test_redirect_host_is_kept() {
        assert_eq!(reconcile_hostname(Some("portal.example.net"), "203.0.113.9"), "portal.example.net");
        assert_eq!(reconcile_hostname(None, "203.0.113.9"), "203.0.113.9");
        assert_eq!(reconcile_hostname(Some("  "), "203.0.113.9"), "203.0.113.9");
    }

    #[test]
    fn test_certificate_lookup_policy() {
        assert!(needs_certificate_lookup(RequestMethod::Https, "203.0.113.9", "203.0.113.9"));
        assert!(needs_certificate_lookup(RequestMethod::Https, "", "203.0.113.9"));
        assert!(!needs_certificate_lookup(RequestMethod::Http, "203.0.113.9", "203.0.113.9"));
        assert!(!needs_certificate_lookup(RequestMethod::Https, "portal.example.net", "203.0.113.9"));
    }
}
