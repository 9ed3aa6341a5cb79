//! Best-effort hostname discovery from a host's TLS certificate.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

use crate::config::Config;

#[async_trait]
pub trait CertificateNames: Send + Sync {
    /// DNS name presented by `address:443`, if any.
    async fn hostname_for(&self, address: &str) -> Option<String>;
}

/// Raw handshake on port 443 with validation disabled.
pub struct TlsCertificateProbe {
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TlsCertificateProbe {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(Config::TLS_CONNECT_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(Config::TLS_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    async fn peer_certificate_der(&self, address: &str) -> Option<Vec<u8>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((address, 443)))
            .await
            .ok()?
            .ok()?;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .use_sni(false)
            .build()
            .ok()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls = match timeout(self.handshake_timeout, connector.connect(address, stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!(address, error = %e, "tls handshake failed");
                return None;
            }
            Err(_) => return None,
        };

        let certificate = tls.get_ref().peer_certificate().ok()??;
        certificate.to_der().ok()
    }
}

impl Default for TlsCertificateProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateNames for TlsCertificateProbe {
    async fn hostname_for(&self, address: &str) -> Option<String> {
        let der = self.peer_certificate_der(address).await?;
        hostname_from_der(&der)
    }
}

/// First subject-alternative DNS name, else the subject common name.
pub fn hostname_from_der(der: &[u8]) -> Option<String> {
    let (_, certificate) = parse_x509_certificate(der).ok()?;

    if let Ok(Some(san)) = certificate.subject_alternative_name() {
        let dns = san.value.general_names.iter().find_map(|name| match name {
            GeneralName::DNSName(dns) if !dns.is_empty() => Some(dns.to_string()),
            _ => None,
        });
        if dns.is_some() {
            return dns;
        }
    }

    certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::trim)
        .filter(|cn| !cn.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{Certificate, CertificateParams, DnType, SanType};
    use std::net::{IpAddr, Ipv4Addr};

    fn certificate_der(common_name: &str, alt_names: Vec<SanType>) -> Vec<u8> {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.subject_alt_names = alt_names;
        Certificate::from_params(params).unwrap().serialize_der().unwrap()
    }

    #[test]
    fn test_alt_dns_name_wins_over_common_name() {
        let der = certificate_der(
            "fallback.example.org",
            vec![
                SanType::IpAddress(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))),
                SanType::DnsName("nvr.example.com".into()),
                SanType::DnsName("second.example.com".into()),
            ],
        );
        assert_eq!(hostname_from_der(&der), Some("nvr.example.com".to_string()));
    }

    #[test]
    fn test_common_name_when_no_alt_dns_name() {
        let der = certificate_der("camera.example.net", vec![]);
        assert_eq!(hostname_from_der(&der), Some("camera.example.net".to_string()));

        let der = certificate_der(
            "router.example.net",
            vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))],
        );
        assert_eq!(hostname_from_der(&der), Some("router.example.net".to_string()));
    }

    #[test]
    fn test_garbage_der_yields_nothing() {
        assert_eq!(hostname_from_der(&[]), None);
        assert_eq!(hostname_from_der(b"definitely not a certificate"), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_yields_nothing() {
        let probe = TlsCertificateProbe {
            connect_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
        };
        // TEST-NET-1 is never routed; the connect either fails or times out.
        assert_eq!(probe.hostname_for("192.0.2.1").await, None);
    }
}
