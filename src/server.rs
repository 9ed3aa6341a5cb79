//! HTTP/1 front door for the coordinator: one JSON envelope per `POST /`.

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::protocol::Request;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CoordinatorServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
}

impl CoordinatorServer {
    pub async fn bind(addr: &str, coordinator: Arc<Coordinator>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr.to_string(), e))?;
        Ok(Self { listener, coordinator })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves. In-flight connections
    /// are left to finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.local_addr()?, "coordinator listening");
        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                let service = service_fn(move |req| handle_http(Arc::clone(&coordinator), req));
                if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                    debug!(%peer, error = %e, "connection closed with error");
                }
            });
        }
        info!("coordinator listener stopped");
        Ok(())
    }

    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }
}

async fn handle_http(
    coordinator: Arc<Coordinator>,
    req: hyper::Request<Incoming>,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST || req.uri().path() != "/" {
        let status = if req.method() != Method::POST {
            StatusCode::METHOD_NOT_ALLOWED
        } else {
            StatusCode::NOT_FOUND
        };
        return Ok(plain(status, ""));
    }

    let body = match Limited::new(req.into_body(), Config::MAX_CONTENT_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(plain(StatusCode::BAD_REQUEST, &format!("unreadable body: {}", e))),
    };

    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Ok(plain(StatusCode::BAD_REQUEST, &format!("malformed envelope: {}", e))),
    };

    let response = coordinator.handle(request).await;
    match serde_json::to_vec(&response) {
        Ok(json) => {
            let mut http = hyper::Response::new(Full::new(Bytes::from(json)));
            http.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            Ok(http)
        }
        Err(e) => Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

fn plain(status: StatusCode, message: &str) -> hyper::Response<Full<Bytes>> {
    let mut response = hyper::Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::protocol::{ConnectResponse, RequestType, Response};
    use crate::store::MemoryStore;

    async fn spawn_server() -> String {
        let config = CoordinatorConfig {
            background_tasks: false,
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::start(config, Arc::new(MemoryStore::new())).await.unwrap();
        let server = CoordinatorServer::bind("127.0.0.1:0", coordinator).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_envelope_round_trip() {
        let url = spawn_server().await;
        let client = reqwest::Client::new();

        let mut request = Request::new(RequestType::Connect);
        request.nickname = Some("http-worker".into());
        let reply = client.post(&url).json(&request).send().await.unwrap();
        assert_eq!(reply.status(), 200);
        let response: Response = reply.json().await.unwrap();
        assert!(response.success);
        let connected: ConnectResponse = response.decode().unwrap().unwrap();
        assert_eq!(connected.worker_id.len(), 32);
    }

    #[tokio::test]
    async fn test_transport_errors() {
        let url = spawn_server().await;
        let client = reqwest::Client::new();

        let get = client.get(&url).send().await.unwrap();
        assert_eq!(get.status(), 405);

        let garbage = client.post(&url).body("{not json").send().await.unwrap();
        assert_eq!(garbage.status(), 400);

        // Endpoint failures are still 200 with an unsuccessful envelope.
        let range = client.post(&url).json(&Request::new(RequestType::NewAddressRange)).send().await.unwrap();
        assert_eq!(range.status(), 200);
        let response: Response = range.json().await.unwrap();
        assert!(!response.success);
    }
}
