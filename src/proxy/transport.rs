//! Wire-level access to upstream services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use pingora::services::background::{background_service, GenBackgroundService};
use pingora_core::connectors::http::Connector;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::Result;
use pingora_http::RequestHeader;
use pingora_load_balancing::{selection::RoundRobin, Backends, LoadBalancer};
use url::form_urlencoded;

use crate::config::{self, HttpMethod, UpstreamScheme};
use crate::core::CallError;

use super::discovery::NodeDiscovery;

/// A rendered request for one upstream operation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.query)
            .finish();
        format!("{}?{}", self.path, query)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Sends one request to one upstream service. Implementations own the
/// connection reuse for their service.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, CallError>;
}

/// Everything outside the RFC 3986 unreserved set.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encodes `value` for use as a single path segment.
pub fn encode_path_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// HTTP/1.1 and h2 transport over pingora's pooled connector.
pub struct HttpTransport {
    service_id: String,
    connector: Connector,
    backends: Arc<LoadBalancer<RoundRobin>>,
    scheme: UpstreamScheme,
    host: Option<String>,
    keepalive: Duration,
}

impl HttpTransport {
    /// Builds the transport and the background service that keeps its
    /// node list resolved. The background service must be added to the
    /// server for the transport to find any backend.
    pub fn new(
        service: &config::Service,
    ) -> Result<(Self, GenBackgroundService<LoadBalancer<RoundRobin>>)> {
        let discovery = NodeDiscovery::try_from(service)?;
        let mut lb = LoadBalancer::<RoundRobin>::from_backends(Backends::new(Box::new(discovery)));
        lb.update_frequency = service.discovery_interval.map(Duration::from_secs);

        let background = background_service(&format!("discovery {}", service.id), lb);
        let backends = background.task();

        let transport = Self {
            service_id: service.id.clone(),
            connector: Connector::new(None),
            backends,
            scheme: service.scheme,
            host: service.host.clone(),
            keepalive: Duration::from_millis(service.keepalive_ms),
        };
        Ok((transport, background))
    }

    fn select_peer(&self) -> Result<(HttpPeer, String), CallError> {
        let backend = self.backends.select(b"", 256).ok_or_else(|| {
            CallError::ConnectionFailure(format!("no backend for service {}", self.service_id))
        })?;
        let address = backend.addr.to_string();
        let peer = match backend.ext.get::<HttpPeer>() {
            Some(peer) => peer.clone(),
            None => HttpPeer::new(
                address.as_str(),
                self.scheme == UpstreamScheme::HTTPS,
                self.host.clone().unwrap_or_default(),
            ),
        };
        let host = self.host.clone().unwrap_or(address);
        Ok((peer, host))
    }

    fn build_header(&self, request: &UpstreamRequest, host: &str) -> Result<RequestHeader> {
        let path = request.path_and_query();
        let mut header =
            RequestHeader::build(request.method.to_string().as_str(), path.as_bytes(), None)?;
        header.insert_header(header::HOST, host)?;
        header.insert_header(header::ACCEPT, "application/json")?;
        for (name, value) in &request.headers {
            header.insert_header(name.clone(), value.as_str())?;
        }
        match &request.body {
            Some(body) => {
                header.insert_header(header::CONTENT_TYPE, "application/json")?;
                header.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
            }
            None if !request.method.uses_query() => {
                header.insert_header(header::CONTENT_LENGTH, "0")?;
            }
            None => {}
        }
        Ok(header)
    }
}

fn connection_failure(e: Box<pingora_error::Error>) -> CallError {
    CallError::ConnectionFailure(e.to_string())
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, CallError> {
        let (peer, host) = self.select_peer()?;
        let header = self
            .build_header(&request, &host)
            .map_err(connection_failure)?;

        let (mut session, reused) = self
            .connector
            .get_http_session(&peer)
            .await
            .map_err(connection_failure)?;
        log::trace!(
            "{} {} on {} connection to {}",
            request.method,
            request.path,
            if reused { "reused" } else { "new" },
            host
        );

        session
            .write_request_header(Box::new(header))
            .await
            .map_err(connection_failure)?;
        match request.body {
            Some(body) => session.write_request_body(body, true).await,
            None => session.finish_request_body().await,
        }
        .map_err(connection_failure)?;

        session
            .read_response_header()
            .await
            .map_err(connection_failure)?;
        let status = session
            .response_header()
            .map(|h| h.status.as_u16())
            .ok_or_else(|| CallError::ConnectionFailure("missing response header".into()))?;

        let mut body = Vec::new();
        while let Some(chunk) = session
            .read_response_body()
            .await
            .map_err(connection_failure)?
        {
            body.extend_from_slice(&chunk);
        }

        self.connector
            .release_http_session(session, &peer, Some(self.keepalive))
            .await;

        Ok(UpstreamResponse {
            status,
            body: Bytes::from(body),
        })
    }
}
