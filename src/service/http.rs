use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use pingora::services::listening::Service;
use serde_json::Value as JsonValue;

use crate::config::Config;
use crate::core::metrics;
use crate::proxy::{BffRouter, InboundRequest};
use crate::utils::request::{get_req_header_value, header_pairs, parse_query, REQUEST_ID_HEADER};
use crate::utils::response::ResponseBuilder;

/// Inbound request bodies above this size are rejected.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum PathShape {
    Operation,
    ProfiledOperation,
}

/// Client facing HTTP application.
///
/// Accepts `GET|POST /{operation}` and `/{profile}/{operation}`; the
/// profile header takes precedence over the path prefix.
pub struct BffHttpApp {
    router: Arc<BffRouter>,
    paths: matchit::Router<PathShape>,
    profile_header: String,
}

impl BffHttpApp {
    pub fn new(router: Arc<BffRouter>, profile_header: &str) -> Self {
        let mut paths = matchit::Router::new();
        // both routes are static and distinct
        let _ = paths.insert("/{operation}", PathShape::Operation);
        let _ = paths.insert("/{profile}/{operation}", PathShape::ProfiledOperation);

        Self {
            router,
            paths,
            profile_header: profile_header.to_ascii_lowercase(),
        }
    }

    pub fn bff_http_service(config: &Config, router: Arc<BffRouter>) -> Service<Self> {
        let app = Self::new(router, &config.pingbff.profile_header);
        Service::new("pingbff HTTP".to_string(), app)
    }

    /// Turns the parts of an HTTP request into an aggregation request, or
    /// into the error response the client gets instead.
    fn inbound_request(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<InboundRequest, Response<Vec<u8>>> {
        if *method != Method::GET && *method != Method::POST {
            return Err(ResponseBuilder::error_json(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("method {method} is not supported"),
            ));
        }

        let path = uri.path();
        let matched = self.paths.at(path).map_err(|_| {
            ResponseBuilder::error_json(
                StatusCode::NOT_FOUND,
                "UnknownOperation",
                format!("no operation at path '{path}'"),
            )
        })?;
        let operation = matched.params.get("operation").unwrap_or_default().to_string();
        let path_profile = match matched.value {
            PathShape::ProfiledOperation => matched.params.get("profile").map(str::to_string),
            PathShape::Operation => None,
        };
        let profile = get_req_header_value(headers, &self.profile_header)
            .map(str::to_string)
            .or(path_profile);

        let mut params = parse_query(uri.query());
        if !body.is_empty() {
            match serde_json::from_slice::<JsonValue>(body) {
                Ok(JsonValue::Object(fields)) => params.extend(fields),
                Ok(_) => {
                    return Err(ResponseBuilder::error_json(
                        StatusCode::BAD_REQUEST,
                        "BadRequest",
                        "request body must be a JSON object".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(ResponseBuilder::error_json(
                        StatusCode::BAD_REQUEST,
                        "BadRequest",
                        format!("malformed JSON body: {e}"),
                    ))
                }
            }
        }

        Ok(InboundRequest {
            operation,
            profile,
            params,
            headers: header_pairs(headers),
        })
    }

    /// Serves one request end to end, without touching the session.
    pub async fn respond(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Response<Vec<u8>> {
        let started = Instant::now();
        let request_id = get_req_header_value(headers, REQUEST_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let request = match self.inbound_request(method, uri, headers, body) {
            Ok(request) => request,
            Err(response) => {
                log::info!(
                    "[{}] {} {} -> {}",
                    request_id,
                    method,
                    uri.path(),
                    response.status().as_u16()
                );
                return ResponseBuilder::with_request_id(response, &request_id);
            }
        };

        let profile = request.profile.as_deref().unwrap_or("-");
        let (response, partial) = match self.router.handle(&request).await {
            Ok(aggregated) => {
                let partial = aggregated.partial;
                (ResponseBuilder::json(StatusCode::OK, &aggregated), partial)
            }
            Err(err) => (ResponseBuilder::aggregation_error(&err), false),
        };

        let status = response.status().as_u16();
        metrics::record_request(&request.operation, profile, status, partial);
        log::info!(
            "[{}] {} {} profile={} status={} partial={} elapsed={:?}",
            request_id,
            method,
            request.operation,
            profile,
            status,
            partial,
            started.elapsed()
        );

        ResponseBuilder::with_request_id(response, &request_id)
    }
}

async fn read_body(session: &mut ServerSession) -> Result<Bytes, Response<Vec<u8>>> {
    let mut body = BytesMut::new();
    loop {
        match session.read_request_body().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > MAX_BODY_BYTES {
                    return Err(ResponseBuilder::error_json(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "RequestTooLarge",
                        format!("request body exceeds {MAX_BODY_BYTES} bytes"),
                    ));
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(body.freeze()),
            Err(e) => {
                return Err(ResponseBuilder::error_json(
                    StatusCode::BAD_REQUEST,
                    "BadRequest",
                    format!("failed to read request body: {e}"),
                ))
            }
        }
    }
}

#[async_trait]
impl ServeHttp for BffHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        let body = match read_body(http_session).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        let header = http_session.req_header();
        self.respond(&header.method, &header.uri, &header.headers, &body)
            .await
    }
}
