use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Status,
    core::{metrics, status},
    utils::response::ResponseBuilder,
};

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Probe and scrape endpoints, kept off the client listeners.
///
/// - `/status/ready`: 200 once every plan is compiled, 503 before
/// - `/metrics`: prometheus text exposition
pub struct StatusHttpApp;

impl StatusHttpApp {
    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let mut service = Service::new("Status HTTP".to_string(), StatusHttpApp);
        service.add_tcp(&cfg.address.to_string());
        service
    }

    fn route(&self, path: &str) -> Response<Vec<u8>> {
        match path {
            "/status/ready" => handle_ready_endpoint(),
            "/metrics" => ResponseBuilder::text(
                metrics::gather(),
                "text/plain; version=0.0.4",
            ),
            _ => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        self.route(http_session.req_header().uri.path())
    }
}

fn handle_ready_endpoint() -> Response<Vec<u8>> {
    if status::is_ready() {
        let response = StatusResponse {
            status: "ok".to_string(),
            error: None,
        };
        ResponseBuilder::json(StatusCode::OK, &response)
    } else {
        let response = StatusResponse {
            status: "error".to_string(),
            error: Some("Plans not loaded yet".to_string()),
        };
        ResponseBuilder::json(StatusCode::SERVICE_UNAVAILABLE, &response)
    }
}
