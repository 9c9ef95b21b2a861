//! JSON responses sent to BFF clients and probes.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

use crate::core::AggregationError;

use super::request::REQUEST_ID_HEADER;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    pub message: String,
    #[serde(rename = "causingCall", skip_serializing_if = "Option::is_none")]
    pub causing_call: Option<&'a str>,
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(body) => Self::build(status, body, content_type::APPLICATION_JSON),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::error_http(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                )
            }
        }
    }

    pub fn error_json(status: StatusCode, kind: &str, message: String) -> Response<Vec<u8>> {
        Self::json(
            status,
            &ErrorBody {
                error: kind,
                message,
                causing_call: None,
            },
        )
    }

    pub fn aggregation_error(err: &AggregationError) -> Response<Vec<u8>> {
        Self::json(
            err.status(),
            &ErrorBody {
                error: err.kind(),
                message: err.to_string(),
                causing_call: err.causing_call(),
            },
        )
    }

    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Self::build(status, message.as_bytes().to_vec(), content_type::TEXT_PLAIN)
    }

    pub fn text(body: Vec<u8>, content_type: &str) -> Response<Vec<u8>> {
        Self::build(StatusCode::OK, body, content_type)
    }

    fn build(status: StatusCode, body: Vec<u8>, content_type: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("Failed to build response: {}", e);
                let mut response = Response::new(b"Internal Server Error".to_vec());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            })
    }

    /// Tags `response` with the request id, skipping ids that are not valid header values.
    pub fn with_request_id(mut response: Response<Vec<u8>>, request_id: &str) -> Response<Vec<u8>> {
        match HeaderValue::from_str(request_id) {
            Ok(value) => {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Err(e) => log::warn!("Invalid request id '{}': {}", request_id, e),
        }
        response
    }
}
