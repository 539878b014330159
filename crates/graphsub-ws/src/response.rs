//! GraphQL-style HTTP error responses.
//!
//! Used by the upgrade path when a request cannot be switched to a
//! WebSocket; the body keeps the standard GraphQL envelope so clients can
//! handle transport failures with the same code path as execution errors.

use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use graphsub_core::GraphQLError;

/// The standard GraphQL HTTP response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Execution result; always null for transport-level failures.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Errors explaining the failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

/// Build an error response with the given status and errors.
pub fn send_error(status: StatusCode, errors: Vec<GraphQLError>) -> Response<Full<Bytes>> {
    let body = GraphQLResponse { data: None, errors };
    let json = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

/// Build an error response carrying a single message.
pub fn send_error_message(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    send_error(status, vec![GraphQLError::new(message)])
}
