use std::error::Error;
use std::fmt::Display;

use actix_web::{HttpResponseBuilder, ResponseError, http::StatusCode};
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
pub enum HubError {
    /// Missing or malformed query parameter.
    BadRequest(String),
    /// The upstream connect attempt or handshake failed.
    ConnectFailed(String),
    /// The upstream connection closed before a reply arrived.
    UpstreamGone,
    /// A correlated request exceeded its deadline.
    RequestTimeout(String),
    /// Upstream rejected a subscribe request.
    SubscribeFailed(String),
    /// An inbound frame could not be decoded.
    ParseError(String),
    /// A subscriber write failed or its connection was cancelled.
    SubscriberGone,
    /// Storage backend failure.
    PersistenceError(String),
    /// The taxonomy could not be fetched and no cached copy exists.
    HierarchyUnavailable(String),
    /// The results upstream returned an unusable response.
    ResultsFetchError(String),
    /// An invariant violation. The hub keeps running.
    Fatal(String),
}

impl Error for HubError {}

impl Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::BadRequest(msg) => write!(f, "{msg}"),
            HubError::ConnectFailed(why) => write!(f, "could not connect upstream: {why}"),
            HubError::UpstreamGone => write!(f, "upstream connection closed"),
            HubError::RequestTimeout(cmd) => write!(f, "upstream request timed out: {cmd}"),
            HubError::SubscribeFailed(why) => write!(f, "upstream rejected subscribe: {why}"),
            HubError::ParseError(msg) => write!(f, "{msg}"),
            HubError::SubscriberGone => write!(f, "subscriber gone"),
            HubError::PersistenceError(msg) => write!(f, "{msg}"),
            HubError::HierarchyUnavailable(why) => {
                write!(f, "hierarchy unavailable: {why}")
            }
            HubError::ResultsFetchError(why) => write!(f, "results fetch failed: {why}"),
            HubError::Fatal(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl ResponseError for HubError {
    fn status_code(&self) -> StatusCode {
        match self {
            HubError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HubError::ConnectFailed(_) | HubError::UpstreamGone | HubError::SubscribeFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            HubError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse<actix_web::body::BoxBody> {
        HttpResponseBuilder::new(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(value: serde_json::Error) -> Self {
        HubError::ParseError(value.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            HubError::RequestTimeout(value.to_string())
        } else {
            HubError::ResultsFetchError(value.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let err = HubError::BadRequest("missing sportId".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upstream_errors_map_to_bad_gateway() {
        assert_eq!(HubError::UpstreamGone.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            HubError::SubscribeFailed("code 12".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn request_timeout_maps_to_gateway_timeout() {
        let err = HubError::RequestTimeout("get".into());
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
