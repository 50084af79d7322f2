/*
This file contains the error type of the webhook.
Errors raised while serving one admission exchange
are mapped to an HTTP status by the IntoResponse impl.
*/

use axum::{
    Json,
    http::StatusCode,
    response::{
        IntoResponse,
        Response
    }
};



#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    // The admission review carried no usable request.
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    // The object under admission could not be decoded.
    #[error("cannot decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cannot build patch: {0}")]
    Patch(String),

    #[error("cannot load TLS material: {0}")]
    Tls(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebhookError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, WebhookError::InvalidReview(_) | WebhookError::Decode { .. })
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_bad_request() {
        let response = WebhookError::InvalidReview("no request".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let response = WebhookError::Decode { kind: "Pod", source }.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_errors_map_to_internal_error() {
        let response = WebhookError::Patch("diff failed".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "tls.crt");
        assert_eq!(WebhookError::from(io).into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
