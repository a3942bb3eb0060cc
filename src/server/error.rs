use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, Error>;

// upstream error pages are usually a full cloudflare html page, nobody needs all of it
const UPSTREAM_BODY_PREVIEW: usize = 512;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    /// target (or a redirect hop) is not on the allow-list
    #[error("domain not allowed: {0}")]
    PolicyViolation(String),

    #[error("DNS resolution failed for {0}")]
    DnsFailure(String),

    #[error("upstream fetch failed: {0}")]
    FetchFailure(String),

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),

    /// upstream answered, just not with a 200
    #[error("upstream responded with status {status}")]
    Upstream { status: StatusCode, body: String },

    #[error("internal server error: {0}")]
    InternalServerErrorWithContext(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PolicyViolation(_) => StatusCode::FORBIDDEN,
            Self::DnsFailure(_) | Self::FetchFailure(_) | Self::TooManyRedirects(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Upstream { status, .. } => *status,
            Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PolicyViolation(_) => "policy_violation",
            Self::DnsFailure(_) => "dns_failure",
            Self::FetchFailure(_) => "fetch_failure",
            Self::TooManyRedirects(_) => "too_many_redirects",
            Self::Upstream { .. } => "upstream_status",
            Self::InternalServerErrorWithContext(_) => "internal",
        }
    }

    fn body(&self) -> ErrorResponse {
        match self {
            Self::BadRequest(msg) => ErrorResponse {
                error: msg.clone(),
                details: None,
            },
            Self::PolicyViolation(target) => ErrorResponse {
                error: "Domain not allowed".to_string(),
                details: Some(target.clone()),
            },
            Self::DnsFailure(host) => ErrorResponse {
                error: "DNS resolution failed".to_string(),
                details: Some(host.clone()),
            },
            Self::FetchFailure(reason) => ErrorResponse {
                error: "Failed to reach upstream".to_string(),
                details: Some(reason.clone()),
            },
            Self::TooManyRedirects(limit) => ErrorResponse {
                error: "Too many redirects".to_string(),
                details: Some(format!("gave up after {} redirects", limit)),
            },
            Self::Upstream { status, body } => ErrorResponse {
                error: format!("Upstream responded with status {}", status.as_u16()),
                details: (!body.is_empty())
                    .then(|| body.chars().take(UPSTREAM_BODY_PREVIEW).collect()),
            },
            Self::InternalServerErrorWithContext(ctx) => ErrorResponse {
                error: "Internal proxy error".to_string(),
                details: Some(ctx.clone()),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut response = (self.status_code(), Json(self.body())).into_response();
        // browsers drop the body of a cross origin error without this, which makes debugging
        // from the player impossible
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}
