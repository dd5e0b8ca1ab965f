use thiserror::Error;

/// Failure taxonomy for everything on the request path.
///
/// Cloneable so a single refresh outcome can be handed to every request
/// queued behind it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Circuit open for '{key}' - retry in {retry_after_ms}ms")]
    CircuitOpen { key: String, retry_after_ms: u64 },

    #[error("No active session")]
    NoSession,

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Token refresh abandoned before it settled")]
    RefreshAbandoned,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Prefer the server's `message`/`error` field over the raw body.
    fn body_message(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for field in ["message", "error", "detail"] {
                if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                    return Self::truncate_body(text);
                }
            }
        }
        Self::truncate_body(body)
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::body_message(body);
        match status {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            408 => ApiError::Timeout,
            429 => ApiError::RateLimited,
            400..=499 => ApiError::Validation { status, message },
            500..=599 => ApiError::ServerError { status, message },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Transient failures worth another attempt: timeouts, connection
    /// failures, 5xx and 429. Client errors (including 401) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout
                | ApiError::RateLimited
                | ApiError::ServerError { .. }
                | ApiError::NetworkError(_)
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ApiError::CircuitOpen { .. })
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Validation { message, .. } => message.clone(),
            ApiError::AccessDenied(_) => {
                "You do not have permission to perform this action.".to_string()
            }
            ApiError::Unauthorized => {
                "Invalid credentials. Please check your email and password.".to_string()
            }
            ApiError::NotFound(_) => "The requested resource was not found.".to_string(),
            ApiError::Timeout | ApiError::NetworkError(_) => {
                "Unable to reach the server. Check your connection and try again.".to_string()
            }
            ApiError::RateLimited => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            ApiError::ServerError { .. } => {
                "The server encountered an error. Please try again later.".to_string()
            }
            ApiError::CircuitOpen { .. } => {
                "The service is temporarily degraded. Please try again shortly.".to_string()
            }
            ApiError::NoSession
            | ApiError::SessionExpired
            | ApiError::RefreshAbandoned
            | ApiError::InvalidToken(_) => {
                "Your session has expired. Please log in again.".to_string()
            }
            ApiError::InvalidResponse(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidResponse(err.to_string())
    }
}
