use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::ApiError;

/// Scratch space stages use to pass data along one execution.
pub type Metadata = HashMap<String, Value>;

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// An outgoing request as seen by the pipeline.
///
/// Header names are stored lowercased. A request belongs to exactly one
/// pipeline execution; replays work on a clone.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub url: String,
    pub method: Method,
    headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
    auth_retry: bool,
    skip_auth: bool,
}

impl RequestContext {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HashMap::new(),
            body: None,
            metadata: Metadata::new(),
            timeout: None,
            auth_retry: false,
            skip_auth: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Exclude this request from bearer token injection.
    pub fn without_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize(name)).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(normalize(name), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&normalize(name))
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn skips_auth(&self) -> bool {
        self.skip_auth
    }

    /// Whether this request is already the replay of a 401'd request.
    pub fn is_auth_retry(&self) -> bool {
        self.auth_retry
    }

    pub fn mark_auth_retry(&mut self) {
        self.auth_retry = true;
    }

    /// Key used for execution metrics.
    pub fn execution_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// A response produced by the transport or injected by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseContext {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub data: Value,
    pub metadata: Metadata,
}

impl ResponseContext {
    pub fn new(status: u16, data: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            data,
            metadata: Metadata::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(normalize(name), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize(name)).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the response body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Body rendered back to text, for error messages.
    pub fn body_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// The unit of state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub request: RequestContext,
    pub response: Option<ResponseContext>,
    pub error: Option<ApiError>,
    pub metadata: Metadata,
}

impl MiddlewareContext {
    pub fn new(request: RequestContext) -> Self {
        Self {
            request,
            response: None,
            error: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_response(mut self, response: ResponseContext) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: ApiError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// True when the request failed authentication: either a 401 error or
    /// a 401 response not yet converted into one.
    pub fn is_unauthorized(&self) -> bool {
        if self.error.as_ref().is_some_and(ApiError::is_unauthorized) {
            return true;
        }
        self.error.is_none() && self.response.as_ref().is_some_and(|r| r.status == 401)
    }

    pub fn into_result(self) -> Result<ResponseContext, ApiError> {
        match (self.error, self.response) {
            (Some(error), _) => Err(error),
            (None, Some(response)) => Ok(response),
            (None, None) => Err(ApiError::InvalidResponse(format!(
                "no response produced for {}",
                self.request.execution_key()
            ))),
        }
    }
}
