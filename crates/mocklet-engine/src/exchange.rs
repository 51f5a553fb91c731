//! The live request/response pair and its per-request state.

use crate::error::EngineError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Lifecycle phase of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    RequestReceived,
    ResponseSent,
}

/// Immutable snapshot of the inbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub form_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// Filled by the dispatcher once a placeholder route has matched.
    pub path_params: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query_params: HashMap::new(),
            form_params: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            path_params: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query_params = parse_query_string(query);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive request header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a query string, URL-decoding both keys and values.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// The response under construction.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }
}

/// The request/response pair plus a typed attribute bag.
///
/// Owned exclusively by one in-flight request. Response data becomes readable
/// only once the exchange reaches [`ExchangePhase::ResponseSent`].
pub struct Exchange {
    pub request: HttpRequest,
    response: HttpResponse,
    phase: ExchangePhase,
    attributes: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    failed: bool,
    failure_cause: Option<anyhow::Error>,
    connection_closed: bool,
}

impl Exchange {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            response: HttpResponse::default(),
            phase: ExchangePhase::RequestReceived,
            attributes: HashMap::new(),
            failed: false,
            failure_cause: None,
            connection_closed: false,
        }
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    /// The final response. Errors until the response has been sent.
    pub fn response(&self) -> Result<&HttpResponse, EngineError> {
        match self.phase {
            ExchangePhase::ResponseSent => Ok(&self.response),
            ExchangePhase::RequestReceived => Err(EngineError::ResponseNotSent),
        }
    }

    /// The status code currently set on the response.
    ///
    /// Unlike response headers and body, the status is inspectable in any
    /// phase; the dispatch loop keys its error-handler lookup on it.
    pub fn status_code(&self) -> u16 {
        self.response.status_code
    }

    pub fn set_status_code(&mut self, status: u16) {
        self.response.status_code = status;
    }

    /// Set a response header, replacing any existing value.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response.headers.insert(name.into(), value.into());
    }

    /// Set a response header only when no header with that name exists yet.
    pub fn set_response_header_if_absent(&mut self, name: &str, value: impl Into<String>) {
        let present = self
            .response
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(name));
        if !present {
            self.response.headers.insert(name.to_string(), value.into());
        }
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Write the response body and mark the exchange complete.
    ///
    /// Error handlers may call this again to override an already-sent
    /// response before the transport serializes it.
    pub fn complete(&mut self, body: Bytes) {
        self.response.body = body;
        self.phase = ExchangePhase::ResponseSent;
    }

    /// Close the transport without a response.
    pub fn close_connection(&mut self) {
        self.connection_closed = true;
        self.phase = ExchangePhase::ResponseSent;
    }

    pub fn is_connection_closed(&self) -> bool {
        self.connection_closed
    }

    /// Record a failure cause; stops further handler processing.
    pub fn fail(&mut self, cause: anyhow::Error) {
        if self.failure_cause.is_none() {
            self.failure_cause = Some(cause);
        }
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn failure_cause(&self) -> Option<&anyhow::Error> {
        self.failure_cause.as_ref()
    }

    /// Store a typed attribute on the exchange.
    pub fn set_attribute<T: Any + Send + Sync>(&mut self, value: T) {
        self.attributes.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Read a typed attribute previously stored with [`Self::set_attribute`].
    pub fn attribute<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.attributes
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_unreadable_before_sent() {
        let exchange = Exchange::new(HttpRequest::new("GET", "/pets"));
        assert!(matches!(
            exchange.response(),
            Err(EngineError::ResponseNotSent)
        ));
    }

    #[test]
    fn test_response_readable_after_complete() {
        let mut exchange = Exchange::new(HttpRequest::new("GET", "/pets"));
        exchange.set_status_code(201);
        exchange.complete(Bytes::from_static(b"created"));
        let response = exchange.response().unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(&response.body[..], b"created");
        assert_eq!(exchange.phase(), ExchangePhase::ResponseSent);
    }

    #[test]
    fn test_header_if_absent_is_case_insensitive() {
        let mut exchange = Exchange::new(HttpRequest::new("GET", "/"));
        exchange.set_response_header("Content-Type", "application/json");
        exchange.set_response_header_if_absent("content-type", "text/plain");
        assert_eq!(
            exchange.response_header("content-type"),
            Some("application/json")
        );
    }

    #[test]
    fn test_fail_records_first_cause() {
        let mut exchange = Exchange::new(HttpRequest::new("GET", "/"));
        exchange.fail(anyhow::anyhow!("first"));
        exchange.fail(anyhow::anyhow!("second"));
        assert!(exchange.is_failed());
        assert_eq!(exchange.failure_cause().unwrap().to_string(), "first");
    }

    #[test]
    fn test_typed_attributes() {
        #[derive(Debug, PartialEq)]
        struct TraceId(String);

        let mut exchange = Exchange::new(HttpRequest::new("GET", "/"));
        exchange.set_attribute(TraceId("abc".to_string()));
        assert_eq!(
            exchange.attribute::<TraceId>(),
            Some(&TraceId("abc".to_string()))
        );
        assert!(exchange.attribute::<u64>().is_none());
    }

    #[test]
    fn test_parse_query_string_decodes() {
        let parsed = parse_query_string("a=1&b=hello%20world&flag");
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("hello world"));
        assert_eq!(parsed.get("flag").map(String::as_str), Some(""));
    }
}
