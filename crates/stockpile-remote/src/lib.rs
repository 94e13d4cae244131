//! HTTP transport for fetching repository manifests and package files.
//!
//! This crate provides the `HttpClient` collaborator used by the inventory
//! core: request/response types, a `ureq`-backed client (`UreqClient`), a
//! scripted in-memory client for tests (`MockHttpClient`), per-repository
//! authentication (`RemoteConfig`), and streaming downloads that land on disk
//! only through an atomic rename (`fetch_to_file`).

pub mod config;
pub mod download;
pub mod http;
pub mod mock;

pub use config::RemoteConfig;
pub use download::{fetch_bytes, fetch_to_file, FetchOutcome, MAX_MANIFEST_BYTES};
pub use http::UreqClient;
pub use mock::{MockFailure, MockHttpClient};

/// Protocol version sent as `X-Stockpile-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;

use base64::Engine;
use std::fmt;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection to {uri} failed: {reason}")]
    Connection { uri: String, reason: String },
    #[error("server returned HTTP {status} for {uri}")]
    Server { status: u16, uri: String },
    #[error("response from {uri} truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        uri: String,
        expected: u64,
        actual: u64,
    },
    #[error("response from {uri} exceeds {limit} bytes")]
    TooLarge { uri: String, limit: u64 },
    #[error("remote config error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Short machine-readable tag, used as the error code of failed steps.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Connection { .. } => "connection-failure",
            Self::Server { .. } => "server-error",
            Self::Truncated { .. } => "truncated",
            Self::TooLarge { .. } => "too-large",
            Self::Config(_) => "configuration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
}

/// Credentials attached to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Auth {
    /// Value of the `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Self::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                format!("Basic {encoded}")
            }
            Self::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub uri: String,
    pub method: HttpMethod,
    pub auth: Option<Auth>,
    /// Ask for the body starting at this byte (`Range: bytes=N-`).
    pub range_offset: Option<u64>,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: HttpMethod::Get,
            auth: None,
            range_offset: None,
            content_type: None,
            body: None,
        }
    }

    pub fn head(uri: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Head,
            ..Self::get(uri)
        }
    }

    pub fn post(uri: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            content_type: Some(content_type.to_owned()),
            body: Some(body),
            ..Self::get(uri)
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Option<Auth>) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_range_offset(mut self, offset: u64) -> Self {
        self.range_offset = Some(offset);
        self
    }

    /// Headers every client sends for this request, in order.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("X-Stockpile-Protocol", PROTOCOL_VERSION.to_string())];
        if let Some(ref auth) = self.auth {
            headers.push(("Authorization", auth.header_value()));
        }
        if let Some(offset) = self.range_offset {
            headers.push(("Range", format!("bytes={offset}-")));
        }
        if let Some(ref content_type) = self.content_type {
            headers.push(("Content-Type", content_type.clone()));
        }
        headers
    }
}

/// A successful (2xx) response with a streaming body.
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Blocking HTTP transport.
///
/// Implementations return `Err(RemoteError::Server { .. })` for non-2xx
/// statuses and `Err(RemoteError::Connection { .. })` when no response
/// was received at all.
pub trait HttpClient: Send + Sync {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_value() {
        assert_eq!(Auth::Bearer("tok".to_owned()).header_value(), "Bearer tok");
    }

    #[test]
    fn basic_header_value_is_base64() {
        let auth = Auth::Basic {
            username: "Aladdin".to_owned(),
            password: "open sesame".to_owned(),
        };
        assert_eq!(auth.header_value(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn auth_debug_hides_secrets() {
        let dbg = format!("{:?}", Auth::Bearer("secret".to_owned()));
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn request_headers_include_range_and_auth() {
        let req = HttpRequest::get("http://x/a")
            .with_auth(Some(Auth::Bearer("t".to_owned())))
            .with_range_offset(100);
        let headers = req.headers();
        assert!(headers.contains(&("Authorization", "Bearer t".to_owned())));
        assert!(headers.contains(&("Range", "bytes=100-".to_owned())));
        assert_eq!(headers[0].0, "X-Stockpile-Protocol");
    }

    #[test]
    fn post_sets_content_type() {
        let req = HttpRequest::post("http://x/a", "application/json", b"{}".to_vec());
        assert_eq!(req.method, HttpMethod::Post);
        assert!(req
            .headers()
            .contains(&("Content-Type", "application/json".to_owned())));
    }

    #[test]
    fn error_codes_distinguish_transport_failures() {
        let conn = RemoteError::Connection {
            uri: "u".to_owned(),
            reason: "refused".to_owned(),
        };
        let server = RemoteError::Server {
            status: 503,
            uri: "u".to_owned(),
        };
        assert_eq!(conn.code(), "connection-failure");
        assert_eq!(server.code(), "server-error");
        assert!(server.to_string().contains("503"));
    }
}
