use crate::{HttpClient, HttpRequest, HttpResponse, RemoteError};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};

/// A scripted failure returned by [`MockHttpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Connection,
    Server(u16),
    /// Respond 200 but deliver only the first N bytes of the body.
    Truncate(usize),
}

/// In-memory [`HttpClient`] for deterministic tests.
///
/// Serves fixed bodies per URI, honours `range_offset` with a 206, and
/// can be told to fail the next N requests to a URI. Every request is
/// recorded.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, VecDeque<MockFailure>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, uri: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.bodies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.into(), body.into());
    }

    pub fn fail_next(&self, uri: impl Into<String>, count: usize, failure: MockFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uri.into())
            .or_default()
            .extend(std::iter::repeat_n(failure, count));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self, uri: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.uri == uri)
            .count()
    }
}

fn ok(status: u16, body: Vec<u8>, content_length: u64) -> HttpResponse {
    HttpResponse {
        status,
        headers: vec![("content-length".to_owned(), content_length.to_string())],
        content_length: Some(content_length),
        body: Box::new(Cursor::new(body)),
    }
}

impl HttpClient for MockHttpClient {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, RemoteError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let uri = request.uri.clone();

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&uri)
            .and_then(VecDeque::pop_front);
        let body = self
            .bodies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uri)
            .cloned();

        match failure {
            Some(MockFailure::Connection) => {
                return Err(RemoteError::Connection {
                    uri,
                    reason: "scripted connection failure".to_owned(),
                })
            }
            Some(MockFailure::Server(status)) => return Err(RemoteError::Server { status, uri }),
            Some(MockFailure::Truncate(keep)) => {
                let Some(body) = body else {
                    return Err(RemoteError::Server { status: 404, uri });
                };
                let full = body.len() as u64;
                let cut = body[..keep.min(body.len())].to_vec();
                return Ok(ok(200, cut, full));
            }
            None => {}
        }

        let Some(body) = body else {
            return Err(RemoteError::Server { status: 404, uri });
        };
        match request.range_offset {
            Some(offset) if offset > 0 => {
                let start = (offset as usize).min(body.len());
                let rest = body[start..].to_vec();
                let len = rest.len() as u64;
                Ok(ok(206, rest, len))
            }
            _ => {
                let len = body.len() as u64;
                Ok(ok(200, body, len))
            }
        }
    }
}
