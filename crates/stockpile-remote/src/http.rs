use crate::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RemoteError};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`HttpClient`] backed by a shared `ureq` agent (connection pooling,
/// TLS, redirects).
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new() -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for UreqClient {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, RemoteError> {
        let uri = request.uri.as_str();
        let headers = request.headers();
        tracing::debug!("{:?} {uri}", request.method);

        let result = match request.method {
            HttpMethod::Get => {
                let mut req = self.agent.get(uri);
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req.call()
            }
            HttpMethod::Head => {
                let mut req = self.agent.head(uri);
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req.call()
            }
            HttpMethod::Post => {
                let mut req = self.agent.post(uri);
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req.send(request.body.as_deref().unwrap_or_default())
            }
        };

        let resp = match result {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(status)) => {
                return Err(RemoteError::Server {
                    status,
                    uri: uri.to_owned(),
                });
            }
            Err(e) => {
                return Err(RemoteError::Connection {
                    uri: uri.to_owned(),
                    reason: e.to_string(),
                });
            }
        };

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(RemoteError::Server {
                status,
                uri: uri.to_owned(),
            });
        }

        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_owned()))
            })
            .collect();
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse().ok());

        Ok(HttpResponse {
            status,
            headers,
            content_length,
            body: Box::new(resp.into_body().into_reader()),
        })
    }
}
