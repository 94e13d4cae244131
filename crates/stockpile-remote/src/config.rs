use crate::{Auth, HttpRequest, RemoteError};

/// Connection settings for one repository.
///
/// Credentials are only attached to requests that go to the same origin
/// (scheme, host and port) as the repository manifest, so packages served
/// from a third-party mirror never see the repository token.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub address: String,
    pub auth: Option<Auth>,
}

impl RemoteConfig {
    pub fn new(address: &str) -> Result<Self, RemoteError> {
        if origin(address).is_none() {
            return Err(RemoteError::Config(format!(
                "repository address must be an http(s) URL: {address}"
            )));
        }
        Ok(Self {
            address: address.to_owned(),
            auth: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.auth = token.map(|t| Auth::Bearer(t.to_owned()));
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Option<Auth>) -> Self {
        self.auth = auth;
        self
    }

    /// A GET for `uri`, carrying credentials when `uri` shares the
    /// repository's origin.
    pub fn get(&self, uri: &str) -> HttpRequest {
        let auth = match (origin(&self.address), origin(uri)) {
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => self.auth.clone(),
            _ => None,
        };
        HttpRequest::get(uri).with_auth(auth)
    }
}

/// `scheme://authority` prefix of an http(s) URL.
pub fn origin(uri: &str) -> Option<&str> {
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))?;
    let scheme_len = uri.len() - rest.len();
    let authority_len = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if authority_len == 0 {
        return None;
    }
    Some(&uri[..scheme_len + authority_len])
}
