//! Reference static repository server for Stockpile.
//!
//! Serves a directory tree over HTTP: `repository.json` plus the package
//! files it references. `GET` and `HEAD` are supported, `Range: bytes=N-`
//! requests are answered with `206 Partial Content`, and an optional bearer
//! token guards every route except `/health`.
//!
//! The [`TestServer`] helper starts a server on a random port for integration
//! testing and can inject transient `503` failures with
//! [`TestServer::fail_next`].

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use stockpile_schema::{repository_to_json, Repository};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// File name of the manifest at the root of a published site.
pub const MANIFEST_FILE: &str = "repository.json";

/// A directory published as a repository.
pub struct Site {
    root: PathBuf,
    token: Option<String>,
    failures: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

impl Site {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            token: None,
            failures: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Require `Authorization: Bearer <token>` on every file request.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `data` to `relative` under the site root, creating directories.
    pub fn put_file(&self, relative: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.resolve(relative).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid path: {relative}"))
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Publish `repository` as the site manifest.
    pub fn publish(&self, repository: &Repository) -> io::Result<PathBuf> {
        let json = repository_to_json(repository).map_err(io::Error::other)?;
        self.put_file(MANIFEST_FILE, json.as_bytes())
    }

    /// Answer the next `count` file requests with `503 Service Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Request log as `"<METHOD> <path>[ range=<offset>]"` lines.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, line: String) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    /// Map a URL path onto the site root. Absolute components and `..`
    /// are rejected.
    pub fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let path = url_path.split(['?', '#']).next().unwrap_or_default();
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return None;
        }
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }

    fn authorized(&self, req: &Request) -> bool {
        let Some(token) = &self.token else {
            return true;
        };
        let expected = format!("Bearer {token}");
        header_value(req, "Authorization").is_some_and(|v| v == expected)
    }
}

/// Parse a `Range: bytes=N-` header value into the start offset.
///
/// Only the open-ended single-range form is understood; anything else is
/// treated as absent and the full body is served.
pub fn parse_range(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes=")?;
    let start = range.strip_suffix('-')?;
    start.parse().ok()
}

fn header_value<'a>(req: &'a Request, name: &'static str) -> Option<&'a str> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str())
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn respond_status(req: Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_file(req: Request, path: &Path, head: bool) {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            respond_status(req, 404, "not found");
            return;
        }
        Err(e) => {
            error!("read {}: {e}", path.display());
            respond_status(req, 500, "read error");
            return;
        }
    };
    let total = data.len() as u64;
    let offset = header_value(&req, "Range").and_then(parse_range);

    let (status, body, range) = match offset {
        Some(start) if start > 0 && start >= total => {
            let mut response = Response::empty(StatusCode(416));
            if let Some(h) = header("Content-Range", &format!("bytes */{total}")) {
                response.add_header(h);
            }
            let _ = req.respond(response);
            return;
        }
        Some(start) if start > 0 => {
            let start_idx = usize::try_from(start).unwrap_or(data.len());
            let range = format!("bytes {start}-{}/{total}", total - 1);
            (206, data[start_idx..].to_vec(), Some(range))
        }
        _ => (200, data, None),
    };

    let mut response = if head {
        Response::from_data(Vec::new())
    } else {
        Response::from_data(body)
    }
    .with_status_code(StatusCode(status));
    for h in [
        header("Content-Type", content_type(path)),
        header("Accept-Ranges", "bytes"),
        range.and_then(|r| header("Content-Range", &r)),
    ]
    .into_iter()
    .flatten()
    {
        response.add_header(h);
    }
    let _ = req.respond(response);
}

/// Handle a single HTTP request against `site`.
pub fn handle_request(site: &Site, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    if url == "/health" && method == Method::Get {
        let _ = req.respond(Response::from_string(r#"{"status":"ok"}"#));
        return;
    }

    let mut line = format!("{method} {url}");
    if let Some(offset) = header_value(&req, "Range").and_then(parse_range) {
        line.push_str(&format!(" range={offset}"));
    }
    site.record(line);

    if !matches!(method, Method::Get | Method::Head) {
        respond_status(req, 405, "method not allowed");
        return;
    }
    if !site.authorized(&req) {
        warn!("{method} {url}: missing or invalid credentials");
        respond_status(req, 401, "unauthorized");
        return;
    }
    if site.take_failure() {
        info!("{method} {url}: injected failure");
        respond_status(req, 503, "service unavailable");
        return;
    }
    match site.resolve(&url) {
        Some(path) if path.is_file() => respond_file(req, &path, method == Method::Head),
        _ => respond_status(req, 404, "not found"),
    }
}

/// Bind `addr` and serve `site`, blocking the current thread.
pub fn run_server(site: &Arc<Site>, addr: &str) -> io::Result<()> {
    let server = Server::http(addr).map_err(io::Error::other)?;
    info!("serving {} on {addr}", site.root().display());
    for request in server.incoming_requests() {
        handle_request(site, request);
    }
    Ok(())
}

/// A test helper that serves a directory on a random port in a background
/// thread.
///
/// The server listens on `127.0.0.1:{port}`. Dropping the `TestServer`
/// stops it.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    site: Arc<Site>,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `root` without authentication.
    pub fn start(root: PathBuf) -> io::Result<Self> {
        Self::start_site(Site::new(root))
    }

    /// Serve `root`, requiring `token` as a bearer credential.
    pub fn start_with_token(root: PathBuf, token: &str) -> io::Result<Self> {
        Self::start_site(Site::new(root).with_token(Some(token.to_owned())))
    }

    fn start_site(site: Site) -> io::Result<Self> {
        fs::create_dir_all(site.root())?;
        let server = Arc::new(Server::http("127.0.0.1:0").map_err(io::Error::other)?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| io::Error::other("test server is not bound to an IP address"))?;
        let url = format!("http://127.0.0.1:{port}");

        let site = Arc::new(site);
        let srv = Arc::clone(&server);
        let served = Arc::clone(&site);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&served, request);
            }
        });

        Ok(Self {
            url,
            port,
            site,
            server,
            handle: Some(handle),
        })
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    /// Absolute URL of `relative` on this server.
    pub fn url_for(&self, relative: &str) -> String {
        format!("{}/{}", self.url, relative.trim_start_matches('/'))
    }

    /// Absolute URL of the site manifest.
    pub fn manifest_url(&self) -> String {
        self.url_for(MANIFEST_FILE)
    }

    pub fn fail_next(&self, count: usize) {
        self.site.fail_next(count);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
