use crate::{HttpClient, HttpRequest, RemoteError};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Buffer size for streaming downloads.
const STREAM_BUFFER_SIZE: usize = 8192;

/// Upper bound for bodies read fully into memory (repository manifests).
pub const MAX_MANIFEST_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed { bytes: u64 },
    Cancelled,
}

/// Stream the response for `request` into `dest`.
///
/// The body is written to a temporary file next to `dest` and renamed over
/// it only after the last byte arrived. On error or cancellation the
/// temporary file is removed and `dest` is left untouched.
/// `should_cancel` is polled before the request and before every chunk;
/// `on_progress` receives `(bytes so far, expected total)` after every chunk.
pub fn fetch_to_file(
    client: &dyn HttpClient,
    request: &HttpRequest,
    dest: &Path,
    should_cancel: &dyn Fn() -> bool,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<FetchOutcome, RemoteError> {
    if should_cancel() {
        return Ok(FetchOutcome::Cancelled);
    }

    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    debug!("GET {} -> {}", request.uri, dest.display());
    let mut response = client.request(request)?;
    let total = response.content_length;
    let mut tmp = NamedTempFile::new_in(dir)?;
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    let mut downloaded: u64 = 0;

    loop {
        if should_cancel() {
            debug!("download of {} cancelled after {downloaded} bytes", request.uri);
            return Ok(FetchOutcome::Cancelled);
        }
        let n = response
            .body
            .read(&mut buffer)
            .map_err(|e| RemoteError::Connection {
                uri: request.uri.clone(),
                reason: format!("failed to read response: {e}"),
            })?;
        if n == 0 {
            break;
        }
        tmp.write_all(&buffer[..n])?;
        downloaded += n as u64;
        on_progress(downloaded, total);
    }

    if let Some(expected) = total {
        if downloaded != expected {
            return Err(RemoteError::Truncated {
                uri: request.uri.clone(),
                expected,
                actual: downloaded,
            });
        }
    }

    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| RemoteError::Io(e.error))?;
    debug!("downloaded {downloaded} bytes to {}", dest.display());
    Ok(FetchOutcome::Completed { bytes: downloaded })
}

/// Read a whole response body into memory, refusing bodies over `limit` bytes.
pub fn fetch_bytes(
    client: &dyn HttpClient,
    request: &HttpRequest,
    limit: u64,
) -> Result<Vec<u8>, RemoteError> {
    debug!("GET {}", request.uri);
    let response = client.request(request)?;
    if response.content_length.is_some_and(|len| len > limit) {
        return Err(RemoteError::TooLarge {
            uri: request.uri.clone(),
            limit,
        });
    }
    let mut body = Vec::new();
    response
        .body
        .take(limit + 1)
        .read_to_end(&mut body)
        .map_err(|e| RemoteError::Connection {
            uri: request.uri.clone(),
            reason: format!("failed to read response: {e}"),
        })?;
    if body.len() as u64 > limit {
        return Err(RemoteError::TooLarge {
            uri: request.uri.clone(),
            limit,
        });
    }
    Ok(body)
}
