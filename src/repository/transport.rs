// src/repository/transport.rs

//! HTTP transport used for catalog fetches and package downloads
//!
//! The `Transport` trait is the seam between the synchronization engine and
//! the network, so the engine can be exercised without one.

use crate::error::{Error, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_ENCODING, HeaderMap, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use std::io::{self, Write};
use std::time::Duration;
use tracing::debug;

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum redirect hops followed for one request
const MAX_REDIRECTS: usize = 10;

/// Body and metadata of a completed GET
#[derive(Debug, Clone, Default)]
pub struct FetchedBody {
    /// Raw body bytes, still encoded if `content_encoding` is set
    pub body: Vec<u8>,
    /// Value of the `Content-Encoding` header, if any
    pub content_encoding: Option<String>,
    /// Final URL when every hop up to it was a permanent redirect
    pub permanent_redirect: Option<String>,
}

/// Network access needed by the fetcher and the installer
pub trait Transport: Send + Sync {
    /// GET a document
    fn get(&self, url: &str) -> Result<FetchedBody>;

    /// Stream a resource into `sink`, returning the number of bytes written
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64>;
}

/// Blocking `reqwest` transport that records permanent redirects
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish()
    }
}

impl HttpTransport {
    /// Create a transport with the default timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    /// Create a transport with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        // Redirects are followed by hand so permanent ones can be recorded
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .user_agent(concat!("pkgsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Send a GET, following redirects, and return the final response
    fn send(&self, url: &str) -> Result<(Response, Option<String>)> {
        let mut current = Url::parse(url)
            .map_err(|e| Error::DownloadError(format!("Invalid URL '{}': {}", url, e)))?;
        let mut permanent: Option<String> = None;
        let mut all_permanent = true;

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(current.clone())
                .send()
                .map_err(|e| Error::DownloadError(format!("Failed to fetch {}: {}", current, e)))?;

            let status = response.status();
            if !status.is_redirection() {
                if !status.is_success() {
                    return Err(Error::DownloadError(format!(
                        "HTTP {} from {}",
                        status, current
                    )));
                }
                return Ok((response, permanent));
            }

            let location = redirect_target(response.headers()).ok_or_else(|| {
                Error::DownloadError(format!(
                    "HTTP {} from {} without a redirect target",
                    status, current
                ))
            })?;
            let next = current.join(&location).map_err(|e| {
                Error::DownloadError(format!("Invalid redirect target '{}': {}", location, e))
            })?;

            if all_permanent
                && matches!(
                    status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
                )
            {
                debug!("Permanent redirect: {} -> {}", current, next);
                permanent = Some(next.to_string());
            } else {
                debug!("Temporary redirect: {} -> {}", current, next);
                all_permanent = false;
                permanent = None;
            }
            current = next;
        }

        Err(Error::DownloadError(format!(
            "Too many redirects fetching {}",
            url
        )))
    }
}

/// `Location`, falling back to the legacy `URI` header
fn redirect_target(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .or_else(|| headers.get("uri"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<FetchedBody> {
        let (response, permanent_redirect) = self.send(url)?;

        let content_encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {}", e)))?
            .to_vec();

        Ok(FetchedBody {
            body,
            content_encoding,
            permanent_redirect,
        })
    }

    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let (mut response, _) = self.send(url)?;

        io::copy(&mut response, sink)
            .map_err(|e| Error::DownloadError(format!("Failed to download {}: {}", url, e)))
    }
}
