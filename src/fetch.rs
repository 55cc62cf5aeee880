//! Auth-aware fetch router.
//!
//! Every outbound request to a backend goes through [`FetchRouter`]. It
//! resolves relative paths against the session's base URL, then looks up a
//! credential for the request's origin:
//!
//! 1. the tunnel password recorded in the connection directory, or
//! 2. the ambient password (the local server's), when no tunnel covers the
//!    origin.
//!
//! A resolved credential is attached as `Authorization: Basic` with the fixed
//! username [`SERVER_USERNAME`]. Requests without a credential go out
//! untouched.
//!
//! Responses are handed back as soon as their headers arrive; the body
//! streams through [`RoutedResponse::chunk`]. For failed responses (non-2xx)
//! the router first reads up to `log_body_limit` bytes to log them, then
//! replays those bytes ahead of the rest of the body, so the caller sees the
//! body unchanged.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use tracing::{debug, warn};
use url::ParseError;

use crate::config::FetchConfig;
use crate::directory::DirectoryReader;
use crate::error::FetchError;
use crate::origin::Origin;
use crate::sidecar::SERVER_USERNAME;
use crate::util::truncate_utf8;

/// A response whose body has not been read yet.
#[derive(Debug)]
pub struct RoutedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Final URL, after redirects.
    pub url: Url,
    /// Body bytes already read for diagnostics, replayed first.
    prefix: Vec<u8>,
    /// Read error hit while collecting `prefix`, surfaced after it.
    deferred: Option<reqwest::Error>,
    inner: reqwest::Response,
}

impl RoutedResponse {
    fn new(inner: reqwest::Response) -> Self {
        Self {
            status: inner.status(),
            headers: inner.headers().clone(),
            url: inner.url().clone(),
            prefix: Vec::new(),
            deferred: None,
            inner,
        }
    }

    /// Next piece of the body, or `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        if !self.prefix.is_empty() {
            return Ok(Some(std::mem::take(&mut self.prefix)));
        }
        if let Some(e) = self.deferred.take() {
            return Err(e.into());
        }
        Ok(self.inner.chunk().await?.map(|chunk| chunk.to_vec()))
    }

    /// Read the whole body.
    pub async fn bytes(mut self) -> Result<Vec<u8>, FetchError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Whole body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String, FetchError> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Whole body parsed as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, FetchError> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Read up to `limit` body bytes into the replay prefix.
    async fn read_prefix(&mut self, limit: usize) {
        while self.prefix.len() < limit {
            match self.inner.chunk().await {
                Ok(Some(chunk)) => self.prefix.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    self.deferred = Some(e);
                    break;
                }
            }
        }
    }
}

/// `Basic base64("opencode:<password>")`.
pub fn basic_auth_header(password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{SERVER_USERNAME}:{password}"));
    format!("Basic {encoded}")
}

/// Build the HTTP client. Only connecting is time-limited here; a total
/// request timeout would cut off streaming bodies.
pub fn client(config: &FetchConfig) -> Result<reqwest::Client, FetchError> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        reqwest::header::HeaderName::from_static("x-opencode-client"),
        HeaderValue::from_static("desktop"),
    );
    Ok(reqwest::Client::builder()
        .default_headers(default_headers)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()?)
}

pub struct FetchRouter {
    http: reqwest::Client,
    directory: DirectoryReader,
    base_url: RwLock<Option<Url>>,
    ambient_password: RwLock<Option<String>>,
    log_body_limit: usize,
    response_timeout: Duration,
}

impl FetchRouter {
    /// Create a router. `config.base_url` is applied if it parses; a bad one
    /// is logged and ignored.
    pub fn new(http: reqwest::Client, directory: DirectoryReader, config: &FetchConfig) -> Self {
        let router = Self {
            http,
            directory,
            base_url: RwLock::new(None),
            ambient_password: RwLock::new(None),
            log_body_limit: config.log_body_limit,
            response_timeout: Duration::from_secs(config.timeout_secs),
        };
        if let Err(e) = router.set_base_url(config.base_url.as_deref()) {
            warn!("Ignoring configured base URL: {e}");
        }
        router
    }

    /// Record the base URL used to resolve relative targets. `None` clears it.
    pub fn set_base_url(&self, base: Option<&str>) -> Result<(), FetchError> {
        let parsed = base
            .map(|b| {
                Url::parse(b).map_err(|e| FetchError::InvalidUrl {
                    url: b.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        *self.base_url.write().unwrap_or_else(PoisonError::into_inner) = parsed;
        Ok(())
    }

    pub fn base_url(&self) -> Option<Url> {
        self.base_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set (or clear) the credential used when no tunnel covers an origin.
    pub fn set_ambient_password(&self, password: Option<String>) {
        *self
            .ambient_password
            .write()
            .unwrap_or_else(PoisonError::into_inner) = password;
    }

    /// Absolute URL for `target`.
    pub fn resolve(&self, target: &str) -> Result<Url, FetchError> {
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(ParseError::RelativeUrlWithoutBase) => {
                let base = self
                    .base_url()
                    .ok_or_else(|| FetchError::RelativeWithoutBase(target.to_string()))?;
                base.join(target).map_err(|e| FetchError::InvalidUrl {
                    url: target.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(FetchError::InvalidUrl {
                url: target.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Password to present for `url`. A tunnel credential for the origin
    /// wins over the ambient one.
    pub fn credential_for(&self, url: &Url) -> Option<String> {
        Origin::from_url(url)
            .and_then(|origin| self.directory.password_for(&origin))
            .or_else(|| {
                self.ambient_password
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
    }

    /// Start a request to `target` with the resolved URL and credential.
    pub fn prepare(&self, method: Method, target: &str) -> Result<RequestBuilder, FetchError> {
        let url = self.resolve(target)?;
        let credential = self.credential_for(&url);
        let mut builder = self.http.request(method, url);
        if let Some(password) = credential {
            let mut value = HeaderValue::from_str(&basic_auth_header(&password))?;
            value.set_sensitive(true);
            builder = builder.header(AUTHORIZATION, value);
        }
        Ok(builder)
    }

    /// Send a prepared request. Returns once the response headers are in;
    /// waiting longer than `timeout_secs` for them is an error.
    pub async fn fetch(&self, builder: RequestBuilder) -> Result<RoutedResponse, FetchError> {
        let request = builder.build()?;
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "Fetch");

        let resp = tokio::time::timeout(self.response_timeout, self.http.execute(request))
            .await
            .map_err(|_| FetchError::Timeout(self.response_timeout))??;
        let mut resp = RoutedResponse::new(resp);

        if !resp.status.is_success() {
            resp.read_prefix(self.log_body_limit).await;
            let text = String::from_utf8_lossy(&resp.prefix);
            warn!(
                %method,
                %url,
                status = resp.status.as_u16(),
                body = truncate_utf8(&text, self.log_body_limit),
                "Request failed"
            );
        }
        Ok(resp)
    }

    pub async fn get(&self, target: &str) -> Result<RoutedResponse, FetchError> {
        self.fetch(self.prepare(Method::GET, target)?).await
    }
}
