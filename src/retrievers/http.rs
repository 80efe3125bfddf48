//! Blocking HTTP plumbing shared by the retrievers.
//!
//! Wraps a `ureq` agent with default browser-like headers, cancellation
//! checkpoints, error classification, an optional rate limiter and a lazily
//! built browser-profile client for HTML endpoints that answer 403/503.

use std::io::{Cursor, Read};
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, error, info, warn};
use serde_json::Value;
use zune_core::options::DecoderOptions;
use zune_jpeg::JpegDecoder;

use super::error::RetrieverError;
use super::CancelToken;
use crate::config::NetworkConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/99.0.4844.82 Safari/537.36";
const DEFAULT_HEADERS: [(&str, &str); 3] = [
    ("User-Agent", DEFAULT_USER_AGENT),
    ("Accept", "*/*"),
    ("Accept-Language", "en-US,en;q=0.9"),
];
const BROWSER_HEADERS: [(&str, &str); 5] = [
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    ),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Upgrade-Insecure-Requests", "1"),
];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RATE_LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const PROBE_CHUNK_BYTES: usize = 1024;
const PROBE_DECODE_THRESHOLD_BYTES: usize = 2048;
const PROBE_MAX_BYTES: usize = 128 * 1024;

pub type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-request-class timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub json: Duration,
    pub html: Duration,
    pub probe: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

impl HttpTimeouts {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            json: Duration::from_secs(network.json_timeout_secs),
            html: Duration::from_secs(network.html_timeout_secs),
            probe: Duration::from_secs(network.probe_timeout_secs),
        }
    }
}

/// One GET request. Headers given here override the defaults.
#[derive(Debug, Clone)]
pub struct GetRequest {
    url: String,
    context: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    rate_limited: bool,
}

impl GetRequest {
    pub fn new(url: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            context: context.into(),
            query: Vec::new(),
            headers: Vec::new(),
            timeout: None,
            rate_limited: false,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend(headers.iter().cloned());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Waits on the client's rate limiter before sending.
    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }
}

/// A successfully fetched HTML document.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub final_url: String,
    pub body: String,
}

/// HTTP client owned by one retriever.
pub struct HttpClient {
    service_name: &'static str,
    agent: ureq::Agent,
    timeouts: HttpTimeouts,
    rate_limiter: Option<DirectRateLimiter>,
    browser_agent: OnceLock<Option<ureq::Agent>>,
}

impl HttpClient {
    pub fn new(service_name: &'static str, timeouts: HttpTimeouts) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        Self {
            service_name,
            agent,
            timeouts,
            rate_limiter: None,
            browser_agent: OnceLock::new(),
        }
    }

    /// Allows one rate-limited request per `period`.
    pub fn with_rate_limit(mut self, period: Duration) -> Self {
        self.rate_limiter = Quota::with_period(period)
            .and_then(|quota| NonZeroU32::new(1).map(|burst| quota.allow_burst(burst)))
            .map(RateLimiter::direct);
        self
    }

    pub fn service_name(&self) -> &'static str {
        self.service_name
    }

    /// Sends a GET. `Ok(None)` means the call was cancelled.
    pub fn get(
        &self,
        request: &GetRequest,
        browser_fallback: bool,
        cancel: &CancelToken,
    ) -> Result<Option<ureq::Response>, RetrieverError> {
        if browser_fallback {
            if let Some(Some(agent)) = self.browser_agent.get() {
                return self.execute(agent, true, request, cancel);
            }
        }

        match self.execute(&self.agent, false, request, cancel) {
            Err(original)
                if browser_fallback && matches!(original.status_code(), Some(403 | 503)) =>
            {
                warn!(
                    "[{}] {} to {} failed with status {:?}. Attempting browser-profile client fallback.",
                    self.service_name,
                    request.context,
                    request.url,
                    original.status_code()
                );
                let Some(agent) = self.browser_agent() else {
                    warn!(
                        "[{}] Browser-profile client unavailable; propagating original error",
                        self.service_name
                    );
                    return Err(original);
                };
                info!(
                    "[{}] Retrying {} with browser-profile client: {}",
                    self.service_name, request.context, request.url
                );
                self.execute(agent, true, request, cancel).inspect_err(|err| {
                    warn!(
                        "[{}] Browser-profile client retry for {} also failed: {}",
                        self.service_name, request.url, err
                    );
                })
            }
            other => other,
        }
    }

    /// GET and decode a JSON body.
    pub fn get_json(
        &self,
        request: &GetRequest,
        cancel: &CancelToken,
    ) -> Result<Option<Value>, RetrieverError> {
        let request = self.with_default_timeout(request, self.timeouts.json);
        let Some(response) = self.get(&request, false, cancel)? else {
            return Ok(None);
        };
        let final_url = response.get_url().to_string();
        match response.into_json::<Value>() {
            Ok(value) => Ok(Some(value)),
            Err(_) if cancel.is_cancelled() => Ok(None),
            Err(err) => Err(RetrieverError::data_with_source(
                format!("Failed to decode JSON response from {}", request.context),
                Some(&final_url),
                err,
            )),
        }
    }

    /// GET an HTML page, using the browser-profile fallback on 403/503.
    pub fn get_html(
        &self,
        request: &GetRequest,
        cancel: &CancelToken,
    ) -> Result<Option<FetchedPage>, RetrieverError> {
        let request = self.with_default_timeout(request, self.timeouts.html);
        let Some(response) = self.get(&request, true, cancel)? else {
            return Ok(None);
        };
        let final_url = response.get_url().to_string();
        let content_type = response
            .header("Content-Type")
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.contains("text/html") {
            return Err(RetrieverError::data(
                format!(
                    "Expected HTML from {} but got content type '{}'",
                    request.context, content_type
                ),
                Some(&final_url),
            ));
        }
        let body = match response.into_string() {
            Ok(body) => body,
            Err(_) if cancel.is_cancelled() => return Ok(None),
            Err(err) => {
                return Err(RetrieverError::network(
                    format!("Failed to read HTML body for {}", request.context),
                    &final_url,
                    Some(Box::new(err)),
                ))
            }
        };
        if body.trim().is_empty() {
            return Err(RetrieverError::data(
                format!(
                    "No content received from {} despite successful request",
                    request.context
                ),
                Some(&final_url),
            ));
        }
        Ok(Some(FetchedPage {
            final_url,
            body,
        }))
    }

    /// Downloads at most `max_bytes` of a resource. Returns `Ok(None)` when
    /// cancelled or when the body is larger than the cap.
    pub fn get_bytes(
        &self,
        url: &str,
        max_bytes: usize,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, RetrieverError> {
        let request = GetRequest::new(url, "byte download").timeout(self.timeouts.probe);
        let Some(response) = self.get(&request, false, cancel)? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        let read = response
            .into_reader()
            .take(max_bytes as u64 + 1)
            .read_to_end(&mut bytes);
        match read {
            Ok(_) if bytes.len() > max_bytes => {
                warn!(
                    "[{}] Download exceeded {} bytes: {}",
                    self.service_name, max_bytes, url
                );
                Ok(None)
            }
            Ok(_) => Ok(Some(bytes)),
            Err(_) if cancel.is_cancelled() => Ok(None),
            Err(err) => Err(RetrieverError::network(
                format!("Error reading bytes from {url}"),
                url,
                Some(Box::new(err)),
            )),
        }
    }

    /// Streams the head of an image until its dimensions can be decoded.
    pub fn probe_image_dimensions(
        &self,
        url: &str,
        extra_headers: &[(String, String)],
        cancel: &CancelToken,
    ) -> Result<Option<(u32, u32)>, RetrieverError> {
        let request = GetRequest::new(url, "image dimension probe")
            .headers(extra_headers)
            .timeout(self.timeouts.probe);
        let Some(response) = self.get(&request, false, cancel)? else {
            return Ok(None);
        };

        let mut reader = response.into_reader();
        let mut buffer = Vec::with_capacity(PROBE_DECODE_THRESHOLD_BYTES * 2);
        let mut chunk = [0u8; PROBE_CHUNK_BYTES];
        loop {
            if cancel.check(self.service_name, "while streaming image probe") {
                return Ok(None);
            }
            let read = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(_) if cancel.is_cancelled() => return Ok(None),
                Err(err) => {
                    return Err(RetrieverError::network(
                        format!("Error streaming image data from {url}"),
                        url,
                        Some(Box::new(err)),
                    ))
                }
            };
            buffer.extend_from_slice(&chunk[..read]);
            if buffer.len() > PROBE_DECODE_THRESHOLD_BYTES {
                if let Some(dimensions) = decode_dimensions(&buffer) {
                    return Ok(Some(dimensions));
                }
            }
            if buffer.len() >= PROBE_MAX_BYTES {
                warn!(
                    "[{}] Could not determine dimensions within {} bytes: {}",
                    self.service_name, PROBE_MAX_BYTES, url
                );
                return Ok(None);
            }
        }
        Ok(decode_dimensions(&buffer))
    }

    fn with_default_timeout(&self, request: &GetRequest, timeout: Duration) -> GetRequest {
        let mut request = request.clone();
        request.timeout.get_or_insert(timeout);
        request
    }

    fn browser_agent(&self) -> Option<&ureq::Agent> {
        self.browser_agent
            .get_or_init(|| build_browser_agent(self.service_name))
            .as_ref()
    }

    fn wait_for_permit(&self, cancel: &CancelToken) -> bool {
        let Some(limiter) = &self.rate_limiter else {
            return true;
        };
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if limiter.check().is_ok() {
                return true;
            }
            thread::sleep(RATE_LIMIT_POLL_INTERVAL);
        }
    }

    fn execute(
        &self,
        agent: &ureq::Agent,
        browser_profile: bool,
        request: &GetRequest,
        cancel: &CancelToken,
    ) -> Result<Option<ureq::Response>, RetrieverError> {
        if cancel.check(self.service_name, &format!("before {}", request.context)) {
            return Ok(None);
        }
        if request.rate_limited && !self.wait_for_permit(cancel) {
            debug!(
                "[{}] Cancelled while waiting for rate limit: {}",
                self.service_name, request.url
            );
            return Ok(None);
        }

        let mut call = agent
            .get(&request.url)
            .timeout(request.timeout.unwrap_or(self.timeouts.json));
        for (name, value) in DEFAULT_HEADERS {
            call = call.set(name, value);
        }
        if browser_profile {
            for (name, value) in BROWSER_HEADERS {
                call = call.set(name, value);
            }
        }
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }
        for (key, value) in &request.query {
            call = call.query(key, value);
        }

        debug!(
            "[{}] GET {} ({})",
            self.service_name, request.url, request.context
        );
        match call.call() {
            Ok(response) => {
                if cancel.check(self.service_name, &format!("after {}", request.context)) {
                    return Ok(None);
                }
                Ok(Some(response))
            }
            Err(_) if cancel.is_cancelled() => {
                debug!(
                    "[{}] Ignoring failure for cancelled {}",
                    self.service_name, request.context
                );
                Ok(None)
            }
            Err(err) => {
                let message = failure_message(&err, &request.context, &request.url);
                let error = RetrieverError::from_http_error(err, Some(message));
                warn!("[{}] {}", self.service_name, error);
                Err(error)
            }
        }
    }
}

fn failure_message(error: &ureq::Error, context: &str, url: &str) -> String {
    match error {
        ureq::Error::Status(code, _) => {
            format!("HTTP error during {context} to {url} (status {code})")
        }
        ureq::Error::Transport(transport) => {
            let lowered = transport.to_string().to_ascii_lowercase();
            let label = if lowered.contains("timed out") || lowered.contains("timeout") {
                "Timeout"
            } else {
                "Connection error"
            };
            format!("{label} during {context} to {url}: {transport}")
        }
    }
}

fn build_browser_agent(service_name: &str) -> Option<ureq::Agent> {
    match native_tls::TlsConnector::new() {
        Ok(connector) => {
            info!("[{}] Initialized browser-profile client", service_name);
            Some(
                ureq::AgentBuilder::new()
                    .tls_connector(Arc::new(connector))
                    .timeout_connect(CONNECT_TIMEOUT)
                    .build(),
            )
        }
        Err(err) => {
            error!(
                "[{}] Failed to initialize browser-profile client: {}",
                service_name, err
            );
            None
        }
    }
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF
}

fn jpeg_header_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut decoder =
        JpegDecoder::new_with_options(bytes, DecoderOptions::new_cmd().set_strict_mode(false));
    decoder.decode_headers().ok()?;
    let (width, height) = decoder.dimensions()?;
    Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?))
}

/// Reads pixel dimensions from a (possibly partial) encoded image.
pub fn decode_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if looks_like_jpeg(bytes) {
        if let Some(dimensions) = jpeg_header_dimensions(bytes) {
            return Some(dimensions);
        }
    }
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
        .filter(|(width, height)| *width > 0 && *height > 0)
}

#[cfg(test)]
mod tests {
    use super::{decode_dimensions, GetRequest, HttpClient, HttpTimeouts};
    use crate::retrievers::CancelToken;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::time::Duration;

    fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), format)
            .expect("encode test image");
        bytes
    }

    #[test]
    fn test_decode_dimensions_png_and_jpeg() {
        assert_eq!(
            decode_dimensions(&encode(37, 19, ImageFormat::Png)),
            Some((37, 19))
        );
        assert_eq!(
            decode_dimensions(&encode(64, 48, ImageFormat::Jpeg)),
            Some((64, 48))
        );
    }

    #[test]
    fn test_decode_dimensions_rejects_garbage() {
        assert_eq!(decode_dimensions(b"not an image at all"), None);
        assert_eq!(decode_dimensions(&[]), None);
    }

    #[test]
    fn test_cancelled_request_never_touches_network() {
        let client = HttpClient::new("Test", HttpTimeouts::default());
        let cancel = CancelToken::default();
        cancel.cancel();
        let request = GetRequest::new("https://unreachable.invalid/", "test request");
        assert!(matches!(client.get(&request, true, &cancel), Ok(None)));
        assert!(matches!(
            client.probe_image_dimensions("https://unreachable.invalid/a.jpg", &[], &cancel),
            Ok(None)
        ));
    }

    #[test]
    fn test_default_timeout_keeps_explicit_value() {
        let client = HttpClient::new("Test", HttpTimeouts::default());
        let explicit = GetRequest::new("u", "c").timeout(Duration::from_secs(3));
        assert_eq!(
            client
                .with_default_timeout(&explicit, Duration::from_secs(15))
                .timeout,
            Some(Duration::from_secs(3))
        );
        let implicit = GetRequest::new("u", "c");
        assert_eq!(
            client
                .with_default_timeout(&implicit, Duration::from_secs(15))
                .timeout,
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_timeouts_follow_network_config() {
        let timeouts = HttpTimeouts::default();
        assert_eq!(timeouts.json, Duration::from_secs(10));
        assert_eq!(timeouts.html, Duration::from_secs(15));
        assert_eq!(timeouts.probe, Duration::from_secs(10));
    }
}
