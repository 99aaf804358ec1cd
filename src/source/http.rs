//! HTTP(S) range-request byte source.
//!
//! Same retry/backoff shape and the same "probe once, then range-GET"
//! protocol as a blocking curl-backed transport, rewritten against
//! `reqwest`'s async client so it composes with the rest of this crate's
//! tokio-based concurrency model instead of spawning raw OS threads per
//! prefetch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};

use super::ByteSource;
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Send `If-Match`/`If-Unmodified-Since` on range reads once validators
    /// are known. On a 412 the read is retried once without them.
    pub conditional_reads: bool,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            conditional_reads: true,
        }
    }
}

pub struct HttpSourceConfigBuilder {
    config: HttpSourceConfig,
}

impl Default for HttpSourceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSourceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HttpSourceConfig::default(),
        }
    }

    pub fn retry_max_attempts(mut self, n: usize) -> Self {
        self.config.retry_max_attempts = n;
        self
    }

    pub fn retry_base_delay(mut self, d: Duration) -> Self {
        self.config.retry_base_delay = d;
        self
    }

    pub fn retry_max_delay(mut self, d: Duration) -> Self {
        self.config.retry_max_delay = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.config.connect_timeout = d;
        self
    }

    pub fn read_timeout(mut self, d: Duration) -> Self {
        self.config.read_timeout = d;
        self
    }

    pub fn conditional_reads(mut self, enabled: bool) -> Self {
        self.config.conditional_reads = enabled;
        self
    }

    pub fn build(self) -> HttpSourceConfig {
        self.config
    }
}

fn retry_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let shift = attempt.min(20) as u32;
    let mult = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
    base.checked_mul(mult).unwrap_or(max).min(max)
}

#[derive(Clone, Debug, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

/// A byte source backed by HTTP range requests.
pub struct HttpSource {
    url: String,
    client: Client,
    config: HttpSourceConfig,
    size: Option<u64>,
    validators: Validators,
    source_id: String,
}

impl HttpSource {
    /// Probe `url`: a metadata request for size/validators, then a one-byte
    /// range read to confirm range support and learn the authoritative
    /// total from `Content-Range`. Fails if the two disagree.
    pub async fn connect(url: impl Into<String>, config: HttpSourceConfig) -> Result<Self> {
        let url = url.into();
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        let head = client
            .head(&url)
            .header("Accept-Encoding", "identity")
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let head_size = head.content_length();
        let validators = Validators {
            etag: header_str(head.headers(), "etag"),
            last_modified: header_str(head.headers(), "last-modified"),
        };

        let probe = client
            .get(&url)
            .header("Accept-Encoding", "identity")
            .header("Range", "bytes=0-0")
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let size = match probe.status() {
            StatusCode::PARTIAL_CONTENT => {
                let total = parse_content_range(probe.headers()).map(|(_, total)| total);
                let _ = probe.bytes().await;
                let total = total
                    .ok_or_else(|| Error::Protocol("missing Content-Range on 206 probe".into()))?;
                if let Some(hs) = head_size
                    && let Some(t) = total
                    && hs != t
                {
                    return Err(Error::Protocol(format!(
                        "HEAD content-length ({hs}) disagrees with range probe total ({t})"
                    )));
                }
                total.or(head_size)
            }
            StatusCode::OK => {
                let _ = probe.bytes().await;
                return Err(Error::RangeUnsupported(url.clone()));
            }
            other => {
                let _ = probe.bytes().await;
                return Err(Error::Network(format!(
                    "unexpected status {other} probing {url}"
                )));
            }
        };

        let source_id = build_source_id(&url, &validators, size);

        Ok(Self {
            url,
            client,
            config,
            size,
            validators,
            source_id,
        })
    }

    fn range_request(&self, start: u64, end: u64, conditional: bool) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(&self.url)
            .header("Accept-Encoding", "identity")
            .header("Range", format!("bytes={start}-{end}"));

        if conditional && self.config.conditional_reads {
            if let Some(etag) = &self.validators.etag {
                req = req.header("If-Match", etag.clone());
            } else if let Some(lm) = &self.validators.last_modified {
                req = req.header("If-Unmodified-Since", lm.clone());
            }
        }

        req
    }

    async fn get_range_once(&self, start: u64, end: u64, conditional: bool) -> Result<RangeBody> {
        let resp = self
            .range_request(start, end, conditional)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let data = resp.bytes().await.map_err(|e| Error::Network(e.to_string()))?;
                Ok(RangeBody::Data(data))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let _ = resp.bytes().await;
                Ok(RangeBody::Eof)
            }
            StatusCode::PRECONDITION_FAILED => {
                let _ = resp.bytes().await;
                Ok(RangeBody::PreconditionFailed)
            }
            StatusCode::OK => {
                let _ = resp.bytes().await;
                Err(Error::RangeUnsupported(self.url.clone()))
            }
            other => {
                let _ = resp.bytes().await;
                Err(Error::Network(format!("HTTP {other} on range GET")))
            }
        }
    }

    async fn get_range_with_retry(&self, start: u64, end: u64) -> Result<Bytes> {
        let mut attempt = 0;
        let mut conditional = self.config.conditional_reads;
        let mut retried_precondition = false;

        loop {
            match self.get_range_once(start, end, conditional).await {
                Ok(RangeBody::Data(data)) => return Ok(data),
                Ok(RangeBody::Eof) => return Ok(Bytes::new()),
                Ok(RangeBody::PreconditionFailed) => {
                    if retried_precondition {
                        return Err(Error::PreconditionFailed(self.url.clone()));
                    }
                    retried_precondition = true;
                    conditional = false;
                    continue;
                }
                Err(Error::Network(msg)) => {
                    if attempt >= self.config.retry_max_attempts {
                        return Err(Error::Network(msg));
                    }
                }
                Err(e) => return Err(e),
            }

            let delay = retry_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                attempt,
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

enum RangeBody {
    Data(Bytes),
    Eof,
    PreconditionFailed,
}

fn header_str(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(|s| s.to_string())
}

fn parse_content_range(headers: &reqwest::header::HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get("content-range")?.to_str().ok()?;
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let total = if total == "*" {
        None
    } else {
        total.parse::<u64>().ok()
    };
    Some((start, total))
}

fn build_source_id(url: &str, validators: &Validators, size: Option<u64>) -> String {
    if let Some(etag) = &validators.etag {
        format!("{url}|{etag}")
    } else if let (Some(lm), Some(size)) = (&validators.last_modified, size) {
        format!("{url}|{lm}|{size}")
    } else if let Some(size) = size {
        format!("{url}|{size}")
    } else {
        url.to_string()
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len() as u64 - 1;
        let data = self.get_range_with_retry(offset, end).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn size(&self) -> Result<Option<u64>> {
        Ok(self.size)
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn supports_read_range(&self) -> bool {
        true
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let end = offset + length - 1;
        self.get_range_with_retry(offset, end).await
    }
}

/// Convenience constructor returning a trait object directly usable
/// wherever a `ByteSource` is expected.
pub async fn connect(url: impl Into<String>, config: HttpSourceConfig) -> Result<Arc<dyn ByteSource>> {
    Ok(Arc::new(HttpSource::connect(url, config).await?))
}
