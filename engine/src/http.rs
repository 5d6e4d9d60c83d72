//! HTTP(S) sources over a blocking reqwest client.
//!
//! Resolution issues a `HEAD` request and reads the declared metadata;
//! opening issues a `GET`, with a `Range` header when resuming from an offset
//! the server advertised it can honor.

use std::time::{Duration, SystemTime};

use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderMap};
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::SourceInfo;
use crate::naming;
use crate::source::{MediaSource, OpenedStream, SourceResolver};

/// Non-standard header some media servers use to declare playback length.
pub const CONTENT_DURATION_HEADER: &str = "x-content-duration";

#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: Client,
}

impl HttpResolver {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            // Body reads may legitimately outlast any fixed deadline.
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| EngineError::Network {
                url: String::new(),
                source: e,
            })?;
        Ok(HttpResolver { client })
    }

    pub fn with_client(client: Client) -> Self {
        HttpResolver { client }
    }
}

impl SourceResolver for HttpResolver {
    fn resolve(&self, locator: &str) -> Result<Box<dyn MediaSource>, EngineError> {
        let url = Url::parse(locator).map_err(|e| EngineError::ResolveFailed {
            locator: locator.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::ResolveFailed {
                locator: locator.to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let response = self
            .client
            .head(url.clone())
            .send()
            .map_err(|e| EngineError::Network {
                url: locator.to_string(),
                source: e,
            })?;
        check_status(&response, locator)?;

        let final_url = response.url().clone();
        let info = source_info_from_headers(final_url.as_str(), response.headers());
        debug!(
            url = %final_url,
            total_size = info.total_size,
            supports_resume = info.supports_resume,
            "Resolved HTTP source"
        );

        Ok(Box::new(HttpSource {
            client: self.client.clone(),
            url: final_url,
            info,
        }))
    }
}

/// A resolved HTTP resource.
#[derive(Debug)]
pub struct HttpSource {
    client: Client,
    url: Url,
    info: SourceInfo,
}

impl HttpSource {
    fn get(&self, range_from: Option<u64>) -> Result<Response, EngineError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(offset) = range_from {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        request.send().map_err(|e| EngineError::Network {
            url: self.url.to_string(),
            source: e,
        })
    }
}

impl MediaSource for HttpSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn open(&mut self, offset: u64) -> Result<OpenedStream, EngineError> {
        let ranged = offset > 0 && self.info.supports_resume;
        let response = self.get(ranged.then_some(offset))?;

        let response = match response.status() {
            StatusCode::PARTIAL_CONTENT if ranged => {
                let start = content_range_start(response.headers());
                if start != Some(offset) {
                    return Err(EngineError::ResolveFailed {
                        locator: self.url.to_string(),
                        message: format!(
                            "server resumed at {:?} instead of byte {}",
                            start, offset
                        ),
                    });
                }
                return Ok(OpenedStream {
                    reader: Box::new(response),
                    offset,
                });
            }
            StatusCode::RANGE_NOT_SATISFIABLE if ranged => {
                debug!(url = %self.url, offset, "Range not satisfiable; refetching from start");
                self.get(None)?
            }
            _ => response,
        };

        check_status(&response, self.url.as_str())?;
        Ok(OpenedStream {
            reader: Box::new(response),
            offset: 0,
        })
    }
}

fn check_status(response: &Response, url: &str) -> Result<(), EngineError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(EngineError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build source metadata from response headers.
pub fn source_info_from_headers(url: &str, headers: &HeaderMap) -> SourceInfo {
    // Read the header itself: a HEAD response's body length is always zero.
    let total_size = header_str(headers, header::CONTENT_LENGTH)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let supports_resume = header_str(headers, header::ACCEPT_RANGES)
        .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false);

    let filename = naming::resolve_filename(url, header_str(headers, header::CONTENT_DISPOSITION));

    let duration = header_str(headers, CONTENT_DURATION_HEADER)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);

    let last_modified = header_str(headers, header::LAST_MODIFIED).and_then(parse_http_date);

    SourceInfo {
        locator: url.to_string(),
        total_size,
        duration,
        default_filename: filename,
        supports_resume,
        last_modified,
    }
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

/// First byte position of a `Content-Range: bytes start-end/total` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = header_str(headers, header::CONTENT_RANGE)?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
