//! HTTP byte source with range requests.
//!
//! The capability probe is a `HEAD` request: range mode is used only when the
//! server advertises `Accept-Ranges: bytes`, reports a length and serves the
//! body without content encoding. A server that later answers a ranged `GET`
//! with a full `200` response is reported as
//! [`PDFError::RangeRequestRejectedMidStream`] so the loader can fall back to
//! the sequential read.

use super::byte_source::{ByteSource, CancelFlag, SourceInfo};
use super::config::LoadOptions;
use super::error::{PDFError, PDFResult};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};

pub struct HttpSource {
    /// URL of the PDF file
    url: String,

    /// Async HTTP client for making requests
    client: Client,

    /// Response of the sequential full read, opened lazily.
    full_response: tokio::sync::Mutex<Option<Response>>,

    cancel: CancelFlag,
}

impl HttpSource {
    /// Creates a source for `url` using the headers and timeout from `options`.
    pub fn new(url: impl Into<String>, options: &LoadOptions) -> PDFResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.http_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PDFError::Generic(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PDFError::Generic(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(options.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| PDFError::Unreachable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpSource {
            url: url.into(),
            client,
            full_response: tokio::sync::Mutex::new(None),
            cancel: CancelFlag::default(),
        })
    }

    /// Returns the URL of the PDF file.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn check_status(&self, response: &Response) -> PDFResult<()> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(PDFError::MissingDocument(format!(
                "{} (HTTP {})",
                self.url, status
            )));
        }
        if !status.is_success() {
            return Err(PDFError::Unreachable(format!(
                "{} (HTTP {})",
                self.url, status
            )));
        }
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extracts the file name from a `Content-Disposition` header value.
///
/// Handles `filename="..."`, unquoted `filename=...` and the RFC 5987
/// `filename*=UTF-8''...` form (which wins when both are present).
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.trim().splitn(3, '\'').nth(2)?;
                let name = percent_decode_str(encoded).decode_utf8_lossy().into_owned();
                return Some(name).filter(|name| !name.is_empty());
            }
            "filename" => {
                let name = raw.trim().trim_matches('"').to_string();
                if !name.is_empty() {
                    plain = Some(name);
                }
            }
            _ => {}
        }
    }
    plain
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn probe(&self) -> PDFResult<SourceInfo> {
        self.cancel.check()?;
        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| PDFError::Unreachable(format!("HEAD {}: {}", self.url, e)))?;
        self.check_status(&response)?;

        let headers = response.headers();
        let content_length = header_str(headers, "content-length").and_then(|v| v.parse().ok());
        let accepts_ranges = header_str(headers, "accept-ranges")
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let identity_encoding = header_str(headers, "content-encoding")
            .map(|v| v.eq_ignore_ascii_case("identity"))
            .unwrap_or(true);
        let filename =
            header_str(headers, "content-disposition").and_then(filename_from_content_disposition);

        debug!(
            "HTTP probe {}: length={:?} ranges={} identity={}",
            self.url, content_length, accepts_ranges, identity_encoding
        );

        Ok(SourceInfo {
            content_length,
            supports_range_requests: accepts_ranges && identity_encoding && content_length.is_some(),
            filename,
        })
    }

    async fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        self.cancel.check()?;
        if begin >= end {
            return Ok(Bytes::new());
        }
        let range_header = format!("bytes={}-{}", begin, end - 1);
        let response = self
            .client
            .get(&self.url)
            .header("Range", range_header)
            .send()
            .await
            .map_err(|e| PDFError::Unreachable(format!("GET {} [{}..{}]: {}", self.url, begin, end, e)))?;

        if response.status() == StatusCode::OK {
            return Err(PDFError::RangeRequestRejectedMidStream(format!(
                "{} answered a range request with a full response",
                self.url
            )));
        }
        if response.status() != StatusCode::PARTIAL_CONTENT {
            self.check_status(&response)?;
            return Err(PDFError::RangeRequestRejectedMidStream(format!(
                "Expected 206 status, got {}",
                response.status()
            )));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| PDFError::Unreachable(format!("Failed to read response: {}", e)))?;
        self.cancel.check()?;

        if data.len() != end - begin {
            return Err(PDFError::RangeRequestRejectedMidStream(format!(
                "Expected {} bytes for range {}..{}, got {}",
                end - begin,
                begin,
                end,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn read_next(&self) -> PDFResult<Option<Bytes>> {
        self.cancel.check()?;
        let mut slot = self.full_response.lock().await;
        if slot.is_none() {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| PDFError::Unreachable(format!("GET {}: {}", self.url, e)))?;
            self.check_status(&response)?;
            *slot = Some(response);
        }

        let Some(response) = slot.as_mut() else {
            return Ok(None);
        };
        let chunk = response
            .chunk()
            .await
            .map_err(|e| PDFError::Unreachable(format!("Failed to read response: {}", e)))?;
        self.cancel.check()?;
        Ok(chunk)
    }

    fn cancel(&self, reason: &str) {
        self.cancel.cancel(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_plain() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("inline; filename=plain.pdf"),
            Some("plain.pdf".to_string())
        );
    }

    #[test]
    fn test_content_disposition_extended_wins() {
        assert_eq!(
            filename_from_content_disposition(
                "attachment; filename=\"fallback.pdf\"; filename*=UTF-8''caf%C3%A9.pdf"
            ),
            Some("café.pdf".to_string())
        );
        assert_eq!(filename_from_content_disposition("inline"), None);
    }

    #[test]
    fn test_content_disposition_escape_at_end() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename*=UTF-8''report%41"),
            Some("reportA".to_string())
        );
        // malformed escapes stay as written
        assert_eq!(
            filename_from_content_disposition("attachment; filename*=UTF-8''50%zz.pdf"),
            Some("50%zz.pdf".to_string())
        );
    }
}
