// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::client::{ChunkSink, FetchOutcome, ProbeInfo, SinkFlow, TransferRequest};
use crate::errors::ClientError;
use reqwest::header;
use reqwest::redirect::Policy;
use std::error::Error as _;
use std::time::Duration;
use tracing::{event, Level};

const MAX_REDIRECTS: usize = 10;

/// reqwest-backed HTTP/HTTPS client. One instance per download; reqwest
/// pools the underlying connections across that download's workers.
/// Redirects (301/302/307/308) are followed by reqwest up to
/// `MAX_REDIRECTS`, with 301/302 coerced to GET, and the final URL is
/// reported back through the probe/response metadata.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        receive_timeout: Duration,
        verify_tls: bool,
        proxy: Option<&str>,
    ) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .read_timeout(receive_timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .danger_accept_invalid_certs(!verify_tls);

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(map_error)?;
        Ok(HttpClient { client })
    }

    /// HEAD the origin and report normalized metadata. Callers decide
    /// what a >= 400 status means; this only transports it.
    pub async fn probe(&self, request: &TransferRequest) -> Result<ProbeInfo, ClientError> {
        let builder = self
            .apply_request_fields(self.client.head(&request.url), request)
            .timeout(request.receive_timeout.max(Duration::from_secs(1)));

        let response = builder.send().await.map_err(map_error)?;

        let header_str = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        let accept_ranges = {
            let value = header_str(header::ACCEPT_RANGES);
            !value.is_empty() && value != "none"
        };

        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|len| *len >= 0)
            .unwrap_or(-1);

        let info = ProbeInfo {
            status: response.status().as_u16(),
            final_url: response.url().to_string(),
            content_length,
            content_type: header_str(header::CONTENT_TYPE),
            content_disposition: header_str(header::CONTENT_DISPOSITION),
            accept_ranges,
            etag: header_str(header::ETAG),
            last_modified: header_str(header::LAST_MODIFIED),
        };

        event!(
            Level::DEBUG,
            url = %request.url,
            status = info.status,
            length = info.content_length,
            ranges = info.accept_ranges,
            "Probe completed"
        );

        Ok(info)
    }

    /// Stream the (possibly ranged) body through the sink. A 200 answer
    /// to a non-zero range start means the origin ignored the Range
    /// header, which would corrupt offsets if silently accepted.
    pub async fn fetch<S: ChunkSink>(
        &self,
        request: &TransferRequest,
        sink: &mut S,
    ) -> Result<FetchOutcome, ClientError> {
        let builder = if request.post_data.is_empty() {
            self.client.get(&request.url)
        } else {
            self.client.post(&request.url).body(request.post_data.clone())
        };
        let builder = self.apply_request_fields(builder, request);

        let mut response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ClientError::Status(status));
        }
        if let Some((start, _)) = request.range {
            if start > 0 && status != 206 {
                return Err(ClientError::RangeIgnored);
            }
        }

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if sink.accept(&chunk).await? == SinkFlow::Stop {
                        return Ok(FetchOutcome::Stopped);
                    }
                }
                Ok(None) => return Ok(FetchOutcome::Completed),
                Err(e) => return Err(map_error(e)),
            }
        }
    }

    fn apply_request_fields(
        &self,
        mut builder: reqwest::RequestBuilder,
        request: &TransferRequest,
    ) -> reqwest::RequestBuilder {
        if !request.referrer.is_empty() {
            builder = builder.header(header::REFERER, &request.referrer);
        }
        if !request.cookies.is_empty() {
            builder = builder.header(header::COOKIE, &request.cookies);
        }
        if !request.user_agent.is_empty() {
            builder = builder.header(header::USER_AGENT, &request.user_agent);
        }
        for (name, value) in &request.custom_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(range) = request.range_header() {
            builder = builder.header(header::RANGE, range);
        }
        if !request.username.is_empty() {
            builder = builder.basic_auth(&request.username, Some(&request.password));
        }
        builder
    }
}

/// Translate a reqwest failure into the engine's error taxonomy. The
/// source chain is inspected because reqwest folds TLS and DNS failures
/// into generic connect errors.
fn map_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        return ClientError::Timeout;
    }
    if e.is_redirect() {
        return ClientError::TooManyRedirects;
    }
    if e.is_builder() {
        return ClientError::InvalidUrl(e.to_string());
    }

    let mut detail = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        detail = format!("{detail}: {inner}");
        source = inner.source();
    }
    let lowered = detail.to_ascii_lowercase();

    if lowered.contains("certificate")
        || lowered.contains("self signed")
        || lowered.contains("unknownissuer")
        || lowered.contains("handshake")
    {
        return ClientError::Tls(detail);
    }
    if lowered.contains("dns") || lowered.contains("failed to lookup") {
        return ClientError::Resolve(detail);
    }
    if e.is_connect() {
        return ClientError::Connect(detail);
    }
    ClientError::Reset(detail)
}
