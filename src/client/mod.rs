// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The request facility consumed by connection workers: probe an origin
//! for metadata, then stream a (possibly ranged) body through a
//! per-chunk sink. HTTP(S) rides on reqwest; FTP is a small hand-rolled
//! control/data protocol.

pub mod ftp;
pub mod http;

use crate::errors::ClientError;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Everything a worker supplies when talking to the origin.
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub url: String,
    pub referrer: String,
    pub cookies: String,
    pub user_agent: String,
    pub custom_headers: BTreeMap<String, String>,
    pub username: String,
    pub password: String,
    pub post_data: String,
    /// Requested byte range: (first byte, optional inclusive last byte).
    pub range: Option<(u64, Option<u64>)>,
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
}

impl TransferRequest {
    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(start, end)| match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        })
    }
}

/// Metadata returned by a probe, normalized across protocols.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    pub status: u16,
    pub final_url: String,
    /// Advertised size; -1 when the origin does not say.
    pub content_length: i64,
    pub content_type: String,
    pub content_disposition: String,
    pub accept_ranges: bool,
    pub etag: String,
    pub last_modified: String,
}

impl ProbeInfo {
    /// Filename suggested by the origin via Content-Disposition,
    /// preferring the RFC 5987 `filename*` form.
    pub fn disposition_filename(&self) -> Option<String> {
        disposition_filename(&self.content_disposition)
    }
}

/// What the sink wants the transfer to do after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    Stop,
}

/// How a fetch ended when no error occurred: the body was exhausted, or
/// the sink asked to stop early (pause, cancel, segment satisfied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed,
    Stopped,
}

/// Per-chunk consumer of a streaming body. The chunk is borrowed; the
/// sink must finish with it before returning.
pub trait ChunkSink: Send {
    fn accept(
        &mut self,
        chunk: &[u8],
    ) -> impl Future<Output = Result<SinkFlow, ClientError>> + Send;
}

/// Protocol-dispatching client handle shared by one download's workers.
pub enum TransferClient {
    Http(http::HttpClient),
    Ftp(ftp::FtpClient),
}

impl TransferClient {
    pub async fn probe(&self, request: &TransferRequest) -> Result<ProbeInfo, ClientError> {
        match self {
            TransferClient::Http(client) => client.probe(request).await,
            TransferClient::Ftp(client) => client.probe(request).await,
        }
    }

    pub async fn fetch<S: ChunkSink>(
        &self,
        request: &TransferRequest,
        sink: &mut S,
    ) -> Result<FetchOutcome, ClientError> {
        match self {
            TransferClient::Http(client) => client.fetch(request, sink).await,
            TransferClient::Ftp(client) => client.fetch(request, sink).await,
        }
    }
}

/// Extract a filename from a Content-Disposition header value.
///
/// `filename*=charset''percent-encoded` (RFC 5987) wins over the plain
/// quoted or bare `filename=` form.
pub fn disposition_filename(header: &str) -> Option<String> {
    if header.is_empty() {
        return None;
    }

    if let Some(star_pos) = header.find("filename*=") {
        let value = &header[star_pos + "filename*=".len()..];
        if let Some(tick_pos) = value.find("''") {
            let encoded = &value[tick_pos + 2..];
            let end = encoded.find([';', ' ', '\t']).unwrap_or(encoded.len());
            let encoded = &encoded[..end];
            if !encoded.is_empty() {
                return Some(
                    urlencoding::decode(encoded)
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| encoded.to_string()),
                );
            }
        }
    }

    let fn_pos = header.find("filename=")?;
    let value = &header[fn_pos + "filename=".len()..];
    if let Some(rest) = value.strip_prefix('"') {
        let close = rest.find('"')?;
        let name = &rest[..close];
        if name.is_empty() {
            return None;
        }
        return Some(name.to_string());
    }

    let end = value.find([';', ' ', '\t']).unwrap_or(value.len());
    let name = value[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
