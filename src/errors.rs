// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("An I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to finalize {0}")]
    Finalize(String),
}

impl StorageError {
    /// Disk-full, permission and path errors are fatal for the download;
    /// none of them are worth retrying on the same path.
    pub fn is_retriable(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Name resolution failed: {0}")]
    Resolve(String),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("Origin ignored the Range header")]
    RangeIgnored,

    #[error("TLS validation failed: {0}")]
    Tls(String),

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("FTP {code}: {message}")]
    Ftp { code: u32, message: String },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ClientError {
    /// Whether a worker should back off and retry the same range.
    ///
    /// Network-level failures and the transient HTTP statuses
    /// (408, 429, 500, 502, 503, 504, 509) retry; every other 4xx,
    /// TLS failures and local disk errors terminate the attempt.
    /// FTP replies in the 4xx class are transient by definition.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Timeout
            | ClientError::Connect(_)
            | ClientError::Resolve(_)
            | ClientError::Reset(_) => true,
            ClientError::Status(code) => {
                matches!(code, 408 | 429 | 500 | 502 | 503 | 504 | 509)
            }
            ClientError::Ftp { code, .. } => (400..500).contains(code),
            ClientError::RangeIgnored
            | ClientError::Tls(_)
            | ClientError::TooManyRedirects
            | ClientError::InvalidUrl(_)
            | ClientError::Protocol(_)
            | ClientError::Storage(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("An I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is corrupt: {0}")]
    Corrupt(String),
}
