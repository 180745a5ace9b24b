// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use sha1::Digest as _;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Parse an algorithm name as stored on an entry ("MD5", "sha-256", ...).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Some(HashAlgorithm::Md5),
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Hex digest of a file's contents, streamed in 8 KiB reads.
pub async fn calculate_digest(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut buffer = [0u8; 8192];

    match algorithm {
        HashAlgorithm::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                context.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", context.compute()))
        }
        HashAlgorithm::Sha1 => {
            let mut hasher = sha1::Sha1::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = sha2::Sha256::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Case-insensitive comparison against an expected hex digest.
pub async fn verify_digest(
    path: &Path,
    expected: &str,
    algorithm: HashAlgorithm,
) -> std::io::Result<bool> {
    let actual = calculate_digest(path, algorithm).await?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
