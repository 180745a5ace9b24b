// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{event, Level};

pub const MIN_CONNECTIONS: usize = 1;
pub const MAX_CONNECTIONS: usize = 32;
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
/// Read-buffer granularity; split points are aligned down to this.
pub const BUFFER_SIZE: u64 = 65_536;
pub const MIN_SEGMENT_SIZE: u64 = 65_536;
pub const DEFAULT_RETRY_COUNT: u32 = 20;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
pub const STATE_SAVE_INTERVAL_SECS: u64 = 15;
pub const SPEED_SAMPLE_INTERVAL_SECS: u64 = 1;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub connections_per_download: usize,
    pub min_segment_size: u64,
    /// Global limit in bytes per second; 0 means unlimited.
    pub speed_limit_bps: u64,
    pub max_retries: u32,
    pub retry_base_secs: u64,
    pub connect_timeout_secs: u64,
    pub receive_timeout_secs: u64,
    pub user_agent: String,
    pub verify_tls: bool,
    pub proxy: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            connections_per_download: DEFAULT_MAX_CONNECTIONS,
            min_segment_size: MIN_SEGMENT_SIZE,
            speed_limit_bps: 0,
            max_retries: DEFAULT_RETRY_COUNT,
            retry_base_secs: DEFAULT_RETRY_DELAY_SECS,
            connect_timeout_secs: 30,
            receive_timeout_secs: 60,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            verify_tls: true,
            proxy: None,
        }
    }
}

impl Settings {
    pub fn clamped_connections(&self) -> usize {
        self.connections_per_download
            .clamp(MIN_CONNECTIONS, MAX_CONNECTIONS)
    }
}

/// The directory holding the store, segment state and logs.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("swiftget"))
        .unwrap_or_else(|| PathBuf::from("./swiftget-data"))
}

fn settings_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("settings.json")
}

/// Load settings from the data directory, falling back to defaults on a
/// missing or unreadable file. A broken file is left in place so the
/// user can inspect it.
pub fn load_settings(data_dir: &std::path::Path) -> Settings {
    let path = settings_path(data_dir);
    match fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                event!(Level::WARN, path = %path.display(), error = %e,
                       "Settings file unreadable, using defaults");
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

pub fn save_settings(data_dir: &std::path::Path, settings: &Settings) -> std::io::Result<()> {
    fs::create_dir_all(data_dir)?;
    let serialized = serde_json::to_string_pretty(settings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(settings_path(data_dir), serialized)
}
