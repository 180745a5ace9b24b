// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The download store: every requested transfer is a [`DownloadEntry`]
//! kept in memory and persisted to a plain-text keyed file with an
//! append-only journal for crash safety.
//!
//! Writes go to `downloads.db.tmp` first and are renamed over the main
//! file, so a crash mid-rewrite can never corrupt the store. Any
//! mutation appends a journal line; a journal found at open time means
//! a flush was pending when the process died, so the store is rewritten
//! immediately after load.

use crate::errors::DatabaseError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{event, Level};

const DB_HEADER: &str = "IDMCLONE_DB_V1";
const SPEED_HISTORY_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Connecting,
    Downloading,
    Paused,
    Complete,
    Error,
    Waiting,
    Merging,
}

impl DownloadStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            DownloadStatus::Queued => 0,
            DownloadStatus::Connecting => 1,
            DownloadStatus::Downloading => 2,
            DownloadStatus::Paused => 3,
            DownloadStatus::Complete => 4,
            DownloadStatus::Error => 5,
            DownloadStatus::Waiting => 6,
            DownloadStatus::Merging => 7,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => DownloadStatus::Connecting,
            2 => DownloadStatus::Downloading,
            3 => DownloadStatus::Paused,
            4 => DownloadStatus::Complete,
            5 => DownloadStatus::Error,
            6 => DownloadStatus::Waiting,
            7 => DownloadStatus::Merging,
            _ => DownloadStatus::Queued,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "Queued",
            DownloadStatus::Connecting => "Connecting",
            DownloadStatus::Downloading => "Downloading",
            DownloadStatus::Paused => "Paused",
            DownloadStatus::Complete => "Complete",
            DownloadStatus::Error => "Error",
            DownloadStatus::Waiting => "Waiting",
            DownloadStatus::Merging => "Assembling",
        }
    }
}

/// Persistable view of one segment: enough to resume and to paint a
/// progress bar, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSnapshot {
    pub start: u64,
    /// Inclusive end byte; -1 when the total size is unknown.
    pub end: i64,
    pub downloaded: u64,
    /// Owning worker at snapshot time; -1 when unassigned. Never
    /// carried across sessions.
    pub worker: i32,
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadEntry {
    pub id: String,
    pub url: String,
    pub final_url: String,
    pub file_name: String,
    pub save_path: PathBuf,

    /// Total size in bytes; -1 while unknown.
    pub file_size: i64,
    pub downloaded_bytes: u64,
    pub status: DownloadStatus,

    pub category: String,
    pub description: String,

    pub date_added: DateTime<Utc>,
    pub date_completed: Option<DateTime<Utc>>,

    pub referrer: String,
    pub cookies: String,
    pub user_agent: String,
    pub username: String,
    pub password: String,
    pub post_data: String,

    pub num_connections: usize,
    pub segments: Vec<SegmentSnapshot>,

    pub resume_supported: bool,
    pub etag: String,
    pub last_modified: String,
    pub content_type: String,

    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,

    pub checksum: String,
    pub checksum_type: String,

    pub current_speed: f64,
    pub average_speed: f64,
    /// Last 60 one-second samples, maintained by `update_progress`.
    pub speed_history: VecDeque<f64>,
}

impl Default for DownloadEntry {
    fn default() -> Self {
        DownloadEntry {
            id: String::new(),
            url: String::new(),
            final_url: String::new(),
            file_name: String::new(),
            save_path: PathBuf::new(),
            file_size: -1,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            category: String::new(),
            description: String::new(),
            date_added: Utc::now(),
            date_completed: None,
            referrer: String::new(),
            cookies: String::new(),
            user_agent: String::new(),
            username: String::new(),
            password: String::new(),
            post_data: String::new(),
            num_connections: crate::config::DEFAULT_MAX_CONNECTIONS,
            segments: Vec::new(),
            resume_supported: false,
            etag: String::new(),
            last_modified: String::new(),
            content_type: String::new(),
            error_message: String::new(),
            retry_count: 0,
            max_retries: crate::config::DEFAULT_RETRY_COUNT,
            checksum: String::new(),
            checksum_type: String::new(),
            current_speed: 0.0,
            average_speed: 0.0,
            speed_history: VecDeque::new(),
        }
    }
}

impl DownloadEntry {
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn full_path(&self) -> PathBuf {
        self.save_path.join(&self.file_name)
    }

    pub fn partial_path(&self) -> PathBuf {
        let mut name = self.file_name.clone();
        name.push_str(".part");
        self.save_path.join(name)
    }

    pub fn segment_path(&self) -> PathBuf {
        let mut name = self.file_name.clone();
        name.push_str(".seg");
        self.save_path.join(name)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.file_size <= 0 {
            return 0.0;
        }
        self.downloaded_bytes as f64 / self.file_size as f64 * 100.0
    }

    fn push_speed_sample(&mut self, speed: f64) {
        self.current_speed = speed;
        self.speed_history.push_back(speed);
        while self.speed_history.len() > SPEED_HISTORY_LEN {
            self.speed_history.pop_front();
        }
        if !self.speed_history.is_empty() {
            self.average_speed =
                self.speed_history.iter().sum::<f64>() / self.speed_history.len() as f64;
        }
    }
}

struct DatabaseInner {
    db_path: PathBuf,
    journal_path: PathBuf,
    entries: BTreeMap<String, DownloadEntry>,
    dirty: bool,
}

pub struct Database {
    inner: Mutex<DatabaseInner>,
}

impl Database {
    /// Open or create the store. A leftover journal means a mutation
    /// never reached the main file, so the store is rewritten at once.
    pub fn open(db_path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let journal_path = PathBuf::from(format!("{}.journal", db_path.display()));
        let journal_found = journal_path.exists();
        if journal_found {
            event!(Level::WARN, "Journal file found, replaying for crash recovery");
        }

        let mut inner = DatabaseInner {
            db_path: db_path.to_path_buf(),
            journal_path,
            entries: BTreeMap::new(),
            dirty: false,
        };

        if inner.db_path.exists() {
            inner.load_from_disk()?;
            event!(
                Level::INFO,
                entries = inner.entries.len(),
                path = %inner.db_path.display(),
                "Download store loaded"
            );
        } else {
            event!(Level::INFO, path = %inner.db_path.display(), "Creating new download store");
            inner.dirty = true;
        }

        if journal_found {
            inner.dirty = true;
        }
        if inner.dirty {
            inner.save_to_disk()?;
            inner.dirty = false;
            inner.clean_journal();
        }

        Ok(Database {
            inner: Mutex::new(inner),
        })
    }

    pub fn add_entry(&self, mut entry: DownloadEntry) -> String {
        let mut inner = self.inner.lock().unwrap();
        if entry.id.is_empty() {
            entry.id = DownloadEntry::generate_id();
        }
        let id = entry.id.clone();
        inner.write_journal("ADD", &id, &entry.file_name);
        event!(Level::INFO, id = %id, file = %entry.file_name, "Store: entry added");
        inner.entries.insert(id.clone(), entry);
        inner.dirty = true;
        id
    }

    pub fn update_entry(&self, entry: &DownloadEntry) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(&entry.id) {
            event!(Level::WARN, id = %entry.id, "Store: update for unknown entry");
            return false;
        }
        inner.write_journal("UPDATE", &entry.id, &entry.file_name);
        inner.entries.insert(entry.id.clone(), entry.clone());
        inner.dirty = true;
        true
    }

    /// Fast path used once a second while a download is active: refresh
    /// the progress fields without touching the rest of the record.
    pub fn update_progress(
        &self,
        id: &str,
        downloaded_bytes: u64,
        speed: f64,
        segments: Vec<SegmentSnapshot>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        entry.downloaded_bytes = downloaded_bytes;
        entry.segments = segments;
        entry.push_speed_sample(speed);
        let file_name = entry.file_name.clone();
        inner.write_journal("UPDATE", id, &file_name);
        inner.dirty = true;
        true
    }

    pub fn remove_entry(&self, id: &str, delete_files: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.remove(id) else {
            return false;
        };
        if delete_files {
            let _ = fs::remove_file(entry.full_path());
            let _ = fs::remove_file(entry.partial_path());
            let _ = fs::remove_file(entry.segment_path());
        }
        inner.write_journal("REMOVE", id, &entry.file_name);
        event!(Level::INFO, id = %id, file = %entry.file_name, "Store: entry removed");
        inner.dirty = true;
        true
    }

    pub fn get_entry(&self, id: &str) -> Option<DownloadEntry> {
        self.inner.lock().unwrap().entries.get(id).cloned()
    }

    pub fn all_entries(&self) -> Vec<DownloadEntry> {
        self.inner.lock().unwrap().entries.values().cloned().collect()
    }

    pub fn entries_by_status(&self, status: DownloadStatus) -> Vec<DownloadEntry> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    pub fn count_by_status(&self, status: DownloadStatus) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn remove_completed(&self, delete_files: bool) -> usize {
        let ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .values()
                .filter(|e| e.status == DownloadStatus::Complete)
                .map(|e| e.id.clone())
                .collect()
        };
        for id in &ids {
            self.remove_entry(id, delete_files);
        }
        ids.len()
    }

    /// Rewrite the main file atomically and drop the journal.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.dirty {
            return Ok(());
        }
        inner.save_to_disk()?;
        inner.dirty = false;
        inner.clean_journal();
        Ok(())
    }
}

impl DatabaseInner {
    fn write_journal(&self, op: &str, id: &str, file_name: &str) {
        let record = format!("{op}|{id}|{file_name}\n");
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .and_then(|mut f| f.write_all(record.as_bytes()));
        if let Err(e) = result {
            event!(Level::WARN, error = %e, "Store: journal append failed");
        }
    }

    fn clean_journal(&self) {
        let _ = fs::remove_file(&self.journal_path);
    }

    fn save_to_disk(&self) -> Result<(), DatabaseError> {
        let tmp_path = PathBuf::from(format!("{}.tmp", self.db_path.display()));

        let mut out = String::new();
        out.push_str(DB_HEADER);
        out.push('\n');
        out.push_str(&format!("ENTRY_COUNT={}\n", self.entries.len()));
        out.push_str("---\n");

        for entry in self.entries.values() {
            out.push_str("BEGIN_ENTRY\n");
            push_field(&mut out, "id", &entry.id);
            push_field(&mut out, "url", &entry.url);
            push_field(&mut out, "finalUrl", &entry.final_url);
            push_field(&mut out, "fileName", &entry.file_name);
            push_field(&mut out, "savePath", &entry.save_path.display().to_string());
            push_field(&mut out, "fileSize", &entry.file_size.to_string());
            push_field(&mut out, "downloadedBytes", &entry.downloaded_bytes.to_string());
            push_field(&mut out, "status", &entry.status.as_i32().to_string());
            push_field(&mut out, "category", &entry.category);
            push_field(&mut out, "description", &entry.description);
            push_field(&mut out, "dateAdded", &entry.date_added.to_rfc3339());
            push_field(
                &mut out,
                "dateCompleted",
                &entry
                    .date_completed
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
            );
            push_field(&mut out, "referrer", &entry.referrer);
            push_field(&mut out, "cookies", &entry.cookies);
            push_field(&mut out, "userAgent", &entry.user_agent);
            push_field(&mut out, "username", &entry.username);
            push_field(&mut out, "password", &entry.password);
            push_field(&mut out, "postData", &entry.post_data);
            push_field(&mut out, "numConnections", &entry.num_connections.to_string());
            push_field(
                &mut out,
                "resumeSupported",
                if entry.resume_supported { "1" } else { "0" },
            );
            push_field(&mut out, "etag", &entry.etag);
            push_field(&mut out, "lastModified", &entry.last_modified);
            push_field(&mut out, "contentType", &entry.content_type);
            push_field(&mut out, "errorMessage", &entry.error_message);
            push_field(&mut out, "retryCount", &entry.retry_count.to_string());
            push_field(&mut out, "maxRetries", &entry.max_retries.to_string());
            push_field(&mut out, "checksum", &entry.checksum);
            push_field(&mut out, "checksumType", &entry.checksum_type);
            push_field(&mut out, "currentSpeed", &entry.current_speed.to_string());
            push_field(&mut out, "averageSpeed", &entry.average_speed.to_string());

            out.push_str(&format!("segmentCount={}\n", entry.segments.len()));
            for seg in &entry.segments {
                out.push_str(&format!(
                    "seg={},{},{},{},{}\n",
                    seg.start,
                    seg.end,
                    seg.downloaded,
                    seg.worker,
                    if seg.complete { 1 } else { 0 }
                ));
            }

            out.push_str("END_ENTRY\n");
        }

        out.push_str("END_DB\n");

        fs::write(&tmp_path, out.as_bytes())?;
        fs::rename(&tmp_path, &self.db_path)?;
        Ok(())
    }

    fn load_from_disk(&mut self) -> Result<(), DatabaseError> {
        let contents = fs::read_to_string(&self.db_path)?;
        let mut lines = contents.lines();

        match lines.next() {
            Some(DB_HEADER) => {}
            other => {
                return Err(DatabaseError::Corrupt(format!(
                    "bad header: {}",
                    other.unwrap_or("<empty>")
                )))
            }
        }

        // Skip the remaining header lines.
        for line in lines.by_ref() {
            if line == "---" {
                break;
            }
        }

        let mut current = DownloadEntry::default();
        let mut in_entry = false;

        for line in lines {
            match line {
                "END_DB" => break,
                "BEGIN_ENTRY" => {
                    current = DownloadEntry::default();
                    in_entry = true;
                    continue;
                }
                "END_ENTRY" => {
                    if in_entry && !current.id.is_empty() {
                        self.entries
                            .insert(current.id.clone(), std::mem::take(&mut current));
                    }
                    in_entry = false;
                    continue;
                }
                _ => {}
            }

            if !in_entry {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "id" => current.id = value.to_string(),
                "url" => current.url = value.to_string(),
                "finalUrl" => current.final_url = value.to_string(),
                "fileName" => current.file_name = value.to_string(),
                "savePath" => current.save_path = PathBuf::from(value),
                "fileSize" => current.file_size = value.parse().unwrap_or(-1),
                "downloadedBytes" => current.downloaded_bytes = value.parse().unwrap_or(0),
                "status" => {
                    current.status = DownloadStatus::from_i32(value.parse().unwrap_or(0))
                }
                "category" => current.category = value.to_string(),
                "description" => current.description = value.to_string(),
                "dateAdded" => {
                    if let Ok(d) = DateTime::parse_from_rfc3339(value) {
                        current.date_added = d.with_timezone(&Utc);
                    }
                }
                "dateCompleted" => {
                    current.date_completed = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
                "referrer" => current.referrer = value.to_string(),
                "cookies" => current.cookies = value.to_string(),
                "userAgent" => current.user_agent = value.to_string(),
                "username" => current.username = value.to_string(),
                "password" => current.password = value.to_string(),
                "postData" => current.post_data = value.to_string(),
                "numConnections" => {
                    current.num_connections = value
                        .parse()
                        .unwrap_or(crate::config::DEFAULT_MAX_CONNECTIONS)
                }
                "resumeSupported" => current.resume_supported = value == "1",
                "etag" => current.etag = value.to_string(),
                "lastModified" => current.last_modified = value.to_string(),
                "contentType" => current.content_type = value.to_string(),
                "errorMessage" => current.error_message = value.to_string(),
                "retryCount" => current.retry_count = value.parse().unwrap_or(0),
                "maxRetries" => {
                    current.max_retries =
                        value.parse().unwrap_or(crate::config::DEFAULT_RETRY_COUNT)
                }
                "checksum" => current.checksum = value.to_string(),
                "checksumType" => current.checksum_type = value.to_string(),
                "currentSpeed" => current.current_speed = value.parse().unwrap_or(0.0),
                "averageSpeed" => current.average_speed = value.parse().unwrap_or(0.0),
                "seg" => {
                    let parts: Vec<&str> = value.split(',').collect();
                    if parts.len() >= 5 {
                        current.segments.push(SegmentSnapshot {
                            start: parts[0].parse().unwrap_or(0),
                            end: parts[1].parse().unwrap_or(-1),
                            downloaded: parts[2].parse().unwrap_or(0),
                            worker: parts[3].parse().unwrap_or(-1),
                            complete: parts[4] == "1",
                        });
                    }
                }
                _ => {} // unknown keys are preserved-by-ignore for forward compat
            }
        }

        Ok(())
    }
}

/// One `key=value` line; embedded newlines would break the framing, so
/// they are flattened to spaces.
fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    if value.contains('\n') || value.contains('\r') {
        out.push_str(&value.replace(['\n', '\r'], " "));
    } else {
        out.push_str(value);
    }
    out.push('\n');
}
