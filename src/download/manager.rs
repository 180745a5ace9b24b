// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-download orchestration: probe the origin, build or restore the
//! segment plan, open the partial file, run the workers, then settle
//! the entry as Paused, Complete or Error. A 1 s tick samples speeds
//! and a 15 s tick persists state while the transfer is live.

use crate::client::ftp::FtpClient;
use crate::client::http::HttpClient;
use crate::client::{TransferClient, TransferRequest};
use crate::config::{self, Settings};
use crate::database::{Database, DownloadEntry, DownloadStatus};
use crate::download::planner::SegmentPlanner;
use crate::download::resume;
use crate::download::state::DownloadControl;
use crate::download::worker::{self, WorkerContext, WorkerShared};
use crate::download::{DownloadParameters, ManagerEvent};
use crate::filename;
use crate::hashing::{self, HashAlgorithm};
use crate::observer::ObserverHub;
use crate::storage::{self, ConflictPolicy, PartialFile};
use crate::token_bucket::TokenBucket;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinSet;
use tracing::{event, Level};

/// A segment with no activity for this long is taken from its worker
/// and requeued.
const STALL_TIMEOUT: Duration = Duration::from_secs(120);
const SPEED_EMA_PERIOD: f64 = 5.0;

pub struct DownloadManager {
    entry: DownloadEntry,
    database: Arc<Database>,
    hub: Arc<ObserverHub>,
    bucket: Arc<tokio::sync::Mutex<TokenBucket>>,
    control: Arc<DownloadControl>,
    settings: Arc<Settings>,
    event_tx: Sender<ManagerEvent>,
    speed_cell: Arc<AtomicU64>,

    planner: Arc<SegmentPlanner>,
    shared: Arc<WorkerShared>,
    speed_ema: f64,
}

impl DownloadManager {
    pub fn new(parameters: DownloadParameters) -> Self {
        let DownloadParameters {
            entry,
            database,
            hub,
            bucket,
            control,
            settings,
            event_tx,
            speed_cell,
        } = parameters;

        let planner = Arc::new(SegmentPlanner::new(
            entry
                .num_connections
                .clamp(config::MIN_CONNECTIONS, config::MAX_CONNECTIONS),
            settings.min_segment_size,
        ));

        DownloadManager {
            entry,
            database,
            hub,
            bucket,
            control,
            settings,
            event_tx,
            speed_cell,
            planner,
            shared: Arc::new(WorkerShared::default()),
            speed_ema: 0.0,
        }
    }

    pub async fn run(mut self) {
        let id = self.entry.id.clone();
        self.execute().await;
        let _ = self.event_tx.send(ManagerEvent::Finished { id }).await;
    }

    async fn execute(&mut self) {
        self.entry.status = DownloadStatus::Connecting;
        self.entry.error_message.clear();
        self.database.update_entry(&self.entry);

        // One client per download so per-entry TLS/proxy settings
        // apply; its connections are shared by all workers.
        let client = match self.build_client() {
            Ok(client) => Arc::new(client),
            Err(message) => {
                self.fail(&message).await;
                return;
            }
        };

        // Phase 1: probe.
        let probe_request = self.base_request(&self.entry.url);
        let probe = match client.probe(&probe_request).await {
            Ok(probe) => probe,
            Err(e) => {
                self.fail(&e.to_string()).await;
                return;
            }
        };
        if probe.status >= 400 {
            self.fail(&format!("HTTP {}", probe.status)).await;
            return;
        }

        // Phase 3 runs against the *saved* validator tokens, so the
        // resume decision happens before the tokens are refreshed.
        let had_saved_state =
            self.entry.downloaded_bytes > 0 && self.entry.segment_path().exists();
        let mut resumed = false;
        if had_saved_state {
            if probe.accept_ranges && resume::validate_response(&mut self.entry, &probe) {
                resumed = resume::restore_state(&mut self.entry, &self.planner);
            }
            if !resumed {
                event!(
                    Level::INFO,
                    file = %self.entry.file_name,
                    "Saved state unusable, restarting from zero"
                );
                resume::discard_state(&self.entry);
                self.entry.downloaded_bytes = 0;
            }
        }

        // Phase 2: populate the entry from the origin's answer. A
        // zero-length answer is a known size, not an unknown one.
        if probe.content_length >= 0 {
            self.entry.file_size = probe.content_length;
        }
        self.entry.resume_supported = probe.accept_ranges;
        if !probe.etag.is_empty() {
            self.entry.etag = probe.etag.clone();
        }
        if !probe.last_modified.is_empty() {
            self.entry.last_modified = probe.last_modified.clone();
        }
        if !probe.final_url.is_empty() {
            self.entry.final_url = probe.final_url.clone();
        }
        self.entry.content_type = probe.content_type.clone();

        if filename::is_generic(&self.entry.file_name) {
            if let Some(name) = probe.disposition_filename() {
                self.entry.file_name = filename::sanitize(&name);
            } else {
                let source = if self.entry.final_url.is_empty() {
                    &self.entry.url
                } else {
                    &self.entry.final_url
                };
                self.entry.file_name = filename::from_url(source);
            }
        }
        if self.entry.category.is_empty() {
            self.entry.category =
                filename::categorize(&filename::extension(&self.entry.file_name)).to_string();
        }

        if !resumed {
            self.planner.initialize(self.entry.file_size);
        }

        self.entry.status = DownloadStatus::Downloading;
        self.database.update_entry(&self.entry);

        // Phase 4: open and pre-allocate the partial file. A fresh plan
        // must not inherit bytes from an earlier attempt; the new body
        // may be shorter than what is already on disk.
        let partial_path = self.entry.partial_path();
        if !resumed {
            if let Err(e) = tokio::fs::remove_file(&partial_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    self.fail(&format!("Failed to clear stale partial file: {e}")).await;
                    return;
                }
            }
        }
        let partial = match PartialFile::open(&partial_path, self.entry.file_size).await {
            Ok(partial) => partial,
            Err(e) => {
                self.fail(&format!("Failed to create download file: {e}")).await;
                return;
            }
        };

        // Phase 5: launch workers; a non-resumable origin gets one.
        let worker_count = if self.planner.is_complete() {
            0
        } else if self.entry.resume_supported {
            self.entry
                .num_connections
                .clamp(config::MIN_CONNECTIONS, config::MAX_CONNECTIONS)
        } else {
            1
        };

        event!(
            Level::INFO,
            file = %self.entry.file_name,
            size = self.entry.file_size,
            workers = worker_count,
            resumed,
            "Starting transfer"
        );

        let fetch_url = if self.entry.final_url.is_empty() {
            self.entry.url.clone()
        } else {
            self.entry.final_url.clone()
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(worker::run(WorkerContext {
                download_id: self.entry.id.clone(),
                worker_id,
                client: client.clone(),
                planner: self.planner.clone(),
                partial: partial.clone(),
                control: self.control.clone(),
                bucket: self.bucket.clone(),
                hub: self.hub.clone(),
                request_template: self.base_request(&fetch_url),
                total_size: self.entry.file_size,
                max_retries: self.entry.max_retries,
                retry_base_secs: self.settings.retry_base_secs,
                shared: self.shared.clone(),
            }));
        }

        // Phase 6: supervise until every worker has exited.
        self.supervise(&mut workers).await;

        // Phase 7: settle.
        self.finalize(&partial_path).await;
    }

    async fn supervise(&mut self, workers: &mut JoinSet<()>) {
        let mut speed_tick =
            tokio::time::interval(Duration::from_secs(config::SPEED_SAMPLE_INTERVAL_SECS));
        let mut persist_tick =
            tokio::time::interval(Duration::from_secs(config::STATE_SAVE_INTERVAL_SECS));
        // The first tick of an interval fires immediately; skip it so
        // state is not saved before anything happened.
        speed_tick.tick().await;
        persist_tick.tick().await;

        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            event!(Level::ERROR, error = %e, "Worker task panicked");
                        }
                    }
                }
                _ = speed_tick.tick() => {
                    self.sample_speed();
                }
                _ = persist_tick.tick() => {
                    self.planner.fail_stalled(STALL_TIMEOUT);
                    if !resume::save_state(&self.entry, &self.planner) {
                        event!(Level::WARN, "Periodic state save failed");
                    }
                    if let Err(e) = self.database.flush() {
                        event!(Level::WARN, error = %e, "Periodic store flush failed");
                    }
                }
            }
        }
    }

    /// Sum per-segment speeds, smooth them, and push the sample into
    /// the store and the registry's aggregation slot. The entry's
    /// downloaded count is only ever written from the planner.
    fn sample_speed(&mut self) {
        let instantaneous = self.planner.total_speed();
        let alpha = 2.0 / (SPEED_EMA_PERIOD + 1.0);
        self.speed_ema = instantaneous * alpha + self.speed_ema * (1.0 - alpha);

        self.speed_cell
            .store(self.speed_ema.to_bits(), Ordering::Relaxed);
        self.database.update_progress(
            &self.entry.id,
            self.planner.total_downloaded(),
            self.speed_ema,
            self.planner.snapshot(),
        );
    }

    async fn finalize(&mut self, partial_path: &std::path::Path) {
        self.entry.downloaded_bytes = self.planner.total_downloaded();
        self.entry.retry_count = self.shared.retries.load(Ordering::SeqCst);
        self.entry.current_speed = 0.0;
        self.speed_cell.store(0f64.to_bits(), Ordering::Relaxed);

        if self.control.is_cancelled() && !self.planner.is_complete() {
            self.entry.status = DownloadStatus::Paused;
            resume::save_state(&self.entry, &self.planner);
            self.database.update_entry(&self.entry);
            let _ = self.database.flush();
            self.hub.notify_paused(&self.entry.id);
            event!(Level::INFO, file = %self.entry.file_name, "Download paused");
            return;
        }

        if self.planner.is_complete() {
            self.entry.status = DownloadStatus::Merging;
            self.database.update_entry(&self.entry);

            if self.entry.file_size <= 0 {
                // Size was unknown; it is exactly what we wrote.
                self.entry.file_size = self.planner.total_downloaded() as i64;
            }

            match storage::finalize(
                partial_path,
                &self.entry.full_path(),
                ConflictPolicy::AutoRename,
            )
            .await
            {
                Ok(final_path) => {
                    storage::set_mtime(&final_path, &self.entry.last_modified);
                    self.verify_checksum(&final_path).await;
                    resume::cleanup_partial_files(&self.entry);

                    self.entry.status = DownloadStatus::Complete;
                    self.entry.date_completed = Some(Utc::now());
                    self.entry.downloaded_bytes = self.entry.file_size.max(0) as u64;
                    self.entry.error_message.clear();
                    self.database.update_entry(&self.entry);
                    let _ = self.database.flush();
                    self.hub.notify_complete(&self.entry.id);
                    event!(Level::INFO, file = %self.entry.file_name, "Download complete");
                }
                Err(e) => {
                    // Keep the partial file for manual recovery.
                    self.fail(&format!("Failed to finalize download: {e}")).await;
                }
            }
            return;
        }

        let message = {
            let last = self.shared.last_error();
            if last.is_empty() {
                "Download incomplete".to_string()
            } else {
                last
            }
        };
        resume::save_state(&self.entry, &self.planner);
        self.fail(&message).await;
    }

    async fn verify_checksum(&self, path: &std::path::Path) {
        if self.entry.checksum.is_empty() {
            return;
        }
        let Some(algorithm) = HashAlgorithm::parse(&self.entry.checksum_type) else {
            event!(
                Level::WARN,
                algorithm = %self.entry.checksum_type,
                "Unknown checksum algorithm, skipping verification"
            );
            return;
        };
        match hashing::verify_digest(path, &self.entry.checksum, algorithm).await {
            Ok(true) => {
                event!(Level::INFO, file = %self.entry.file_name, "Checksum verified");
            }
            Ok(false) => {
                event!(
                    Level::WARN,
                    file = %self.entry.file_name,
                    expected = %self.entry.checksum,
                    "Checksum mismatch"
                );
            }
            Err(e) => {
                event!(Level::WARN, error = %e, "Checksum verification failed to run");
            }
        }
    }

    async fn fail(&mut self, message: &str) {
        self.entry.status = DownloadStatus::Error;
        self.entry.error_message = message.to_string();
        // Before the plan exists (e.g. a failed probe) the stored
        // downloaded count must survive for a later resume.
        if self.planner.segment_count() > 0 {
            self.entry.downloaded_bytes = self.planner.total_downloaded();
        }
        self.database.update_entry(&self.entry);
        let _ = self.database.flush();
        self.hub.notify_error(&self.entry.id, message);
        event!(Level::ERROR, file = %self.entry.file_name, error = %message, "Download failed");
    }

    fn build_client(&self) -> Result<TransferClient, String> {
        let scheme = url::Url::parse(&self.entry.url)
            .map(|u| u.scheme().to_string())
            .map_err(|e| format!("Invalid URL: {e}"))?;

        if scheme == "ftp" {
            return Ok(TransferClient::Ftp(FtpClient::new(Duration::from_secs(
                self.settings.connect_timeout_secs,
            ))));
        }

        let user_agent = if self.entry.user_agent.is_empty() {
            &self.settings.user_agent
        } else {
            &self.entry.user_agent
        };
        HttpClient::new(
            user_agent,
            Duration::from_secs(self.settings.connect_timeout_secs),
            Duration::from_secs(self.settings.receive_timeout_secs),
            self.settings.verify_tls,
            self.settings.proxy.as_deref(),
        )
        .map(TransferClient::Http)
        .map_err(|e| e.to_string())
    }

    fn base_request(&self, url: &str) -> TransferRequest {
        TransferRequest {
            url: url.to_string(),
            referrer: self.entry.referrer.clone(),
            cookies: self.entry.cookies.clone(),
            user_agent: self.entry.user_agent.clone(),
            custom_headers: Default::default(),
            username: self.entry.username.clone(),
            password: self.entry.password.clone(),
            post_data: self.entry.post_data.clone(),
            range: None,
            connect_timeout: Duration::from_secs(self.settings.connect_timeout_secs),
            receive_timeout: Duration::from_secs(self.settings.receive_timeout_secs),
        }
    }
}
