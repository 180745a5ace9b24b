// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The process-wide download registry: owns the store, the global rate
//! limiter and every live orchestrator, and fans lifecycle events out
//! to observers.

use crate::client::ftp::FtpClient;
use crate::client::http::HttpClient;
use crate::client::{ProbeInfo, TransferClient, TransferRequest};
use crate::config::Settings;
use crate::database::{Database, DownloadEntry, DownloadStatus};
use crate::download::state::DownloadControl;
use crate::download::{DownloadManager, DownloadParameters, ManagerEvent};
use crate::errors::{ClientError, DatabaseError};
use crate::filename;
use crate::observer::{DownloadObserver, ObserverHub};
use crate::token_bucket::TokenBucket;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{event, Level};

/// Options accepted by [`DownloadRegistry::add`]; everything defaults
/// to the engine settings.
#[derive(Debug, Clone)]
pub struct AddOptions {
    pub file_name: Option<String>,
    pub save_path: Option<std::path::PathBuf>,
    pub referrer: String,
    pub cookies: String,
    pub user_agent: String,
    pub username: String,
    pub password: String,
    pub post_data: String,
    pub num_connections: Option<usize>,
    /// Expected digest as (hex, algorithm name).
    pub checksum: Option<(String, String)>,
    pub category: Option<String>,
    pub start_immediately: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        AddOptions {
            file_name: None,
            save_path: None,
            referrer: String::new(),
            cookies: String::new(),
            user_agent: String::new(),
            username: String::new(),
            password: String::new(),
            post_data: String::new(),
            num_connections: None,
            checksum: None,
            category: None,
            start_immediately: true,
        }
    }
}

struct ActiveDownload {
    control: Arc<DownloadControl>,
    speed_cell: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

pub struct DownloadRegistry {
    settings: Arc<Settings>,
    database: Arc<Database>,
    hub: Arc<ObserverHub>,
    bucket: Arc<Mutex<TokenBucket>>,
    active: StdMutex<HashMap<String, ActiveDownload>>,
    event_tx: mpsc::Sender<ManagerEvent>,
}

impl DownloadRegistry {
    /// Open the store under `data_dir` and bring the registry up. Spawns
    /// the event reaper and the 1 s aggregate-speed task; entries that
    /// were mid-transfer when the process died come back as Paused.
    pub fn open(settings: Settings, data_dir: &Path) -> Result<Arc<Self>, DatabaseError> {
        let database = Arc::new(Database::open(&data_dir.join("downloads.db"))?);

        for mut entry in database.all_entries() {
            if matches!(
                entry.status,
                DownloadStatus::Connecting
                    | DownloadStatus::Downloading
                    | DownloadStatus::Merging
                    | DownloadStatus::Waiting
            ) {
                entry.status = DownloadStatus::Paused;
                entry.current_speed = 0.0;
                database.update_entry(&entry);
            }
        }
        database.flush()?;

        let bucket = Arc::new(Mutex::new(TokenBucket::new(
            settings.speed_limit_bps as f64,
        )));

        let (event_tx, event_rx) = mpsc::channel::<ManagerEvent>(100);

        let registry = Arc::new(DownloadRegistry {
            settings: Arc::new(settings),
            database,
            hub: Arc::new(ObserverHub::new()),
            bucket,
            active: StdMutex::new(HashMap::new()),
            event_tx,
        });

        spawn_event_reaper(Arc::downgrade(&registry), event_rx);
        spawn_speed_aggregator(Arc::downgrade(&registry));

        Ok(registry)
    }

    /// Register a new download and (by default) start it right away.
    /// Returns the new entry's id.
    pub fn add(&self, url: &str, options: AddOptions) -> String {
        let file_name = options
            .file_name
            .as_deref()
            .map(filename::sanitize)
            .unwrap_or_else(|| filename::from_url(url));

        let mut entry = DownloadEntry {
            id: DownloadEntry::generate_id(),
            url: url.to_string(),
            file_name,
            save_path: options
                .save_path
                .unwrap_or_else(|| self.settings.download_dir.clone()),
            referrer: options.referrer,
            cookies: options.cookies,
            username: options.username,
            password: options.password,
            post_data: options.post_data,
            user_agent: if options.user_agent.is_empty() {
                self.settings.user_agent.clone()
            } else {
                options.user_agent
            },
            num_connections: options
                .num_connections
                .unwrap_or_else(|| self.settings.clamped_connections()),
            max_retries: self.settings.max_retries,
            status: DownloadStatus::Queued,
            ..Default::default()
        };
        if let Some((checksum, checksum_type)) = options.checksum {
            entry.checksum = checksum;
            entry.checksum_type = checksum_type;
        }
        entry.category = options.category.unwrap_or_else(|| {
            filename::categorize(&filename::extension(&entry.file_name)).to_string()
        });

        let start = options.start_immediately;
        let id = self.database.add_entry(entry);
        self.hub.notify_added(&id);
        event!(Level::INFO, id = %id, url = %url, "Download added");

        if start {
            self.start(&id);
        }
        id
    }

    /// Start a queued, paused or errored download. False if the id is
    /// unknown or the download is already running.
    pub fn start(&self, id: &str) -> bool {
        let Some(entry) = self.database.get_entry(id) else {
            event!(Level::WARN, id = %id, "Start requested for unknown download");
            return false;
        };
        let was_paused = entry.status == DownloadStatus::Paused;

        let mut active = self.active.lock().unwrap();
        if active.contains_key(id) {
            return false;
        }

        let control = Arc::new(DownloadControl::new());
        let speed_cell = Arc::new(AtomicU64::new(0));
        let manager = DownloadManager::new(DownloadParameters {
            entry,
            database: self.database.clone(),
            hub: self.hub.clone(),
            bucket: self.bucket.clone(),
            control: control.clone(),
            settings: self.settings.clone(),
            event_tx: self.event_tx.clone(),
            speed_cell: speed_cell.clone(),
        });
        let task = tokio::spawn(manager.run());

        active.insert(
            id.to_string(),
            ActiveDownload {
                control,
                speed_cell,
                task,
            },
        );
        drop(active);

        if was_paused {
            self.hub.notify_resumed(id);
        } else {
            self.hub.notify_started(id);
        }
        true
    }

    /// Stop in-flight work but keep the entry restartable. A download
    /// that is not running is just marked Paused in the store.
    pub fn pause(&self, id: &str) -> bool {
        {
            let active = self.active.lock().unwrap();
            if let Some(download) = active.get(id) {
                download.control.pause();
                return true;
            }
        }

        let Some(mut entry) = self.database.get_entry(id) else {
            return false;
        };
        if entry.status != DownloadStatus::Complete {
            entry.status = DownloadStatus::Paused;
            self.database.update_entry(&entry);
            self.hub.notify_paused(id);
        }
        true
    }

    /// Cancel in-flight work without the Paused notification semantics.
    pub fn stop(&self, id: &str) -> bool {
        let active = self.active.lock().unwrap();
        match active.get(id) {
            Some(download) => {
                download.control.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop (if needed) and delete the entry, optionally with its
    /// files. Waits briefly for the orchestrator to let go of them.
    pub async fn remove(&self, id: &str, delete_files: bool) -> bool {
        self.stop(id);
        for _ in 0..100 {
            if !self.is_active(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let removed = self.database.remove_entry(id, delete_files);
        if removed {
            let _ = self.database.flush();
            self.hub.notify_removed(id);
        }
        removed
    }

    pub fn remove_completed(&self) -> usize {
        let removed = self.database.remove_completed(false);
        if removed > 0 {
            let _ = self.database.flush();
        }
        removed
    }

    pub fn resume_all(&self) {
        for entry in self.database.entries_by_status(DownloadStatus::Paused) {
            self.start(&entry.id);
        }
    }

    pub fn list(&self) -> Vec<DownloadEntry> {
        self.database.all_entries()
    }

    pub fn get(&self, id: &str) -> Option<DownloadEntry> {
        self.database.get_entry(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.lock().unwrap().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Aggregate speed over all running downloads, bytes/sec.
    pub fn total_speed(&self) -> f64 {
        self.active
            .lock()
            .unwrap()
            .values()
            .map(|d| f64::from_bits(d.speed_cell.load(Ordering::Relaxed)))
            .sum()
    }

    pub fn add_observer(&self, observer: Arc<dyn DownloadObserver>) {
        self.hub.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn DownloadObserver>) {
        self.hub.remove(observer);
    }

    /// Set the global bandwidth budget; 0 turns limiting off.
    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.bucket.lock().await.set_rate(bytes_per_sec as f64);
    }

    pub async fn set_limiter_enabled(&self, enabled: bool) {
        self.bucket.lock().await.set_enabled(enabled);
    }

    /// HEAD a URL without creating an entry: response metadata plus the
    /// suggested (sanitized) filename and category, for an add dialog
    /// or dry run.
    pub async fn probe_url(
        &self,
        url: &str,
    ) -> Result<(ProbeInfo, String, String), ClientError> {
        let scheme = url::Url::parse(url)
            .map(|u| u.scheme().to_string())
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        let client = if scheme == "ftp" {
            TransferClient::Ftp(FtpClient::new(Duration::from_secs(
                self.settings.connect_timeout_secs,
            )))
        } else {
            TransferClient::Http(HttpClient::new(
                &self.settings.user_agent,
                Duration::from_secs(self.settings.connect_timeout_secs),
                Duration::from_secs(self.settings.receive_timeout_secs),
                self.settings.verify_tls,
                self.settings.proxy.as_deref(),
            )?)
        };

        let request = TransferRequest {
            url: url.to_string(),
            user_agent: self.settings.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.settings.connect_timeout_secs),
            receive_timeout: Duration::from_secs(self.settings.receive_timeout_secs),
            ..Default::default()
        };
        let info = client.probe(&request).await?;

        let name = info
            .disposition_filename()
            .map(|n| filename::sanitize(&n))
            .unwrap_or_else(|| {
                filename::from_url(if info.final_url.is_empty() {
                    url
                } else {
                    &info.final_url
                })
            });
        let category = filename::categorize(&filename::extension(&name)).to_string();
        Ok((info, name, category))
    }

    /// Cancel everything, wait for orchestrators to settle, and flush
    /// the store. Called once on the way out of the process.
    pub async fn shutdown(&self) {
        {
            let active = self.active.lock().unwrap();
            for download in active.values() {
                download.control.cancel();
            }
        }

        for _ in 0..100 {
            if self.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Err(e) = self.database.flush() {
            event!(Level::ERROR, error = %e, "Final store flush failed");
        }
        event!(Level::INFO, "Registry shut down");
    }
}

/// Removes finished orchestrators from the active map.
fn spawn_event_reaper(
    registry: Weak<DownloadRegistry>,
    mut event_rx: mpsc::Receiver<ManagerEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            match event {
                ManagerEvent::Finished { id } => {
                    if let Some(download) = registry.active.lock().unwrap().remove(&id) {
                        drop(download.task);
                    }
                }
            }
        }
    });
}

/// Once a second: sum per-download speeds, report the aggregate to the
/// limiter's observation slot and to observers.
fn spawn_speed_aggregator(registry: Weak<DownloadRegistry>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(
            crate::config::SPEED_SAMPLE_INTERVAL_SECS,
        ));
        tick.tick().await;
        loop {
            tick.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let (total, count) = {
                let active = registry.active.lock().unwrap();
                let total: f64 = active
                    .values()
                    .map(|d| f64::from_bits(d.speed_cell.load(Ordering::Relaxed)))
                    .sum();
                (total, active.len())
            };
            registry.bucket.lock().await.observe_speed(total);
            registry.hub.notify_speed(total, count);
        }
    });
}
