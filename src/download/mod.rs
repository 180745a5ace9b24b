// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod manager;
pub mod planner;
pub mod resume;
pub mod state;
pub mod worker;

use crate::config::Settings;
use crate::database::{Database, DownloadEntry};
use crate::observer::ObserverHub;
use crate::token_bucket::TokenBucket;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;

use state::DownloadControl;

/// Everything a [`manager::DownloadManager`] is constructed from.
pub struct DownloadParameters {
    pub entry: DownloadEntry,
    pub database: Arc<Database>,
    pub hub: Arc<ObserverHub>,
    pub bucket: Arc<Mutex<TokenBucket>>,
    pub control: Arc<DownloadControl>,
    pub settings: Arc<Settings>,
    pub event_tx: Sender<ManagerEvent>,
    /// f64 speed bits, written by the manager's speed tick and read by
    /// the registry's aggregation task.
    pub speed_cell: Arc<AtomicU64>,
}

/// Events flowing up from a manager to the registry.
#[derive(Debug)]
pub enum ManagerEvent {
    Finished { id: String },
}

pub use manager::DownloadManager;
