// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Active,
    Complete,
    Error,
}

/// One contiguous byte range of the file, assigned to at most one
/// worker at a time.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: u32,
    pub start: u64,
    /// Inclusive last byte. `None` marks the single unbounded segment
    /// of an unknown-size download; no sentinel arithmetic anywhere.
    pub end: Option<u64>,
    /// Next byte to write; `end + 1` exactly when the segment is done.
    pub cursor: u64,
    pub worker: Option<usize>,
    pub status: SegmentStatus,
    pub last_activity: Instant,
    pub speed: f64,
}

impl Segment {
    pub fn new(id: u32, start: u64, end: Option<u64>) -> Self {
        Segment {
            id,
            start,
            end,
            cursor: start,
            worker: None,
            status: SegmentStatus::Pending,
            last_activity: Instant::now(),
            speed: 0.0,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.cursor - self.start
    }

    pub fn total(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.end.map(|end| (end + 1).saturating_sub(self.cursor))
    }

    pub fn progress_percent(&self) -> f64 {
        match self.total() {
            Some(total) if total > 0 => self.downloaded() as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Complete
    }
}

/// Pause and cancel signals for one download, checked by every worker
/// on every chunk. Pausing implies stopping in-flight work; the entry
/// stays restartable. In-flight positioned writes always complete
/// before a worker honors either flag.
#[derive(Debug, Default)]
pub struct DownloadControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn should_stop(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }

    /// Parked wait used instead of busy-spinning; wakes on any state
    /// change and the caller re-checks the flags.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}
