// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::database::SegmentSnapshot;
use std::sync::{Arc, Mutex};

/// Receiver of download lifecycle notifications.
///
/// Callbacks may be invoked from worker tasks; implementations must not
/// block and must not call back into the registry while handling an
/// event.
#[allow(unused_variables)]
pub trait DownloadObserver: Send + Sync {
    fn on_added(&self, id: &str) {}
    fn on_started(&self, id: &str) {}
    fn on_progress(&self, id: &str, downloaded: u64, total: i64, speed: f64) {}
    fn on_segment_update(&self, id: &str, segments: &[SegmentSnapshot]) {}
    fn on_complete(&self, id: &str) {}
    fn on_error(&self, id: &str, message: &str) {}
    fn on_paused(&self, id: &str) {}
    fn on_resumed(&self, id: &str) {}
    fn on_removed(&self, id: &str) {}
    fn on_speed_update(&self, total_speed: f64, active_count: usize) {}
}

/// Fan-out point for observer notifications. The registration lock is
/// held only long enough to clone the list; callbacks run outside it.
#[derive(Default)]
pub struct ObserverHub {
    observers: Mutex<Vec<Arc<dyn DownloadObserver>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn DownloadObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn remove(&self, observer: &Arc<dyn DownloadObserver>) {
        self.observers
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn snapshot(&self) -> Vec<Arc<dyn DownloadObserver>> {
        self.observers.lock().unwrap().clone()
    }

    pub fn notify_added(&self, id: &str) {
        for o in self.snapshot() {
            o.on_added(id);
        }
    }

    pub fn notify_started(&self, id: &str) {
        for o in self.snapshot() {
            o.on_started(id);
        }
    }

    pub fn notify_progress(&self, id: &str, downloaded: u64, total: i64, speed: f64) {
        for o in self.snapshot() {
            o.on_progress(id, downloaded, total, speed);
        }
    }

    pub fn notify_segment_update(&self, id: &str, segments: &[SegmentSnapshot]) {
        for o in self.snapshot() {
            o.on_segment_update(id, segments);
        }
    }

    pub fn notify_complete(&self, id: &str) {
        for o in self.snapshot() {
            o.on_complete(id);
        }
    }

    pub fn notify_error(&self, id: &str, message: &str) {
        for o in self.snapshot() {
            o.on_error(id, message);
        }
    }

    pub fn notify_paused(&self, id: &str) {
        for o in self.snapshot() {
            o.on_paused(id);
        }
    }

    pub fn notify_resumed(&self, id: &str) {
        for o in self.snapshot() {
            o.on_resumed(id);
        }
    }

    pub fn notify_removed(&self, id: &str) {
        for o in self.snapshot() {
            o.on_removed(id);
        }
    }

    pub fn notify_speed(&self, total_speed: f64, active_count: usize) {
        for o in self.snapshot() {
            o.on_speed_update(total_speed, active_count);
        }
    }
}
