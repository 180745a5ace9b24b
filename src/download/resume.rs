// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Resume validation: decide whether saved segment state is still safe
//! to build on, by asking the origin whether the resource changed.

use crate::client::{TransferClient, TransferRequest};
use crate::database::DownloadEntry;
use crate::download::planner::SegmentPlanner;
use std::path::Path;
use tracing::{event, Level};

const RETRY_CAP_SECS: u64 = 300;

/// HEAD the origin and compare against the entry's validator tokens.
pub async fn validate(
    client: &TransferClient,
    entry: &mut DownloadEntry,
    request: &TransferRequest,
) -> bool {
    let response = match client.probe(request).await {
        Ok(response) => response,
        Err(e) => {
            event!(Level::WARN, error = %e, "Validation probe failed");
            return false;
        }
    };
    validate_response(entry, &response)
}

/// Compare a fresh HEAD response against the entry's saved validator
/// tokens.
///
/// Saved state is only trusted if the origin still supports ranges, the
/// entity tag and last-modified strings match octet-for-octet where
/// both sides have them, and any advertised size equals the known one.
/// On success the entry's tokens are refreshed with the latest values.
pub fn validate_response(
    entry: &mut DownloadEntry,
    response: &crate::client::ProbeInfo,
) -> bool {
    if response.status >= 400 {
        event!(Level::WARN, status = response.status, "Validation rejected by origin");
        return false;
    }

    if !response.accept_ranges {
        event!(Level::WARN, "Origin no longer advertises range support");
        entry.resume_supported = false;
        return false;
    }

    if !entry.etag.is_empty() && !response.etag.is_empty() && entry.etag != response.etag {
        event!(
            Level::WARN,
            old = %entry.etag,
            new = %response.etag,
            "Entity tag mismatch, discarding saved state"
        );
        return false;
    }

    if !entry.last_modified.is_empty()
        && !response.last_modified.is_empty()
        && entry.last_modified != response.last_modified
    {
        event!(Level::WARN, "Last-Modified mismatch, discarding saved state");
        return false;
    }

    if entry.file_size > 0
        && response.content_length > 0
        && entry.file_size != response.content_length
    {
        event!(
            Level::WARN,
            old = entry.file_size,
            new = response.content_length,
            "Size changed on origin, discarding saved state"
        );
        return false;
    }

    if !response.etag.is_empty() {
        entry.etag = response.etag.clone();
    }
    if !response.last_modified.is_empty() {
        entry.last_modified = response.last_modified.clone();
    }
    if response.content_length > 0 {
        entry.file_size = response.content_length;
    }
    entry.resume_supported = true;

    event!(Level::INFO, file = %entry.file_name, "Resume validated");
    true
}

/// Restore the planner from the entry's state file, syncing the entry's
/// downloaded count to the planner afterwards.
pub fn restore_state(entry: &mut DownloadEntry, planner: &SegmentPlanner) -> bool {
    let seg_path = entry.segment_path();
    if !seg_path.exists() {
        event!(Level::DEBUG, file = %entry.file_name, "No state file to restore");
        return false;
    }
    if planner.load_state_from_file(&seg_path) {
        entry.downloaded_bytes = planner.total_downloaded();
        event!(
            Level::INFO,
            file = %entry.file_name,
            downloaded = entry.downloaded_bytes,
            "Restored segment state"
        );
        true
    } else {
        false
    }
}

pub fn save_state(entry: &DownloadEntry, planner: &SegmentPlanner) -> bool {
    planner.save_state(&entry.segment_path()).is_ok()
}

/// Drop the on-disk leftovers of a finished (or abandoned) transfer.
pub fn cleanup_partial_files(entry: &DownloadEntry) {
    remove_quietly(&entry.partial_path());
    remove_quietly(&entry.segment_path());
}

pub fn discard_state(entry: &DownloadEntry) {
    remove_quietly(&entry.segment_path());
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            event!(Level::DEBUG, path = %path.display(), error = %e, "Cleanup failed");
        }
    }
}

/// Exponential backoff: base doubled per attempt, capped at five
/// minutes. Attempt numbering starts at 1.
pub fn retry_delay_secs(retry_count: u32, base_secs: u64) -> u64 {
    let mut delay = base_secs;
    let mut attempt = 1;
    while attempt < retry_count && attempt < 8 {
        delay = delay.saturating_mul(2);
        attempt += 1;
    }
    delay.min(RETRY_CAP_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProbeInfo;

    fn saved_entry() -> DownloadEntry {
        DownloadEntry {
            etag: "\"e1\"".to_string(),
            last_modified: "Thu, 01 Dec 2020 12:00:00 GMT".to_string(),
            file_size: 1_048_576,
            downloaded_bytes: 262_144,
            resume_supported: true,
            ..Default::default()
        }
    }

    fn matching_probe() -> ProbeInfo {
        ProbeInfo {
            status: 200,
            accept_ranges: true,
            etag: "\"e1\"".to_string(),
            last_modified: "Thu, 01 Dec 2020 12:00:00 GMT".to_string(),
            content_length: 1_048_576,
            ..Default::default()
        }
    }

    #[test]
    fn matching_tokens_validate_and_refresh() {
        let mut entry = saved_entry();
        assert!(validate_response(&mut entry, &matching_probe()));
        assert!(entry.resume_supported);
        assert_eq!(entry.etag, "\"e1\"");
    }

    #[test]
    fn etag_mismatch_invalidates() {
        let mut entry = saved_entry();
        let mut probe = matching_probe();
        probe.etag = "\"e2\"".to_string();
        assert!(!validate_response(&mut entry, &probe));
    }

    #[test]
    fn missing_token_on_one_side_is_not_a_mismatch() {
        let mut entry = saved_entry();
        entry.etag.clear();
        let mut probe = matching_probe();
        probe.last_modified.clear();
        assert!(validate_response(&mut entry, &probe));
        // The origin's fresh etag is adopted.
        assert_eq!(entry.etag, "\"e1\"");
    }

    #[test]
    fn size_change_invalidates() {
        let mut entry = saved_entry();
        let mut probe = matching_probe();
        probe.content_length = 2_000_000;
        assert!(!validate_response(&mut entry, &probe));
    }

    #[test]
    fn lost_range_support_invalidates() {
        let mut entry = saved_entry();
        let mut probe = matching_probe();
        probe.accept_ranges = false;
        assert!(!validate_response(&mut entry, &probe));
        assert!(!entry.resume_supported);
    }

    #[test]
    fn error_status_invalidates() {
        let mut entry = saved_entry();
        let mut probe = matching_probe();
        probe.status = 404;
        assert!(!validate_response(&mut entry, &probe));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_delay_secs(1, 5), 5);
        assert_eq!(retry_delay_secs(2, 5), 10);
        assert_eq!(retry_delay_secs(3, 5), 20);
        assert_eq!(retry_delay_secs(4, 5), 40);
        assert_eq!(retry_delay_secs(7, 5), 300);
        assert_eq!(retry_delay_secs(20, 5), 300);
    }

    #[test]
    fn backoff_with_zero_base_stays_zero() {
        assert_eq!(retry_delay_secs(1, 0), 0);
        assert_eq!(retry_delay_secs(9, 0), 0);
    }
}
