// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Dynamic segmentation: one download's byte range is split on demand
//! so every connection always has useful work. Rather than pre-cutting
//! the file into N equal parts, a worker that runs out of work claims a
//! pending segment if one exists, otherwise halves the largest active
//! one.
//!
//! Segments are kept in byte order: for any consecutive pair,
//! `prev.end + 1 == next.start`. Every public operation serializes
//! under one lock, and the lock is never held across I/O.

use crate::config::BUFFER_SIZE;
use crate::database::SegmentSnapshot;
use crate::download::state::{Segment, SegmentStatus};
use crate::errors::StorageError;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{event, Level};

const STATE_MAGIC: u32 = 0x5345_4749; // "SEGI"
const STATE_VERSION: u32 = 1;

/// A worker's claim on a byte range: fetch from `start` through `end`
/// inclusive (`None` = until the body ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkAssignment {
    pub segment_id: u32,
    pub start: u64,
    pub end: Option<u64>,
}

/// How a finished fetch stream relates to the segment it served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    /// Every byte of the (possibly shrunk) segment is on disk.
    Satisfied,
    /// The body ended before the segment was covered.
    Short,
    /// The segment was reassigned (watchdog or release) mid-stream.
    LostOwnership,
}

struct PlannerInner {
    file_size: i64,
    next_id: u32,
    segments: Vec<Segment>,
    /// Known-zero-size download: nothing to fetch, complete by definition.
    zero_length: bool,
}

pub struct SegmentPlanner {
    max_workers: usize,
    min_segment: u64,
    inner: Mutex<PlannerInner>,
}

impl SegmentPlanner {
    pub fn new(max_workers: usize, min_segment: u64) -> Self {
        SegmentPlanner {
            max_workers: max_workers.max(1),
            min_segment: min_segment.max(1),
            inner: Mutex::new(PlannerInner {
                file_size: -1,
                next_id: 0,
                segments: Vec::new(),
                zero_length: false,
            }),
        }
    }

    /// Start a fresh plan. A positive size gets a single segment
    /// covering the whole file (further segments appear through
    /// splitting); a negative size gets the single unbounded segment;
    /// zero is complete with no work at all.
    pub fn initialize(&self, file_size: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.segments.clear();
        inner.next_id = 0;
        inner.file_size = file_size;
        inner.zero_length = file_size == 0;

        if file_size > 0 {
            let id = inner.take_id();
            inner
                .segments
                .push(Segment::new(id, 0, Some(file_size as u64 - 1)));
            event!(Level::INFO, file_size, "Planner initialized");
        } else if file_size < 0 {
            let id = inner.take_id();
            inner.segments.push(Segment::new(id, 0, None));
            event!(Level::INFO, "Planner initialized with unknown size (single connection)");
        } else {
            event!(Level::INFO, "Planner initialized for empty file");
        }
    }

    /// Replace the plan with previously saved snapshots. Worker
    /// assignments never survive a session: every unfinished snapshot
    /// comes back Pending with its cursor at `start + downloaded`.
    pub fn restore(&self, file_size: i64, snapshots: &[SegmentSnapshot]) {
        let mut inner = self.inner.lock().unwrap();
        inner.segments.clear();
        inner.next_id = 0;
        inner.file_size = file_size;
        inner.zero_length = file_size == 0;

        for snap in snapshots {
            let id = inner.take_id();
            let end = if snap.end < 0 {
                None
            } else {
                Some(snap.end as u64)
            };
            let mut seg = Segment::new(id, snap.start, end);
            seg.cursor = snap.start + snap.downloaded;
            seg.status = if snap.complete {
                SegmentStatus::Complete
            } else {
                SegmentStatus::Pending
            };
            inner.segments.push(seg);
        }

        event!(
            Level::INFO,
            segments = snapshots.len(),
            "Planner restored from previous session"
        );
    }

    /// Hand a worker something to do, or `None` when every byte is
    /// already owned and nothing is worth splitting.
    pub fn request_segment(&self, worker: usize) -> Option<WorkAssignment> {
        let mut inner = self.inner.lock().unwrap();

        if inner.zero_length {
            return None;
        }
        if inner.active_count() >= self.max_workers {
            return None;
        }

        // Strategy 1: claim the first pending (or errored) segment.
        if let Some(idx) = inner
            .segments
            .iter()
            .position(|s| matches!(s.status, SegmentStatus::Pending | SegmentStatus::Error))
        {
            let seg = &mut inner.segments[idx];
            seg.status = SegmentStatus::Active;
            seg.worker = Some(worker);
            seg.last_activity = Instant::now();
            let assignment = WorkAssignment {
                segment_id: seg.id,
                start: seg.cursor,
                end: seg.end,
            };
            event!(
                Level::DEBUG,
                segment = seg.id,
                worker,
                start = assignment.start,
                "Assigned pending segment"
            );
            return Some(assignment);
        }

        // Strategy 2: split the largest active segment. Unbounded
        // segments never split; earliest index wins ties.
        let mut best: Option<(usize, u64)> = None;
        for (idx, seg) in inner.segments.iter().enumerate() {
            if seg.status != SegmentStatus::Active {
                continue;
            }
            let Some(remaining) = seg.remaining() else {
                continue;
            };
            if best.map_or(true, |(_, best_rem)| remaining > best_rem) {
                best = Some((idx, remaining));
            }
        }
        let (parent_idx, remaining) = best?;
        if remaining < self.min_segment * 2 {
            return None;
        }

        let parent_cursor = inner.segments[parent_idx].cursor;
        let parent_end = inner.segments[parent_idx]
            .end
            .expect("bounded segment in split path");

        // Midpoint of the remaining bytes, aligned down for I/O
        // friendliness.
        let mut split = parent_cursor + remaining / 2;
        split = split / BUFFER_SIZE * BUFFER_SIZE;
        if split <= parent_cursor {
            split = parent_cursor + self.min_segment;
        }
        if split > parent_end - self.min_segment {
            return None;
        }

        let id = inner.take_id();
        let mut child = Segment::new(id, split, Some(parent_end));
        child.status = SegmentStatus::Active;
        child.worker = Some(worker);
        child.last_activity = Instant::now();

        let parent_id = inner.segments[parent_idx].id;
        inner.segments[parent_idx].end = Some(split - 1);
        inner.segments.insert(parent_idx + 1, child);

        event!(
            Level::INFO,
            parent = parent_id,
            segment = id,
            worker,
            start = split,
            end = parent_end,
            "Split segment for new connection"
        );

        Some(WorkAssignment {
            segment_id: id,
            start: split,
            end: Some(parent_end),
        })
    }

    /// The live write position of a segment, provided the asking worker
    /// still owns it. The cursor read here is the only authority for a
    /// write offset; the bounds shrink when the segment is split
    /// mid-stream.
    pub fn write_span(&self, segment_id: u32, worker: usize) -> Option<(u64, Option<u64>)> {
        let inner = self.inner.lock().unwrap();
        let seg = inner.segments.iter().find(|s| s.id == segment_id)?;
        if seg.status != SegmentStatus::Active || seg.worker != Some(worker) {
            return None;
        }
        Some((seg.cursor, seg.end))
    }

    pub fn update_progress(&self, segment_id: u32, bytes_added: u64, speed: f64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(seg) = inner.segments.iter_mut().find(|s| s.id == segment_id) else {
            return;
        };
        seg.cursor += bytes_added;
        seg.speed = speed;
        seg.last_activity = Instant::now();

        if let Some(end) = seg.end {
            if seg.cursor > end {
                seg.cursor = end + 1;
                seg.status = SegmentStatus::Complete;
                seg.worker = None;
                event!(Level::DEBUG, segment = segment_id, "Segment completed via progress");
            }
        }
    }

    /// Settle a segment after its fetch stream ended without error.
    /// Decided under the lock so a watchdog reassignment between the
    /// stream ending and this call cannot be mistaken for completion.
    pub fn finish_fetch(&self, segment_id: u32, worker: usize) -> FetchDisposition {
        let mut inner = self.inner.lock().unwrap();
        let Some(seg) = inner.segments.iter_mut().find(|s| s.id == segment_id) else {
            return FetchDisposition::LostOwnership;
        };
        if seg.status == SegmentStatus::Complete {
            seg.worker = None;
            return FetchDisposition::Satisfied;
        }
        if seg.status != SegmentStatus::Active || seg.worker != Some(worker) {
            return FetchDisposition::LostOwnership;
        }
        match seg.end {
            None => {
                if seg.cursor > seg.start {
                    seg.end = Some(seg.cursor - 1);
                }
                seg.status = SegmentStatus::Complete;
                seg.worker = None;
                seg.speed = 0.0;
                FetchDisposition::Satisfied
            }
            Some(end) if seg.cursor > end => {
                seg.status = SegmentStatus::Complete;
                seg.worker = None;
                seg.speed = 0.0;
                FetchDisposition::Satisfied
            }
            // The origin closed the body before the range was covered.
            Some(_) => FetchDisposition::Short,
        }
    }

    pub fn mark_complete(&self, segment_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(seg) = inner.segments.iter_mut().find(|s| s.id == segment_id) else {
            return;
        };
        seg.status = SegmentStatus::Complete;
        match seg.end {
            Some(end) => seg.cursor = end + 1,
            // Pin the unbounded segment's end now that the body is
            // exhausted; an empty body keeps end unbounded with zero
            // downloaded.
            None if seg.cursor > seg.start => seg.end = Some(seg.cursor - 1),
            None => {}
        }
        seg.worker = None;
        seg.speed = 0.0;
        event!(
            Level::INFO,
            segment = segment_id,
            start = seg.start,
            end = seg.end,
            "Segment complete"
        );
    }

    pub fn mark_error(&self, segment_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(seg) = inner.segments.iter_mut().find(|s| s.id == segment_id) else {
            return;
        };
        seg.status = SegmentStatus::Error;
        seg.worker = None;
        seg.speed = 0.0;
        event!(
            Level::WARN,
            segment = segment_id,
            cursor = seg.cursor,
            "Segment errored"
        );
    }

    pub fn release_segment(&self, segment_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(seg) = inner.segments.iter_mut().find(|s| s.id == segment_id) else {
            return;
        };
        if seg.status != SegmentStatus::Complete {
            seg.status = SegmentStatus::Pending;
        }
        seg.worker = None;
        seg.speed = 0.0;
    }

    /// Mark active segments with no recent activity as errored so they
    /// get reassigned. Returns how many were reaped.
    pub fn fail_stalled(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut reaped = 0;
        for seg in &mut inner.segments {
            if seg.status == SegmentStatus::Active && seg.last_activity.elapsed() > max_idle {
                event!(Level::WARN, segment = seg.id, "Stale segment reaped by watchdog");
                seg.status = SegmentStatus::Error;
                seg.worker = None;
                seg.speed = 0.0;
                reaped += 1;
            }
        }
        reaped
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.zero_length {
            return true;
        }
        !inner.segments.is_empty() && inner.segments.iter().all(Segment::is_complete)
    }

    pub fn total_downloaded(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.segments.iter().map(Segment::downloaded).sum()
    }

    pub fn total_speed(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Active)
            .map(|s| s.speed)
            .sum()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active_count()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().unwrap().segments.len()
    }

    pub fn file_size(&self) -> i64 {
        self.inner.lock().unwrap().file_size
    }

    pub fn snapshot(&self) -> Vec<SegmentSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .iter()
            .map(|seg| SegmentSnapshot {
                start: seg.start,
                end: seg.end.map(|e| e as i64).unwrap_or(-1),
                downloaded: seg.downloaded(),
                worker: seg.worker.map(|w| w as i32).unwrap_or(-1),
                complete: seg.is_complete(),
            })
            .collect()
    }

    /// Serialize the plan to the binary state file. The buffer is built
    /// under the lock; the disk write happens after it is released.
    pub fn save_state(&self, path: &Path) -> Result<(), StorageError> {
        let bytes = {
            let inner = self.inner.lock().unwrap();
            let mut out = Vec::with_capacity(20 + inner.segments.len() * 29);
            out.extend_from_slice(&STATE_MAGIC.to_le_bytes());
            out.extend_from_slice(&STATE_VERSION.to_le_bytes());
            out.extend_from_slice(&inner.file_size.to_le_bytes());
            out.extend_from_slice(&(inner.segments.len() as u32).to_le_bytes());
            for seg in &inner.segments {
                out.extend_from_slice(&(seg.id as i32).to_le_bytes());
                out.extend_from_slice(&(seg.start as i64).to_le_bytes());
                out.extend_from_slice(&seg.end.map(|e| e as i64).unwrap_or(-1).to_le_bytes());
                out.extend_from_slice(&(seg.cursor as i64).to_le_bytes());
                out.push(match seg.status {
                    SegmentStatus::Pending => 0,
                    SegmentStatus::Active => 1,
                    SegmentStatus::Complete => 2,
                    SegmentStatus::Error => 3,
                });
            }
            out
        };
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a previously saved plan. Active and errored segments come
    /// back Pending. Returns false when the file is absent or not a
    /// valid state file.
    pub fn load_state_from_file(&self, path: &Path) -> bool {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        let mut reader = StateReader::new(&bytes);
        let Some(magic) = reader.u32() else { return false };
        let Some(version) = reader.u32() else { return false };
        if magic != STATE_MAGIC || version != STATE_VERSION {
            event!(Level::WARN, path = %path.display(), "Invalid segment state file");
            return false;
        }
        let Some(file_size) = reader.i64() else { return false };
        let Some(count) = reader.u32() else { return false };

        let mut segments = Vec::with_capacity(count as usize);
        let mut next_id = 0u32;
        for _ in 0..count {
            let Some(id) = reader.i32() else { return false };
            let Some(start) = reader.i64() else { return false };
            let Some(end) = reader.i64() else { return false };
            let Some(cursor) = reader.i64() else { return false };
            let Some(status) = reader.u8() else { return false };
            if id < 0 || start < 0 || cursor < start {
                return false;
            }

            let mut seg = Segment::new(
                id as u32,
                start as u64,
                if end < 0 { None } else { Some(end as u64) },
            );
            seg.cursor = cursor as u64;
            seg.status = if status == 2 {
                SegmentStatus::Complete
            } else {
                SegmentStatus::Pending
            };
            next_id = next_id.max(id as u32 + 1);
            segments.push(seg);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.file_size = file_size;
        inner.zero_length = file_size == 0;
        inner.segments = segments;
        inner.next_id = next_id;
        event!(Level::INFO, segments = count, "Loaded segment state file");
        true
    }
}

impl PlannerInner {
    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn active_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Active)
            .count()
    }
}

struct StateReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        StateReader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_le_bytes(b.try_into().unwrap()))
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: i64 = 1_048_576;
    const MIN_SEG: u64 = 65_536;

    fn coverage_is_exact(planner: &SegmentPlanner, size: u64) {
        let snaps = planner.snapshot();
        assert!(!snaps.is_empty());
        assert_eq!(snaps[0].start, 0);
        for pair in snaps.windows(2) {
            assert_eq!(
                pair[0].end + 1,
                pair[1].start as i64,
                "segments must be contiguous"
            );
        }
        assert_eq!(snaps.last().unwrap().end, size as i64 - 1);
    }

    #[test]
    fn two_worker_split_lands_on_midpoint() {
        let planner = SegmentPlanner::new(2, MIN_SEG);
        planner.initialize(MIB);

        let a = planner.request_segment(0).unwrap();
        assert_eq!(a.start, 0);
        assert_eq!(a.end, Some(MIB as u64 - 1));

        let b = planner.request_segment(1).unwrap();
        assert_eq!(b.start, 524_288);
        assert_eq!(b.end, Some(1_048_575));

        let snaps = planner.snapshot();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].start, 0);
        assert_eq!(snaps[0].end, 524_287);
        coverage_is_exact(&planner, MIB as u64);
    }

    #[test]
    fn split_point_aligns_to_buffer_boundary() {
        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB + 12_345);

        let a = planner.request_segment(0).unwrap();
        planner.update_progress(a.segment_id, 7, 0.0);

        let b = planner.request_segment(1).unwrap();
        assert_eq!(b.start % BUFFER_SIZE, 0);
        coverage_is_exact(&planner, (MIB + 12_345) as u64);
    }

    #[test]
    fn coverage_holds_through_many_splits_and_progress() {
        let planner = SegmentPlanner::new(8, MIN_SEG);
        planner.initialize(16 * MIB);

        let mut assignments = Vec::new();
        for worker in 0..8 {
            if let Some(a) = planner.request_segment(worker) {
                assignments.push(a);
            }
        }
        assert_eq!(planner.active_count(), assignments.len());

        for (i, a) in assignments.iter().enumerate() {
            planner.update_progress(a.segment_id, (i as u64 + 1) * 1000, 50.0);
        }
        coverage_is_exact(&planner, 16 * MIB as u64);

        // Sum identity: planner total equals the per-segment sums.
        let by_sum: u64 = planner.snapshot().iter().map(|s| s.downloaded).sum();
        assert_eq!(by_sum, planner.total_downloaded());
    }

    #[test]
    fn split_respects_minimum_on_both_halves() {
        let planner = SegmentPlanner::new(16, MIN_SEG);
        planner.initialize(16 * MIB);
        let mut ids = vec![planner.request_segment(0).unwrap()];
        for worker in 1..16 {
            if let Some(a) = planner.request_segment(worker) {
                ids.push(a);
            }
        }
        for snap in planner.snapshot() {
            let total = (snap.end - snap.start as i64 + 1) as u64;
            assert!(
                total >= MIN_SEG,
                "segment of {total} bytes is below the minimum"
            );
        }
    }

    #[test]
    fn active_cap_is_enforced() {
        let planner = SegmentPlanner::new(2, MIN_SEG);
        planner.initialize(16 * MIB);
        assert!(planner.request_segment(0).is_some());
        assert!(planner.request_segment(1).is_some());
        assert!(planner.request_segment(2).is_none());
        assert_eq!(planner.active_count(), 2);
    }

    #[test]
    fn small_files_never_split() {
        let planner = SegmentPlanner::new(8, MIN_SEG);
        planner.initialize(1);
        assert!(planner.request_segment(0).is_some());
        assert!(planner.request_segment(1).is_none());
        assert_eq!(planner.segment_count(), 1);

        let planner = SegmentPlanner::new(8, MIN_SEG);
        planner.initialize(2 * MIN_SEG as i64 - 1);
        assert!(planner.request_segment(0).is_some());
        assert!(planner.request_segment(1).is_none());
    }

    #[test]
    fn unknown_size_uses_exactly_one_worker() {
        let planner = SegmentPlanner::new(8, MIN_SEG);
        planner.initialize(-1);

        let a = planner.request_segment(0).unwrap();
        assert_eq!(a.start, 0);
        assert_eq!(a.end, None);
        for worker in 1..8 {
            assert!(planner.request_segment(worker).is_none());
        }

        planner.update_progress(a.segment_id, 5000, 10.0);
        assert!(!planner.is_complete());
        planner.mark_complete(a.segment_id);
        assert!(planner.is_complete());
        assert_eq!(planner.snapshot()[0].end, 4999);
    }

    #[test]
    fn zero_size_is_complete_without_workers() {
        let planner = SegmentPlanner::new(8, MIN_SEG);
        planner.initialize(0);
        assert!(planner.is_complete());
        assert!(planner.request_segment(0).is_none());
        assert_eq!(planner.total_downloaded(), 0);
    }

    #[test]
    fn progress_clamps_and_completes() {
        let planner = SegmentPlanner::new(1, MIN_SEG);
        planner.initialize(100);
        let a = planner.request_segment(0).unwrap();

        planner.update_progress(a.segment_id, 60, 1.0);
        let (cursor, _) = planner.write_span(a.segment_id, 0).unwrap();
        assert_eq!(cursor, 60);

        planner.update_progress(a.segment_id, 60, 1.0);
        assert!(planner.is_complete());
        let snap = &planner.snapshot()[0];
        assert_eq!(snap.downloaded, 100);
        assert!(snap.complete);
    }

    #[test]
    fn errored_segments_are_reassigned_first() {
        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB);

        let a = planner.request_segment(0).unwrap();
        planner.update_progress(a.segment_id, 10_000, 0.0);
        planner.mark_error(a.segment_id);
        assert_eq!(planner.active_count(), 0);

        // The errored segment is handed out again, resuming at its cursor.
        let b = planner.request_segment(1).unwrap();
        assert_eq!(b.segment_id, a.segment_id);
        assert_eq!(b.start, 10_000);
    }

    #[test]
    fn release_returns_unfinished_work() {
        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB);
        let a = planner.request_segment(0).unwrap();
        planner.release_segment(a.segment_id);
        assert_eq!(planner.active_count(), 0);
        assert!(planner.request_segment(1).is_some());

        // A completed segment stays complete through release.
        let planner = SegmentPlanner::new(1, MIN_SEG);
        planner.initialize(10);
        let a = planner.request_segment(0).unwrap();
        planner.mark_complete(a.segment_id);
        planner.release_segment(a.segment_id);
        assert!(planner.is_complete());
    }

    #[test]
    fn write_span_denies_former_owner() {
        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB);
        let a = planner.request_segment(3).unwrap();

        assert!(planner.write_span(a.segment_id, 3).is_some());
        assert!(planner.write_span(a.segment_id, 2).is_none());

        planner.mark_error(a.segment_id);
        assert!(planner.write_span(a.segment_id, 3).is_none());
    }

    #[test]
    fn stalled_segments_get_reaped() {
        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB);
        let a = planner.request_segment(0).unwrap();

        assert_eq!(planner.fail_stalled(Duration::from_secs(60)), 0);
        assert_eq!(planner.fail_stalled(Duration::from_nanos(0)), 1);
        assert!(planner.write_span(a.segment_id, 0).is_none());
        assert!(planner.request_segment(1).is_some());
    }

    #[test]
    fn state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.seg");

        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB);
        let a = planner.request_segment(0).unwrap();
        let b = planner.request_segment(1).unwrap();
        planner.update_progress(a.segment_id, 100_000, 0.0);
        planner.update_progress(b.segment_id, 50_000, 0.0);
        planner.mark_complete(b.segment_id);
        planner.save_state(&path).unwrap();

        let restored = SegmentPlanner::new(4, MIN_SEG);
        assert!(restored.load_state_from_file(&path));
        assert_eq!(restored.file_size(), MIB);
        assert_eq!(restored.total_downloaded(), planner.total_downloaded());

        let before = planner.snapshot();
        let after = restored.snapshot();
        assert_eq!(before.len(), after.len());
        for (x, y) in before.iter().zip(after.iter()) {
            assert_eq!(x.start, y.start);
            assert_eq!(x.end, y.end);
            assert_eq!(x.downloaded, y.downloaded);
            assert_eq!(x.complete, y.complete);
        }
        // The active segment came back pending, so it is assignable.
        assert_eq!(restored.active_count(), 0);
        let again = restored.request_segment(0).unwrap();
        assert_eq!(again.start, 100_000);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.seg");
        let planner = SegmentPlanner::new(4, MIN_SEG);
        assert!(!planner.load_state_from_file(&path), "missing file");

        std::fs::write(&path, b"definitely not a state file").unwrap();
        assert!(!planner.load_state_from_file(&path));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let planner = SegmentPlanner::new(4, MIN_SEG);
        planner.initialize(MIB);
        let a = planner.request_segment(0).unwrap();
        let _ = planner.request_segment(1).unwrap();
        planner.update_progress(a.segment_id, 12_345, 0.0);

        let snaps = planner.snapshot();
        let restored = SegmentPlanner::new(4, MIN_SEG);
        restored.restore(MIB, &snaps);
        assert_eq!(restored.total_downloaded(), 12_345);
        assert_eq!(restored.segment_count(), 2);
        assert_eq!(restored.active_count(), 0);
        coverage_is_exact(&restored, MIB as u64);
    }
}
