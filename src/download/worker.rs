// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! One fetch connection. A worker repeatedly asks the planner for a
//! sub-range, streams it from the origin, and writes each rate-limited
//! slice at the segment's live cursor. Transient failures back off
//! exponentially; non-retriable ones end the worker.

use crate::client::{ChunkSink, FetchOutcome, SinkFlow, TransferClient, TransferRequest};
use crate::download::planner::{FetchDisposition, SegmentPlanner};
use crate::download::state::DownloadControl;
use crate::download::resume;
use crate::errors::ClientError;
use crate::observer::ObserverHub;
use crate::storage::PartialFile;
use crate::token_bucket::{self, TokenBucket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{event, Level};

const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Failure bookkeeping shared by all of one download's workers; the
/// orchestrator copies it onto the entry when the download settles.
#[derive(Default)]
pub struct WorkerShared {
    pub retries: AtomicU32,
    pub last_error: Mutex<String>,
}

impl WorkerShared {
    pub fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap() = message;
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }
}

/// Everything a single worker needs; cloned per spawned task.
#[derive(Clone)]
pub struct WorkerContext {
    pub download_id: String,
    pub worker_id: usize,
    pub client: Arc<TransferClient>,
    pub planner: Arc<SegmentPlanner>,
    pub partial: PartialFile,
    pub control: Arc<DownloadControl>,
    pub bucket: Arc<tokio::sync::Mutex<TokenBucket>>,
    pub hub: Arc<ObserverHub>,
    /// Range-free request carrying the entry's headers and credentials.
    pub request_template: TransferRequest,
    pub total_size: i64,
    pub max_retries: u32,
    pub retry_base_secs: u64,
    pub shared: Arc<WorkerShared>,
}

pub async fn run(ctx: WorkerContext) {
    let mut retry_count: u32 = 0;

    loop {
        if ctx.control.is_cancelled() {
            break;
        }

        let Some(assignment) = ctx.planner.request_segment(ctx.worker_id) else {
            event!(
                Level::DEBUG,
                worker = ctx.worker_id,
                "No segment available, worker exiting"
            );
            break;
        };
        let segment_id = assignment.segment_id;

        // Parked wait while paused; cancellation releases the claim.
        while ctx.control.is_paused() && !ctx.control.is_cancelled() {
            ctx.control.changed().await;
        }
        if ctx.control.is_cancelled() {
            ctx.planner.release_segment(segment_id);
            break;
        }

        let Some((cursor, end)) = ctx.planner.write_span(segment_id, ctx.worker_id) else {
            continue;
        };

        let mut request = ctx.request_template.clone();
        request.range = Some((cursor, end));

        let mut sink = SegmentSink {
            ctx: &ctx,
            segment_id,
            bytes_since_tick: 0,
            tick_start: Instant::now(),
            speed: 0.0,
        };

        match ctx.client.fetch(&request, &mut sink).await {
            Ok(FetchOutcome::Completed) => {
                match ctx.planner.finish_fetch(segment_id, ctx.worker_id) {
                    FetchDisposition::Satisfied => {
                        retry_count = 0;
                    }
                    FetchDisposition::Short => {
                        // The origin hung up early; put the remainder
                        // back into circulation and retry.
                        ctx.shared
                            .record_error("Origin closed the body early".to_string());
                        ctx.planner.mark_error(segment_id);
                        retry_count += 1;
                        ctx.shared.retries.fetch_add(1, Ordering::SeqCst);
                        if retry_count >= ctx.max_retries {
                            break;
                        }
                        if !backoff(&ctx, retry_count).await {
                            break;
                        }
                    }
                    FetchDisposition::LostOwnership => {}
                }
            }
            Ok(FetchOutcome::Stopped) => {
                if ctx.control.should_stop() {
                    ctx.planner.release_segment(segment_id);
                    break;
                }
                // Stopped without a stop flag: the live span ran out,
                // either because the segment filled up mid-chunk or
                // because the watchdog took it away.
                match ctx.planner.finish_fetch(segment_id, ctx.worker_id) {
                    FetchDisposition::Satisfied => retry_count = 0,
                    FetchDisposition::Short => ctx.planner.release_segment(segment_id),
                    FetchDisposition::LostOwnership => {}
                }
            }
            Err(e) => {
                ctx.shared.record_error(e.to_string());
                ctx.planner.mark_error(segment_id);

                if ctx.control.should_stop() {
                    break;
                }
                if !e.is_retriable() {
                    event!(
                        Level::ERROR,
                        worker = ctx.worker_id,
                        segment = segment_id,
                        error = %e,
                        "Non-retriable failure, worker exiting"
                    );
                    break;
                }

                retry_count += 1;
                ctx.shared.retries.fetch_add(1, Ordering::SeqCst);
                if retry_count >= ctx.max_retries {
                    event!(
                        Level::ERROR,
                        worker = ctx.worker_id,
                        retries = retry_count,
                        "Retry budget exhausted"
                    );
                    break;
                }

                let delay = resume::retry_delay_secs(retry_count, ctx.retry_base_secs);
                event!(
                    Level::WARN,
                    worker = ctx.worker_id,
                    segment = segment_id,
                    attempt = retry_count,
                    delay_secs = delay,
                    error = %e,
                    "Transient failure, backing off"
                );
                if !backoff(&ctx, retry_count).await {
                    break;
                }
            }
        }
    }
}

/// Sleep out the backoff for this attempt; returns false if cancelled
/// while waiting.
async fn backoff(ctx: &WorkerContext, retry_count: u32) -> bool {
    let delay = resume::retry_delay_secs(retry_count, ctx.retry_base_secs);
    let sleep = tokio::time::sleep(Duration::from_secs(delay));
    tokio::pin!(sleep);
    loop {
        if ctx.control.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return true,
            _ = ctx.control.changed() => {}
        }
    }
}

struct SegmentSink<'a> {
    ctx: &'a WorkerContext,
    segment_id: u32,
    bytes_since_tick: u64,
    tick_start: Instant,
    speed: f64,
}

impl ChunkSink for SegmentSink<'_> {
    async fn accept(&mut self, chunk: &[u8]) -> Result<SinkFlow, ClientError> {
        let ctx = self.ctx;

        let mut offset = 0;
        while offset < chunk.len() {
            if ctx.control.should_stop() {
                return Ok(SinkFlow::Stop);
            }

            // The cursor read here, under the planner lock, is the only
            // authority for the write offset; the segment may have been
            // split (end shrunk) since the last slice.
            let Some((cursor, end)) = ctx.planner.write_span(self.segment_id, ctx.worker_id)
            else {
                return Ok(SinkFlow::Stop);
            };

            let mut want = chunk.len() - offset;
            if let Some(end) = end {
                let allowed = (end + 1 - cursor) as usize;
                if allowed == 0 {
                    return Ok(SinkFlow::Stop);
                }
                want = want.min(allowed);
            }

            let permitted = token_bucket::acquire(&ctx.bucket, want).await;
            ctx.partial
                .write_at(cursor, &chunk[offset..offset + permitted])
                .await?;
            ctx.planner
                .update_progress(self.segment_id, permitted as u64, self.speed);

            offset += permitted;
            self.bytes_since_tick += permitted as u64;
        }

        let elapsed = self.tick_start.elapsed();
        if elapsed >= PROGRESS_EMIT_INTERVAL {
            self.speed = self.bytes_since_tick as f64 / elapsed.as_secs_f64();
            ctx.planner.update_progress(self.segment_id, 0, self.speed);
            ctx.hub.notify_progress(
                &ctx.download_id,
                ctx.planner.total_downloaded(),
                ctx.total_size,
                self.speed,
            );
            ctx.hub
                .notify_segment_update(&ctx.download_id, &ctx.planner.snapshot());
            self.bytes_since_tick = 0;
            self.tick_start = Instant::now();
        }

        Ok(SinkFlow::Continue)
    }
}
