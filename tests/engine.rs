// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end engine tests against an in-process origin server that
//! speaks ranges, entity tags, injected 503s and slow bodies.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use swiftget::config::Settings;
use swiftget::database::{DownloadStatus, SegmentSnapshot};
use swiftget::observer::DownloadObserver;
use swiftget::registry::{AddOptions, DownloadRegistry};
use tokio::sync::mpsc;

const LAST_MODIFIED: &str = "Thu, 01 Dec 2020 12:00:00 GMT";

struct Origin {
    body: Mutex<Vec<u8>>,
    etag: Mutex<String>,
    support_ranges: AtomicBool,
    advertise_length: AtomicBool,
    /// Respond 503 to this many GETs before serving normally.
    fail_gets_remaining: AtomicU32,
    /// Delay between streamed 16 KiB chunks; 0 sends the body at once.
    chunk_delay_ms: AtomicU64,
}

impl Origin {
    fn new(body: Vec<u8>, etag: &str) -> Arc<Self> {
        Arc::new(Origin {
            body: Mutex::new(body),
            etag: Mutex::new(etag.to_string()),
            support_ranges: AtomicBool::new(true),
            advertise_length: AtomicBool::new(true),
            fail_gets_remaining: AtomicU32::new(0),
            chunk_delay_ms: AtomicU64::new(0),
        })
    }

    fn swap_content(&self, body: Vec<u8>, etag: &str) {
        *self.body.lock().unwrap() = body;
        *self.etag.lock().unwrap() = etag.to_string();
    }
}

async fn serve_file(
    State(origin): State<Arc<Origin>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let body = origin.body.lock().unwrap().clone();
    let etag = origin.etag.lock().unwrap().clone();
    let ranges_supported = origin.support_ranges.load(Ordering::SeqCst);
    let advertise_length = origin.advertise_length.load(Ordering::SeqCst);

    let base = |status: StatusCode| {
        let mut builder = Response::builder()
            .status(status)
            .header(header::ETAG, etag.clone())
            .header(header::LAST_MODIFIED, LAST_MODIFIED)
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if ranges_supported {
            builder = builder.header(header::ACCEPT_RANGES, "bytes");
        }
        builder
    };

    if method == Method::HEAD {
        let builder = base(StatusCode::OK);
        // An unsized body keeps hyper from inventing a Content-Length
        // when this origin is playing "size unknown".
        return if advertise_length {
            builder
                .header(header::CONTENT_LENGTH, body.len())
                .body(Body::empty())
                .unwrap()
        } else {
            builder
                .body(Body::from_stream(futures::stream::empty::<
                    Result<Bytes, std::io::Error>,
                >()))
                .unwrap()
        };
    }

    if origin
        .fail_gets_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return base(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("try later"))
            .unwrap();
    }

    let range = if ranges_supported {
        headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
    } else {
        None
    };

    let total = body.len() as u64;
    let (status, start, end) = match range {
        Some((start, end)) if start < total => (
            StatusCode::PARTIAL_CONTENT,
            start,
            end.unwrap_or(total - 1).min(total - 1),
        ),
        Some(_) => {
            return base(StatusCode::RANGE_NOT_SATISFIABLE)
                .body(Body::empty())
                .unwrap()
        }
        None => {
            if total == 0 {
                return base(StatusCode::OK)
                    .header(header::CONTENT_LENGTH, 0)
                    .body(Body::empty())
                    .unwrap();
            }
            (StatusCode::OK, 0, total - 1)
        }
    };

    let slice = body[start as usize..=end as usize].to_vec();
    let mut builder = base(status);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        );
    }
    if advertise_length {
        builder = builder.header(header::CONTENT_LENGTH, slice.len());
    }

    let delay = origin.chunk_delay_ms.load(Ordering::SeqCst);
    if delay == 0 {
        return builder.body(Body::from(slice)).unwrap();
    }

    let stream = futures::stream::unfold((slice, 0usize), move |(slice, pos)| async move {
        if pos >= slice.len() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let end = (pos + 16 * 1024).min(slice.len());
        let chunk = Bytes::copy_from_slice(&slice[pos..end]);
        Some((Ok::<_, std::io::Error>(chunk), (slice, end)))
    });
    builder.body(Body::from_stream(stream)).unwrap()
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

async fn start_origin(origin: Arc<Origin>) -> String {
    let app = Router::new()
        .route("/file.bin", any(serve_file))
        .with_state(origin);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/file.bin")
}

fn make_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn test_settings(download_dir: &Path) -> Settings {
    Settings {
        download_dir: download_dir.to_path_buf(),
        connections_per_download: 4,
        min_segment_size: 65_536,
        speed_limit_bps: 0,
        max_retries: 5,
        retry_base_secs: 0,
        connect_timeout_secs: 5,
        receive_timeout_secs: 30,
        user_agent: "swiftget-test".to_string(),
        verify_tls: true,
        proxy: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Complete,
    Paused,
    Failed(String),
}

struct TestObserver {
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    segment_updates: Mutex<Vec<Vec<SegmentSnapshot>>>,
}

impl TestObserver {
    fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(TestObserver {
                outcome_tx: tx,
                segment_updates: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }
}

impl DownloadObserver for TestObserver {
    fn on_segment_update(&self, _id: &str, segments: &[SegmentSnapshot]) {
        self.segment_updates.lock().unwrap().push(segments.to_vec());
    }

    fn on_complete(&self, _id: &str) {
        let _ = self.outcome_tx.send(Outcome::Complete);
    }

    fn on_paused(&self, _id: &str) {
        let _ = self.outcome_tx.send(Outcome::Paused);
    }

    fn on_error(&self, _id: &str, message: &str) {
        let _ = self.outcome_tx.send(Outcome::Failed(message.to_string()));
    }
}

async fn wait_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for a terminal download event")
        .expect("observer channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn two_worker_download_is_byte_identical() {
    let body = make_body(1_048_576);
    let origin = Origin::new(body.clone(), "\"e1\"");
    origin.chunk_delay_ms.store(25, Ordering::SeqCst);
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(save_dir.path());
    settings.connections_per_download = 2;

    let registry = DownloadRegistry::open(settings, data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer.clone());

    let id = registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.status, DownloadStatus::Complete);
    assert_eq!(entry.file_size, 1_048_576);
    assert_eq!(entry.downloaded_bytes, 1_048_576);
    assert!(entry.resume_supported);
    assert_eq!(entry.etag, "\"e1\"");

    let on_disk = std::fs::read(entry.full_path()).unwrap();
    assert_eq!(on_disk, body);

    // The partial and state files are gone after finalize.
    assert!(!entry.partial_path().exists());
    assert!(!entry.segment_path().exists());

    // When the transfer ran long enough to emit segment maps, they must
    // show the two-way split at the midpoint.
    let updates = observer.segment_updates.lock().unwrap();
    if let Some(last) = updates.last() {
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].start, 0);
        assert_eq!(last[0].end, 524_287);
        assert_eq!(last[1].start, 524_288);
        assert_eq!(last[1].end, 1_048_575);
    }

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_then_resume_across_restart() {
    let body = make_body(4 * 1_048_576);
    let origin = Origin::new(body.clone(), "\"e1\"");
    origin.chunk_delay_ms.store(20, Ordering::SeqCst);
    let url = start_origin(origin.clone()).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();

    let (id, paused_bytes) = {
        let registry =
            DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
        let (observer, mut rx) = TestObserver::channel();
        registry.add_observer(observer);

        let id = registry.add(&url, AddOptions::default());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(registry.pause(&id));
        assert_eq!(wait_outcome(&mut rx).await, Outcome::Paused);

        let entry = registry.get(&id).unwrap();
        assert_eq!(entry.status, DownloadStatus::Paused);
        assert!(entry.downloaded_bytes > 0, "paused before any bytes arrived");
        assert!(
            entry.downloaded_bytes < body.len() as u64,
            "download finished before the pause"
        );
        assert!(entry.partial_path().exists());
        assert!(entry.segment_path().exists());

        registry.shutdown().await;
        (id, entry.downloaded_bytes)
    };

    // Fresh process: the store still knows the download, the validator
    // confirms the origin is unchanged, and the transfer finishes.
    origin.chunk_delay_ms.store(0, Ordering::SeqCst);
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let entry = registry.get(&id).expect("entry survived the restart");
    assert_eq!(entry.status, DownloadStatus::Paused);
    assert_eq!(entry.downloaded_bytes, paused_bytes);

    assert!(registry.start(&id));
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.downloaded_bytes, body.len() as u64);
    assert_eq!(std::fs::read(entry.full_path()).unwrap(), body);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn validator_mismatch_restarts_from_zero() {
    let body = make_body(2 * 1_048_576);
    let origin = Origin::new(body.clone(), "\"e1\"");
    origin.chunk_delay_ms.store(20, Ordering::SeqCst);
    let url = start_origin(origin.clone()).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();

    let id = {
        let registry =
            DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
        let (observer, mut rx) = TestObserver::channel();
        registry.add_observer(observer);

        let id = registry.add(&url, AddOptions::default());
        tokio::time::sleep(Duration::from_millis(400)).await;
        registry.pause(&id);
        assert_eq!(wait_outcome(&mut rx).await, Outcome::Paused);
        assert!(registry.get(&id).unwrap().downloaded_bytes > 0);
        registry.shutdown().await;
        id
    };

    // The origin now serves different content under a new entity tag.
    let new_body: Vec<u8> = make_body(2 * 1_048_576)
        .into_iter()
        .map(|b| b.wrapping_add(13))
        .collect();
    origin.swap_content(new_body.clone(), "\"e2\"");
    origin.chunk_delay_ms.store(0, Ordering::SeqCst);

    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    assert!(registry.start(&id));
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.etag, "\"e2\"");
    assert_eq!(std::fs::read(entry.full_path()).unwrap(), new_body);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_range_origin_downloads_with_one_connection() {
    let body = make_body(786_432);
    let origin = Origin::new(body.clone(), "\"e1\"");
    origin.support_ranges.store(false, Ordering::SeqCst);
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(save_dir.path());
    settings.connections_per_download = 8;

    let registry = DownloadRegistry::open(settings, data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(
        &url,
        AddOptions {
            num_connections: Some(8),
            ..Default::default()
        },
    );
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert!(!entry.resume_supported);
    assert_eq!(std::fs::read(entry.full_path()).unwrap(), body);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_503s_are_retried_and_counted() {
    let body = make_body(262_144);
    let origin = Origin::new(body.clone(), "\"e1\"");
    origin.fail_gets_remaining.store(3, Ordering::SeqCst);
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();

    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(
        &url,
        AddOptions {
            num_connections: Some(1),
            ..Default::default()
        },
    );
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.retry_count, 3);
    assert_eq!(std::fs::read(entry.full_path()).unwrap(), body);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_surfaces_an_error() {
    let body = make_body(65_536);
    let origin = Origin::new(body, "\"e1\"");
    origin.fail_gets_remaining.store(1_000, Ordering::SeqCst);
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(save_dir.path());
    settings.max_retries = 3;

    let registry = DownloadRegistry::open(settings, data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(
        &url,
        AddOptions {
            num_connections: Some(1),
            ..Default::default()
        },
    );
    match wait_outcome(&mut rx).await {
        Outcome::Failed(message) => assert!(message.contains("503"), "got: {message}"),
        other => panic!("expected an error outcome, got {other:?}"),
    }

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.status, DownloadStatus::Error);
    // State is kept for a later manual retry.
    assert!(entry.segment_path().exists());

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_failure_is_an_error_not_a_hang() {
    let body = make_body(1024);
    let origin = Origin::new(body, "\"e1\"");
    let url = format!("{}-missing", start_origin(origin).await);

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(&url, AddOptions::default());
    match wait_outcome(&mut rx).await {
        Outcome::Failed(message) => assert!(message.contains("404"), "got: {message}"),
        other => panic!("expected an error outcome, got {other:?}"),
    }
    assert_eq!(registry.get(&id).unwrap().status, DownloadStatus::Error);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_length_file_completes_empty() {
    let origin = Origin::new(Vec::new(), "\"e1\"");
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.file_size, 0);
    assert_eq!(std::fs::metadata(entry.full_path()).unwrap().len(), 0);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn single_byte_file_never_splits() {
    let origin = Origin::new(vec![0x5a], "\"e1\"");
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);
    assert_eq!(
        std::fs::read(registry.get(&id).unwrap().full_path()).unwrap(),
        vec![0x5a]
    );

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_size_streams_on_one_connection() {
    let body = make_body(300_000);
    let origin = Origin::new(body.clone(), "\"e1\"");
    origin.support_ranges.store(false, Ordering::SeqCst);
    origin.advertise_length.store(false, Ordering::SeqCst);
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    // The size was learned from the bytes actually received.
    assert_eq!(entry.file_size, body.len() as i64);
    assert_eq!(std::fs::read(entry.full_path()).unwrap(), body);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn global_rate_limit_bounds_throughput() {
    let body = make_body(1_048_576);
    let origin = Origin::new(body.clone(), "\"e1\"");
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(save_dir.path());
    // 256 KiB/s with a 512 KiB burst: a 1 MiB file cannot finish in
    // under ~1.5 s.
    settings.speed_limit_bps = 262_144;

    let registry = DownloadRegistry::open(settings, data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let started = Instant::now();
    let id = registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(1500),
        "finished in {elapsed:?}, faster than the rate limit allows"
    );
    assert_eq!(
        std::fs::read(registry.get(&id).unwrap().full_path()).unwrap(),
        body
    );

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_rename_keeps_existing_files() {
    let body = make_body(4096);
    let origin = Origin::new(body.clone(), "\"e1\"");
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    // An unrelated file already occupies the target name.
    std::fs::write(save_dir.path().join("file.bin"), b"already here").unwrap();

    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    assert_eq!(
        std::fs::read(save_dir.path().join("file.bin")).unwrap(),
        b"already here"
    );
    assert_eq!(
        std::fs::read(save_dir.path().join("file(1).bin")).unwrap(),
        body
    );

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_with_files_deletes_everything() {
    let body = make_body(8192);
    let origin = Origin::new(body, "\"e1\"");
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(&url, AddOptions::default());
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let path = registry.get(&id).unwrap().full_path();
    assert!(path.exists());
    assert!(registry.remove(&id, true).await);
    assert!(!path.exists());
    assert!(registry.get(&id).is_none());
    assert_eq!(registry.list().len(), 0);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn checksum_is_verified_on_completion() {
    let body = make_body(10_000);
    let digest = {
        use sha2::Digest;
        hex::encode(sha2::Sha256::digest(&body))
    };
    let origin = Origin::new(body.clone(), "\"e1\"");
    let url = start_origin(origin).await;

    let data_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let registry =
        DownloadRegistry::open(test_settings(save_dir.path()), data_dir.path()).unwrap();
    let (observer, mut rx) = TestObserver::channel();
    registry.add_observer(observer);

    let id = registry.add(
        &url,
        AddOptions {
            checksum: Some((digest.clone(), "sha256".to_string())),
            ..Default::default()
        },
    );
    assert_eq!(wait_outcome(&mut rx).await, Outcome::Complete);

    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.checksum, digest);
    assert_eq!(std::fs::read(entry.full_path()).unwrap(), body);

    registry.shutdown().await;
}
