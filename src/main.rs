// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::Parser;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use swiftget::config::{self, Settings};
use swiftget::observer::DownloadObserver;
use swiftget::registry::{AddOptions, DownloadRegistry};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{event, Level};
use tracing_appender::rolling;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about = "Accelerated segmented downloader", long_about = None)]
struct Cli {
    /// URL to download (http, https or ftp)
    url: String,

    /// Directory to save into (defaults to the configured download dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Output filename (defaults to what the origin suggests)
    #[arg(short, long)]
    output: Option<String>,

    /// Number of connections for this download
    #[arg(short, long)]
    connections: Option<usize>,

    /// Global speed limit in bytes per second (0 = unlimited)
    #[arg(short, long)]
    limit: Option<u64>,

    /// Override the data directory (store, state, logs)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

enum Outcome {
    Complete,
    Paused,
    Failed(String),
}

/// Prints progress to stderr and reports the terminal event back to
/// main. Callbacks arrive on worker tasks, so nothing here blocks.
struct ConsoleObserver {
    outcome_tx: mpsc::Sender<Outcome>,
    last_print: Mutex<Instant>,
}

impl DownloadObserver for ConsoleObserver {
    fn on_progress(&self, _id: &str, downloaded: u64, total: i64, speed: f64) {
        let mut last = self.last_print.lock().unwrap();
        if last.elapsed().as_secs_f64() < 1.0 {
            return;
        }
        *last = Instant::now();
        drop(last);

        if total > 0 {
            let percent = downloaded as f64 / total as f64 * 100.0;
            eprintln!(
                "{} / {} ({percent:.1}%) at {}/s",
                format_size(downloaded as i64),
                format_size(total),
                format_size(speed as i64),
            );
        } else {
            eprintln!(
                "{} at {}/s",
                format_size(downloaded as i64),
                format_size(speed as i64),
            );
        }
    }

    fn on_complete(&self, _id: &str) {
        let _ = self.outcome_tx.try_send(Outcome::Complete);
    }

    fn on_error(&self, _id: &str, message: &str) {
        let _ = self.outcome_tx.try_send(Outcome::Failed(message.to_string()));
    }

    fn on_paused(&self, _id: &str) {
        let _ = self.outcome_tx.try_send(Outcome::Paused);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The only argument is the URL; anything that is not an http(s) or
    // ftp URL is a usage error.
    let scheme = match url::Url::parse(&cli.url) {
        Ok(parsed) => parsed.scheme().to_string(),
        Err(e) => {
            eprintln!("Invalid URL '{}': {e}", cli.url);
            return ExitCode::from(2);
        }
    };
    if !matches!(scheme.as_str(), "http" | "https" | "ftp") {
        eprintln!("Unsupported URL scheme '{scheme}' (expected http, https or ftp)");
        return ExitCode::from(2);
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(config::default_data_dir);
    if let Err(e) = fs::create_dir_all(data_dir.join("logs")) {
        eprintln!("Failed to create data directory {}: {e}", data_dir.display());
        return ExitCode::from(1);
    }

    let general_log = rolling::never(data_dir.join("logs"), "swiftget.log");
    let error_log = rolling::never(data_dir.join("logs"), "errors.log");
    let (non_blocking_general, _guard_general) = tracing_appender::non_blocking(general_log);
    let (non_blocking_error, _guard_error) = tracing_appender::non_blocking(error_log);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking_general)
                .with_filter(LevelFilter::INFO),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking_error)
                .with_filter(LevelFilter::WARN),
        )
        .init();

    // One engine per data directory.
    let lock_path = data_dir.join("swiftget.lock");
    let lock_file = match File::create(&lock_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to create lock file: {e}");
            return ExitCode::from(1);
        }
    };
    if lock_file.try_lock_exclusive().is_err() {
        eprintln!("swiftget is already running for {}", data_dir.display());
        return ExitCode::from(1);
    }

    let mut settings = config::load_settings(&data_dir);
    apply_overrides(&mut settings, &cli);

    let registry = match DownloadRegistry::open(settings, &data_dir) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Failed to open download store: {e}");
            event!(Level::ERROR, error = %e, "Startup failed");
            return ExitCode::from(1);
        }
    };

    let (outcome_tx, mut outcome_rx) = mpsc::channel::<Outcome>(8);
    registry.add_observer(Arc::new(ConsoleObserver {
        outcome_tx,
        last_print: Mutex::new(Instant::now()),
    }));

    let id = registry.add(
        &cli.url,
        AddOptions {
            file_name: cli.output.clone(),
            save_path: cli.dir.clone(),
            num_connections: cli.connections,
            ..Default::default()
        },
    );
    eprintln!("Downloading {} ...", cli.url);

    let exit = tokio::select! {
        outcome = outcome_rx.recv() => match outcome {
            Some(Outcome::Complete) => {
                let path = registry
                    .get(&id)
                    .map(|e| e.full_path().display().to_string())
                    .unwrap_or_default();
                eprintln!("Saved to {path}");
                ExitCode::SUCCESS
            }
            Some(Outcome::Paused) => {
                eprintln!("Download paused; run again to resume");
                ExitCode::SUCCESS
            }
            Some(Outcome::Failed(message)) => {
                eprintln!("Download failed: {message}");
                ExitCode::from(1)
            }
            None => ExitCode::from(1),
        },
        _ = signal::ctrl_c() => {
            eprintln!("Interrupted, saving state...");
            registry.pause(&id);
            // Give the orchestrator a moment to persist before exiting.
            let _ = outcome_rx.recv().await;
            ExitCode::SUCCESS
        }
    };

    registry.shutdown().await;
    exit
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(dir) = &cli.dir {
        settings.download_dir = dir.clone();
    }
    if let Some(connections) = cli.connections {
        settings.connections_per_download = connections;
    }
    if let Some(limit) = cli.limit {
        settings.speed_limit_bps = limit;
    }
}

fn format_size(bytes: i64) -> String {
    if bytes < 0 {
        return "unknown".to_string();
    }
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
