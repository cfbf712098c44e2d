//! Core of `psync`, a local directory replicator that runs many rsync
//! processes in parallel.
//!
//! One crawl of the source feeds a streaming partitioner that seals bounded
//! buckets of entries; a fixed pool of workers runs one
//! `rsync --files-from=-` child per bucket; a monitor task owns every
//! counter and all user-visible output:
//!
//! ```text
//!         entries          buckets          results
//! crawler ───────► partitioner ───────► worker pool ───────► monitor
//!                                          │  ▲
//!                                          ▼  │
//!                                       rsync children
//! ```
//!
//! The bucket channel is bounded at the worker count, so the crawl never
//! runs more than `P` buckets ahead of the copies. Cancellation is
//! cooperative and two-level: signals abort running children, the
//! first-failure policy merely drains the queue.
//!
//! The entry point is [`sync`]; binaries bootstrap the runtime through
//! [`run`].

use std::sync::Arc;

pub mod bucket;
pub mod cancel;
pub mod config;
pub mod crawl;
pub mod error;
pub mod events;
pub mod filegen;
pub mod monitor;
pub mod progress;
pub mod rsync;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutils;

pub use bucket::{Bucket, BucketOutcome, BucketResult, Entry, EntryKind};
pub use config::{parse_size, SyncSettings, BASE_RSYNC_ARGS};
pub use error::{SyncError, EXIT_CANCELLED, EXIT_CONFIG, EXIT_FAILED, EXIT_INTERNAL, EXIT_OK};
pub use monitor::RunSummary;
pub use rsync::default_rsync_path;

/// Run one full replication: validate, crawl, bucket, copy, summarize.
///
/// Per-bucket failures do not surface here; they are folded into the
/// returned [`RunSummary`] and mapped to an exit code by
/// [`RunSummary::exit_code`]. `Err` is reserved for configuration problems
/// and internal invariant violations.
pub async fn sync(settings: SyncSettings) -> Result<RunSummary, SyncError> {
    settings.validate()?;
    rsync::preflight(&settings).await?;
    tokio::fs::create_dir_all(&settings.dest)
        .await
        .map_err(|err| {
            SyncError::Config(format!(
                "cannot create destination {:?}: {}",
                &settings.dest, err
            ))
        })?;
    let settings = Arc::new(settings);
    let cancel = cancel::Cancellation::new();
    let children = worker::ChildRegistry::new();
    let (events_tx, events_rx) = events::channel(settings.processes);
    let (buckets_tx, buckets_rx) = tokio::sync::mpsc::channel(settings.processes.max(1));
    let buckets_rx: worker::SharedBucketRx = Arc::new(tokio::sync::Mutex::new(buckets_rx));

    let signals = tokio::spawn(handle_signals(
        cancel.clone(),
        children.clone(),
        events_tx.clone(),
    ));
    let monitor_task = tokio::spawn(monitor::run_monitor(
        events_rx,
        settings.clone(),
        cancel.clone(),
    ));
    let crawler = {
        let settings = settings.clone();
        let events_tx = events_tx.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            crawl::crawl_sources(&settings, buckets_tx, events_tx, &cancel)
        })
    };
    let mut workers = tokio::task::JoinSet::new();
    worker::spawn_workers(
        &mut workers,
        settings.clone(),
        buckets_rx.clone(),
        events_tx.clone(),
        cancel.clone(),
        children.clone(),
    );

    while workers.join_next().await.is_some() {}

    // account buckets nobody consumed as cancelled; receiving here also
    // unparks a crawler blocked on the bounded channel so it can observe the
    // cancellation and finish
    {
        let mut rx = buckets_rx.lock().await;
        while let Some(bucket) = rx.recv().await {
            let _ = events_tx
                .send(events::Event::BucketFinished(BucketResult::cancelled(
                    &bucket,
                )))
                .await;
        }
    }
    let crawl_result = crawler
        .await
        .map_err(|err| SyncError::Internal(format!("crawler task died: {}", err)))?;

    let _ = events_tx.send(events::Event::Shutdown).await;
    let summary = monitor_task
        .await
        .map_err(|err| SyncError::Internal(format!("monitor task died: {}", err)))?;
    signals.abort();
    crawl_result?;
    Ok(summary)
}

/// First SIGINT/SIGTERM cancels cooperatively; a second SIGINT within two
/// seconds SIGKILLs every live child and exits 130 on the spot.
async fn handle_signals(
    cancel: cancel::Cancellation,
    children: worker::ChildRegistry,
    events_tx: tokio::sync::mpsc::Sender<events::Event>,
) {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::error!("failed to install signal handlers");
        return;
    };
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("signal received, cancelling the run");
    let _ = events_tx.try_send(events::Event::CancelRequested);
    cancel.abort();
    if tokio::time::timeout(std::time::Duration::from_secs(2), sigint.recv())
        .await
        .is_ok()
    {
        children.kill_all();
        std::process::exit(error::EXIT_CANCELLED);
    }
}

/// Bootstrap used by the binaries: tracing to stderr at a `-v`-controlled
/// level, a multi-threaded runtime, then the supplied future.
pub fn run<F, Fut>(quiet: bool, verbose: u8, func: F) -> Result<RunSummary, SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<RunSummary, SyncError>>,
{
    if quiet && verbose > 0 {
        return Err(SyncError::Config(
            "--quiet and --verbose are mutually exclusive".to_string(),
        ));
    }
    init_tracing(verbose);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| SyncError::Internal(format!("failed to start runtime: {}", err)))?;
    runtime.block_on(func())
}

/// `RUST_LOG` wins; otherwise -v maps to INFO, -vv to DEBUG, -vvv to TRACE.
pub fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
