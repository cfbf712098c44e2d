//! Lifecycle events flowing from the crawler and the workers to the monitor.
//!
//! Multi-producer, single-consumer; the monitor is the only component that
//! mutates aggregate run state or touches the output streams. Everyone else
//! just sends.

use crate::bucket::BucketResult;

#[derive(Debug)]
pub enum Event {
    /// The partitioner sealed a bucket and is about to enqueue it.
    BucketQueued { id: u64, entries: usize, bytes: u64 },
    /// A worker dequeued the bucket and spawned (or tried to spawn) a child.
    BucketStarted { id: u64, worker: usize },
    /// Exactly one per sealed bucket.
    BucketFinished(BucketResult),
    /// Unreadable directory or failed stat; the subtree was skipped.
    CrawlWarning {
        path: std::path::PathBuf,
        message: String,
    },
    /// The crawl saw the whole source set; totals are now exact.
    CrawlComplete {
        entries: u64,
        bytes: u64,
        buckets: u64,
    },
    /// A worker task finished its loop.
    WorkerExited { worker: usize },
    /// A signal arrived; the monitor should announce the cancellation.
    CancelRequested,
    /// All producers are done; the monitor can finalize.
    Shutdown,
}

/// Event channel sized so workers never stall on reporting.
pub fn channel(processes: usize) -> (
    tokio::sync::mpsc::Sender<Event>,
    tokio::sync::mpsc::Receiver<Event>,
) {
    tokio::sync::mpsc::channel(4 * processes.max(1) + 16)
}
