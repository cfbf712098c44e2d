//! Single-pass source crawl fused with the streaming bucket partitioner.
//!
//! Runs as one blocking producer task: an explicit LIFO of directories gives
//! pre-order traversal (parents strictly before children) in the
//! filesystem's native listing order, and every emitted entry is folded
//! straight into the open bucket. The bounded bucket channel provides the
//! back-pressure that keeps the crawl at most `P` buckets ahead of the
//! workers.

use crate::bucket::{Bucket, Entry, EntryKind};
use crate::cancel::Cancellation;
use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::events::Event;

#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlTotals {
    pub entries: u64,
    pub bytes: u64,
    pub buckets: u64,
}

struct Partitioner {
    entries_per_bucket: usize,
    bytes_per_bucket: u64,
    buckets_tx: tokio::sync::mpsc::Sender<Bucket>,
    events_tx: tokio::sync::mpsc::Sender<Event>,
    open: Bucket,
    next_id: u64,
    totals: CrawlTotals,
}

impl Partitioner {
    fn new(
        settings: &SyncSettings,
        buckets_tx: tokio::sync::mpsc::Sender<Bucket>,
        events_tx: tokio::sync::mpsc::Sender<Event>,
    ) -> Self {
        Self {
            entries_per_bucket: settings.entries_per_bucket,
            bytes_per_bucket: settings.bytes_per_bucket,
            buckets_tx,
            events_tx,
            open: Bucket::new(1, 0),
            next_id: 2,
            totals: CrawlTotals::default(),
        }
    }

    /// Fold one entry into the open bucket, sealing first if the entry would
    /// trip either limit. Returns false once the downstream is gone.
    fn push(&mut self, source: usize, entry: Entry) -> Result<bool, SyncError> {
        if self.open.source != source && !self.open.is_empty() {
            // buckets never span source roots
            if !self.seal()? {
                return Ok(false);
            }
        }
        self.open.source = source;
        let over_count = self.open.count() + 1 > self.entries_per_bucket;
        let over_bytes = self.open.bytes + entry.size > self.bytes_per_bucket;
        if (over_count || over_bytes) && !self.open.is_empty() {
            if !self.seal()? {
                return Ok(false);
            }
            self.open.source = source;
        }
        self.totals.entries += 1;
        self.totals.bytes += entry.size;
        self.open.push(entry);
        Ok(true)
    }

    /// Emit the open bucket downstream and start a fresh one.
    fn seal(&mut self) -> Result<bool, SyncError> {
        if self.open.is_empty() {
            return Err(SyncError::Internal("sealing an empty bucket".to_string()));
        }
        let source = self.open.source;
        let bucket = std::mem::replace(&mut self.open, Bucket::new(self.next_id, source));
        self.next_id += 1;
        self.totals.buckets += 1;
        let queued = Event::BucketQueued {
            id: bucket.id,
            entries: bucket.count(),
            bytes: bucket.bytes,
        };
        if self.events_tx.blocking_send(queued).is_err() {
            return Ok(false);
        }
        // this send is the designed back-pressure point
        Ok(self.buckets_tx.blocking_send(bucket).is_ok())
    }

    fn flush(&mut self) -> Result<bool, SyncError> {
        if self.open.is_empty() {
            return Ok(true);
        }
        self.seal()
    }

    fn warn(&self, path: &std::path::Path, err: &std::io::Error) {
        let _ = self.events_tx.blocking_send(Event::CrawlWarning {
            path: path.to_path_buf(),
            message: err.to_string(),
        });
    }
}

/// Walk every source once and stream sealed buckets to the worker pool.
///
/// Must run on a blocking thread (`tokio::task::spawn_blocking`). Crawl
/// warnings (unreadable directory, failed stat) skip the subtree and the run
/// continues; an unreadable source root is fatal.
pub fn crawl_sources(
    settings: &SyncSettings,
    buckets_tx: tokio::sync::mpsc::Sender<Bucket>,
    events_tx: tokio::sync::mpsc::Sender<Event>,
    cancel: &Cancellation,
) -> Result<CrawlTotals, SyncError> {
    let mut partitioner = Partitioner::new(settings, buckets_tx, events_tx.clone());
    'sources: for (source, root) in settings.sources.iter().enumerate() {
        let mut pending = vec![root.clone()];
        let mut root_emitted = false;
        while let Some(dir) = pending.pop() {
            if cancel.is_stopped() {
                break 'sources;
            }
            let reader = match std::fs::read_dir(&dir) {
                Ok(reader) => reader,
                Err(err) if dir == *root => {
                    return Err(SyncError::Config(format!(
                        "cannot read source directory {:?}: {}",
                        root, err
                    )));
                }
                Err(err) => {
                    tracing::warn!("skipping unreadable directory {:?}: {}", &dir, err);
                    partitioner.warn(&dir, &err);
                    continue;
                }
            };
            for item in reader {
                let item = match item {
                    Ok(item) => item,
                    Err(err) => {
                        partitioner.warn(&dir, &err);
                        continue;
                    }
                };
                let path = item.path();
                let metadata = match std::fs::symlink_metadata(&path) {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        tracing::warn!("failed to stat {:?}: {}", &path, err);
                        partitioner.warn(&path, &err);
                        continue;
                    }
                };
                let file_type = metadata.file_type();
                let kind = if file_type.is_symlink() {
                    EntryKind::Symlink
                } else if file_type.is_dir() {
                    EntryKind::Directory
                } else if file_type.is_file() {
                    EntryKind::Regular
                } else {
                    EntryKind::Other
                };
                let rel_path = match path.strip_prefix(root) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => {
                        return Err(SyncError::Internal(format!(
                            "crawled path {:?} escapes source root {:?}",
                            path, root
                        )));
                    }
                };
                if !root_emitted {
                    // the root itself rides along so rsync reapplies its
                    // metadata; an empty source emits nothing at all
                    if !partitioner.push(source, Entry::new(".".into(), 0, EntryKind::Directory))? {
                        break 'sources;
                    }
                    root_emitted = true;
                }
                if !partitioner.push(source, Entry::new(rel_path, metadata.len(), kind))? {
                    break 'sources;
                }
                if kind == EntryKind::Directory {
                    pending.push(path);
                }
            }
        }
        if !partitioner.flush()? {
            break 'sources;
        }
    }
    if !cancel.is_stopped() {
        partitioner.flush()?;
        let totals = partitioner.totals;
        let _ = events_tx.blocking_send(Event::CrawlComplete {
            entries: totals.entries,
            bytes: totals.bytes,
            buckets: totals.buckets,
        });
    }
    Ok(partitioner.totals)
}
