//! Data model for the crawl → partition → worker pipeline.

/// What kind of filesystem object a crawl entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// One filesystem object discovered by the crawl.
///
/// The path is relative to the source root the entry was crawled from,
/// byte-exact as the filesystem returned it. Size is 0 for anything that is
/// not a regular file.
#[derive(Debug, Clone)]
pub struct Entry {
    pub rel_path: std::path::PathBuf,
    pub size: u64,
    pub kind: EntryKind,
}

impl Entry {
    pub fn new(rel_path: std::path::PathBuf, size: u64, kind: EntryKind) -> Self {
        let size = match kind {
            EntryKind::Regular => size,
            _ => 0,
        };
        Self {
            rel_path,
            size,
            kind,
        }
    }
}

/// An ordered batch of entries handed to exactly one rsync child.
///
/// Ids are assigned by the partitioner, dense and monotonic starting at 1.
/// `source` indexes into the run's source list; a bucket never mixes entries
/// from two source roots.
#[derive(Debug)]
pub struct Bucket {
    pub id: u64,
    pub source: usize,
    pub entries: Vec<Entry>,
    pub bytes: u64,
}

impl Bucket {
    pub fn new(id: u64, source: usize) -> Self {
        Self {
            id,
            source,
            entries: Vec::new(),
            bytes: 0,
        }
    }

    pub fn push(&mut self, entry: Entry) {
        self.bytes += entry.size;
        self.entries.push(entry);
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First non-directory path, for user-facing failure messages.
    pub fn sample_path(&self) -> std::path::PathBuf {
        self.entries
            .iter()
            .find(|e| e.kind != EntryKind::Directory)
            .or_else(|| self.entries.first())
            .map(|e| e.rel_path.clone())
            .unwrap_or_default()
    }
}

/// Per-bucket outcome after the rsync child terminated (or failed to start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOutcome {
    /// Child exited 0.
    Ok,
    /// Child exited 23 or 24 (vanished/partial); tolerated on live trees.
    Partial,
    /// Any other non-zero exit, a signal death outside cancellation, or a
    /// spawn failure.
    Failed,
    /// Bucket aborted by cancellation before or during its child run.
    Cancelled,
}

/// Exactly one of these is published per sealed bucket.
#[derive(Debug)]
pub struct BucketResult {
    pub id: u64,
    pub outcome: BucketOutcome,
    pub exit_code: Option<i32>,
    pub wall_time: std::time::Duration,
    pub entries: usize,
    pub bytes: u64,
    pub sample_path: std::path::PathBuf,
    pub stderr_tail: Vec<String>,
    pub spawn_error: Option<String>,
}

impl BucketResult {
    pub fn cancelled(bucket: &Bucket) -> Self {
        Self {
            id: bucket.id,
            outcome: BucketOutcome::Cancelled,
            exit_code: None,
            wall_time: std::time::Duration::ZERO,
            entries: bucket.count(),
            bytes: bucket.bytes,
            sample_path: bucket.sample_path(),
            stderr_tail: Vec::new(),
            spawn_error: None,
        }
    }
}
