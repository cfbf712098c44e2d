//! Run-level error taxonomy and process exit codes.

/// All buckets finished ok or partial.
pub const EXIT_OK: i32 = 0;
/// One or more buckets failed.
pub const EXIT_FAILED: i32 = 1;
/// Invalid arguments, remote path, unreachable source or unusable rsync.
pub const EXIT_CONFIG: i32 = 2;
/// Invariant violation inside the pipeline.
pub const EXIT_INTERNAL: i32 = 3;
/// Run cancelled by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: i32 = 130;

/// Fatal errors that abort a run before or outside the bucket pipeline.
///
/// Per-bucket failures are not errors; they are data carried in
/// [`crate::bucket::BucketResult`] and folded into the run summary.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => EXIT_CONFIG,
            SyncError::Internal(_) => EXIT_INTERNAL,
        }
    }
}
