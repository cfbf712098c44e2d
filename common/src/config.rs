//! Run configuration and its validation.

use crate::error::SyncError;

pub const DEFAULT_ENTRIES_PER_BUCKET: usize = 1000;
pub const DEFAULT_BYTES_PER_BUCKET: u64 = 1 << 30; // 1 GiB

/// Arguments every child gets before anything user-supplied. `-a` carries the
/// metadata semantics the per-bucket copies rely on to compose into one tree;
/// `-S` and `--numeric-ids` match the serial-rsync behaviour this tool
/// replaces.
pub const BASE_RSYNC_ARGS: &[&str] = &["-aS", "--numeric-ids"];

/// Immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Source directories, crawled in order. Buckets never span sources.
    pub sources: Vec<std::path::PathBuf>,
    /// Destination directory, created if absent.
    pub dest: std::path::PathBuf,
    /// Worker parallelism; also the bucket-channel capacity.
    pub processes: usize,
    /// Entry-count bucket threshold.
    pub entries_per_bucket: usize,
    /// Byte-size bucket threshold.
    pub bytes_per_bucket: u64,
    /// Enable the live progress line.
    pub progress: bool,
    /// Suppress warnings and the final summary; errors still print.
    pub quiet: bool,
    /// rsync executable to spawn.
    pub rsync_path: std::path::PathBuf,
    /// Extra arguments appended verbatim to every child.
    pub extra_rsync_args: Vec<String>,
    /// Keep dispatching buckets after the first failed one.
    pub keep_going: bool,
}

impl SyncSettings {
    pub fn new(sources: Vec<std::path::PathBuf>, dest: std::path::PathBuf) -> Self {
        Self {
            sources,
            dest,
            processes: num_cpus::get(),
            entries_per_bucket: DEFAULT_ENTRIES_PER_BUCKET,
            bytes_per_bucket: DEFAULT_BYTES_PER_BUCKET,
            progress: false,
            quiet: false,
            rsync_path: crate::rsync::default_rsync_path(),
            extra_rsync_args: Vec::new(),
            keep_going: false,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sources.is_empty() {
            return Err(SyncError::Config(
                "at least one source directory is required".to_string(),
            ));
        }
        if self.processes < 1 {
            return Err(SyncError::Config(
                "--processes must be at least 1".to_string(),
            ));
        }
        if self.entries_per_bucket < 1 {
            return Err(SyncError::Config("--files must be at least 1".to_string()));
        }
        if self.bytes_per_bucket < 1 {
            return Err(SyncError::Config("--size must be at least 1".to_string()));
        }
        for src in &self.sources {
            reject_remote(src)?;
            let metadata = std::fs::metadata(src).map_err(|err| {
                SyncError::Config(format!("cannot access source {:?}: {}", src, err))
            })?;
            if !metadata.is_dir() {
                return Err(SyncError::Config(format!(
                    "source {:?} is not a directory",
                    src
                )));
            }
        }
        reject_remote(&self.dest)?;
        if let Ok(metadata) = std::fs::metadata(&self.dest) {
            if !metadata.is_dir() {
                return Err(SyncError::Config(format!(
                    "destination {:?} exists and is not a directory",
                    &self.dest
                )));
            }
        }
        crate::rsync::veto_extra_args(&self.extra_rsync_args)?;
        Ok(())
    }
}

/// Both endpoints must be local; a `:` marks an rsync remote spec. On Windows
/// a lone drive-letter colon is tolerated.
fn reject_remote(path: &std::path::Path) -> Result<(), SyncError> {
    let text = path.to_string_lossy();
    let mut colons: Vec<usize> = text.match_indices(':').map(|(i, _)| i).collect();
    if cfg!(windows) {
        colons.retain(|&i| {
            !(i == 1 && text.chars().next().map(|c| c.is_ascii_alphabetic()) == Some(true))
        });
    }
    if !colons.is_empty() {
        return Err(SyncError::Config(format!(
            "remote paths are not supported: {:?}",
            path
        )));
    }
    Ok(())
}

/// Parse a byte size with an optional K/M/G/T suffix, base-1024.
///
/// `"1024"` → 1024, `"1M"` → 1048576. Anything else (fractions, repeated or
/// unknown suffixes) is rejected.
pub fn parse_size(input: &str) -> Option<u64> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }
    let (digits, multiplier) = match text.char_indices().last()? {
        (i, 'k') | (i, 'K') => (&text[..i], 1u64 << 10),
        (i, 'm') | (i, 'M') => (&text[..i], 1u64 << 20),
        (i, 'g') | (i, 'G') => (&text[..i], 1u64 << 30),
        (i, 't') | (i, 'T') => (&text[..i], 1u64 << 40),
        _ => (text, 1u64),
    };
    let value: u64 = digits.parse().ok()?;
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_plain_bytes() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("0"), Some(0));
    }

    #[test]
    fn parse_size_suffixes_are_base_1024() {
        assert_eq!(parse_size("1K"), Some(1024));
        assert_eq!(parse_size("1M"), Some(1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2 << 30));
        assert_eq!(parse_size("1T"), Some(1 << 40));
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert_eq!(parse_size("abcde"), None);
        assert_eq!(parse_size("10KK"), None);
        assert_eq!(parse_size("10Q"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("1.5G"), None);
    }

    #[test]
    fn remote_specs_are_rejected() {
        assert!(reject_remote(std::path::Path::new("host:/tmp/x")).is_err());
        assert!(reject_remote(std::path::Path::new("user@host:dir")).is_err());
        assert!(reject_remote(std::path::Path::new("/tmp/plain")).is_ok());
    }

    #[test]
    fn validate_rejects_missing_source() {
        let settings = SyncSettings::new(
            vec!["/nonexistent/psync/source".into()],
            std::env::temp_dir(),
        );
        let err = settings.validate().unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG);
    }

    #[test]
    fn validate_rejects_zero_processes() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SyncSettings::new(vec![dir.path().to_path_buf()], std::env::temp_dir());
        settings.processes = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_accepts_plain_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let settings = SyncSettings::new(
            vec![src.path().to_path_buf()],
            dst.path().join("new-subdir"),
        );
        settings.validate().unwrap();
    }
}
