//! Everything about the rsync children: locating the executable, vetting
//! user-supplied options, synthesizing the per-bucket argument vector and
//! classifying exit codes.

use crate::bucket::BucketOutcome;
use crate::config::{SyncSettings, BASE_RSYNC_ARGS};
use crate::error::SyncError;

/// rsync exit codes tolerated on live source trees: 23 is "partial transfer
/// due to error", 24 is "some files vanished before they could be
/// transferred".
pub const PARTIAL_EXIT_CODES: &[i32] = &[23, 24];

/// `--rsync` wins over `$RSYNC` wins over plain `rsync` from PATH.
pub fn default_rsync_path() -> std::path::PathBuf {
    match std::env::var_os("RSYNC") {
        Some(path) if !path.is_empty() => std::path::PathBuf::from(path),
        _ => std::path::PathBuf::from("rsync"),
    }
}

/// Split a `--rsync-options` string into words, honouring single and double
/// quotes. The words are later appended to the child argv verbatim, without
/// re-quoting.
pub fn split_options(input: &str) -> Result<Vec<String>, SyncError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(SyncError::Config(format!(
            "unterminated quote in rsync options: {:?}",
            input
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Options that would break cross-bucket composition are refused outright:
/// a per-bucket `--delete` removes files owned by sibling buckets, and the
/// file-list options would clobber the wire contract with the children.
pub fn veto_extra_args(args: &[String]) -> Result<(), SyncError> {
    for arg in args {
        if arg.starts_with("--delete") {
            return Err(SyncError::Config(format!(
                "rsync option {:?} cannot be used with bucketed transfers",
                arg
            )));
        }
        if arg == "--from0" || arg == "--files-from" || arg.starts_with("--files-from=") {
            return Err(SyncError::Config(format!(
                "rsync option {:?} is reserved for the file-list protocol",
                arg
            )));
        }
    }
    Ok(())
}

/// Build the argument vector for one bucket's child.
///
/// The trailing slash on the source is load-bearing: it makes rsync copy the
/// root's contents instead of nesting a same-named directory, which is what
/// lets independent buckets compose into a single destination tree.
pub fn build_argv(settings: &SyncSettings, source: &std::path::Path) -> Vec<std::ffi::OsString> {
    use std::os::unix::ffi::OsStrExt;
    let mut argv: Vec<std::ffi::OsString> = Vec::new();
    argv.extend(BASE_RSYNC_ARGS.iter().map(|a| a.into()));
    argv.extend(settings.extra_rsync_args.iter().map(|a| a.into()));
    argv.push("--files-from=-".into());
    argv.push("--from0".into());
    let mut src = source.as_os_str().to_os_string();
    if src.as_bytes().last() != Some(&b'/') {
        src.push("/");
    }
    argv.push(src);
    argv.push(settings.dest.as_os_str().to_os_string());
    argv
}

/// Map a child exit code onto the per-bucket outcome taxonomy. `None` means
/// the child died to a signal; outside cancellation that is a failure.
pub fn classify_exit(code: Option<i32>) -> BucketOutcome {
    match code {
        Some(0) => BucketOutcome::Ok,
        Some(c) if PARTIAL_EXIT_CODES.contains(&c) => BucketOutcome::Partial,
        _ => BucketOutcome::Failed,
    }
}

/// Checks run before any worker starts: the executable must answer
/// `--version`, and user-supplied options must survive a dry run between two
/// scratch directories.
pub async fn preflight(settings: &SyncSettings) -> Result<(), SyncError> {
    let output = tokio::process::Command::new(&settings.rsync_path)
        .arg("--version")
        .output()
        .await
        .map_err(|err| {
            SyncError::Config(format!(
                "cannot execute rsync at {:?}: {}",
                &settings.rsync_path, err
            ))
        })?;
    if !output.status.success() {
        return Err(SyncError::Config(format!(
            "{:?} --version exited with {}",
            &settings.rsync_path, output.status
        )));
    }
    tracing::debug!(
        "rsync preflight ok: {}",
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
    );
    if settings.extra_rsync_args.is_empty() {
        return Ok(());
    }
    let scratch_src = tempfile::tempdir()
        .map_err(|err| SyncError::Config(format!("cannot create scratch directory: {}", err)))?;
    let scratch_dst = tempfile::tempdir()
        .map_err(|err| SyncError::Config(format!("cannot create scratch directory: {}", err)))?;
    let mut src = scratch_src.path().as_os_str().to_os_string();
    src.push("/");
    let output = tokio::process::Command::new(&settings.rsync_path)
        .args(BASE_RSYNC_ARGS)
        .args(&settings.extra_rsync_args)
        .arg("--dry-run")
        .arg(&src)
        .arg(scratch_dst.path())
        .output()
        .await
        .map_err(|err| SyncError::Config(format!("cannot execute rsync: {}", err)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::Config(format!(
            "rsync rejected the extra options {:?}: {}",
            &settings.extra_rsync_args,
            stderr.lines().next().unwrap_or("unknown error")
        )));
    }
    Ok(())
}
