//! The bounded worker pool: each worker owns one rsync child for the
//! lifetime of one bucket.
//!
//! Workers are long-lived consumers of the bucket channel and exit when it
//! closes and drains. They never terminate the process; every outcome,
//! including spawn failures and cancellations, is published as a
//! [`BucketResult`] event and judged by the monitor.

use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::bucket::{Bucket, BucketOutcome, BucketResult};
use crate::cancel::Cancellation;
use crate::config::SyncSettings;
use crate::events::Event;
use crate::rsync;

/// Lines of child stderr retained per bucket; keeps monitor memory O(P).
pub const STDERR_TAIL_LINES: usize = 64;

/// How long a SIGTERMed child gets before SIGKILL.
pub const TERM_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub type SharedBucketRx = Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Bucket>>>;

/// Live child pids keyed by bucket id, shared with the signal escalation
/// path (second SIGINT SIGKILLs everything in here).
#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    pids: Arc<std::sync::Mutex<std::collections::HashMap<u64, u32>>>,
}

impl ChildRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, bucket_id: u64, pid: u32) {
        self.pids.lock().unwrap().insert(bucket_id, pid);
    }

    fn remove(&self, bucket_id: u64) {
        self.pids.lock().unwrap().remove(&bucket_id);
    }

    pub fn kill_all(&self) {
        let pids: Vec<u32> = self.pids.lock().unwrap().values().copied().collect();
        for pid in pids {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }
}

/// Spawn `P` workers onto the join set.
pub fn spawn_workers(
    join_set: &mut tokio::task::JoinSet<()>,
    settings: Arc<SyncSettings>,
    bucket_rx: SharedBucketRx,
    events_tx: tokio::sync::mpsc::Sender<Event>,
    cancel: Cancellation,
    children: ChildRegistry,
) {
    for worker in 1..=settings.processes {
        let settings = settings.clone();
        let bucket_rx = bucket_rx.clone();
        let events_tx = events_tx.clone();
        let cancel = cancel.clone();
        let children = children.clone();
        join_set.spawn(async move {
            worker_loop(worker, settings, bucket_rx, events_tx, cancel, children).await;
        });
    }
}

async fn worker_loop(
    worker: usize,
    settings: Arc<SyncSettings>,
    bucket_rx: SharedBucketRx,
    events_tx: tokio::sync::mpsc::Sender<Event>,
    cancel: Cancellation,
    children: ChildRegistry,
) {
    loop {
        if cancel.is_stopped() {
            break;
        }
        let bucket = {
            let mut rx = bucket_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.stopped() => None,
                bucket = rx.recv() => bucket,
            }
        };
        let Some(bucket) = bucket else { break };
        let _ = events_tx
            .send(Event::BucketStarted {
                id: bucket.id,
                worker,
            })
            .await;
        let result = run_bucket(&settings, &bucket, &cancel, &children).await;
        tracing::debug!(
            "worker {}: bucket {} finished with {:?}",
            worker,
            bucket.id,
            result.outcome
        );
        if events_tx.send(Event::BucketFinished(result)).await.is_err() {
            break;
        }
    }
    let _ = events_tx.send(Event::WorkerExited { worker }).await;
}

/// Run one bucket's child to completion (or to cancellation).
async fn run_bucket(
    settings: &SyncSettings,
    bucket: &Bucket,
    cancel: &Cancellation,
    children: &ChildRegistry,
) -> BucketResult {
    let started = std::time::Instant::now();
    let source_root = &settings.sources[bucket.source];
    let argv = rsync::build_argv(settings, source_root);
    tracing::debug!("bucket {}: spawning {:?} {:?}", bucket.id, &settings.rsync_path, &argv);
    let spawned = tokio::process::Command::new(&settings.rsync_path)
        .args(&argv)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", &settings.rsync_path));
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => return spawn_failure(bucket, started, format!("{:#}", err)),
    };
    let pid = child.id();
    if let Some(pid) = pid {
        children.insert(bucket.id, pid);
    }
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        children.remove(bucket.id);
        return spawn_failure(bucket, started, "child pipes unavailable".to_string());
    };

    let mut stderr_tail: std::collections::VecDeque<String> = std::collections::VecDeque::new();
    {
        let feed = feed_file_list(stdin, bucket, cancel);
        let drain = drain_stdout(stdout, bucket.id);
        let tail = tail_stderr(stderr, bucket.id, &mut stderr_tail);
        let io = async { tokio::join!(feed, drain, tail) };
        tokio::select! {
            biased;
            _ = cancel.aborted() => {}
            _ = io => {}
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.aborted() => None,
        status = child.wait() => status.ok(),
    };
    let status = match status {
        Some(status) => Some(status),
        None => terminate(&mut child, pid, bucket.id).await,
    };
    children.remove(bucket.id);

    let exit_code = status.and_then(|s| s.code());
    let outcome = if cancel.is_aborted() && exit_code.is_none() {
        BucketOutcome::Cancelled
    } else {
        rsync::classify_exit(exit_code)
    };
    BucketResult {
        id: bucket.id,
        outcome,
        exit_code,
        wall_time: started.elapsed(),
        entries: bucket.count(),
        bytes: bucket.bytes,
        sample_path: bucket.sample_path(),
        stderr_tail: stderr_tail.into_iter().collect(),
        spawn_error: None,
    }
}

fn spawn_failure(bucket: &Bucket, started: std::time::Instant, message: String) -> BucketResult {
    tracing::error!("bucket {}: {}", bucket.id, &message);
    BucketResult {
        id: bucket.id,
        outcome: BucketOutcome::Failed,
        exit_code: None,
        wall_time: started.elapsed(),
        entries: bucket.count(),
        bytes: bucket.bytes,
        sample_path: bucket.sample_path(),
        stderr_tail: Vec::new(),
        spawn_error: Some(message),
    }
}

/// Write the bucket's relative paths to the child, NUL-terminated to match
/// `--from0`. A write error means the child is gone; its exit status tells
/// the rest of the story.
async fn feed_file_list(
    stdin: tokio::process::ChildStdin,
    bucket: &Bucket,
    cancel: &Cancellation,
) {
    let mut writer = tokio::io::BufWriter::new(stdin);
    for entry in &bucket.entries {
        if cancel.is_aborted() {
            break;
        }
        if writer
            .write_all(entry.rel_path.as_os_str().as_bytes())
            .await
            .is_err()
        {
            return;
        }
        if writer.write_all(b"\0").await.is_err() {
            return;
        }
    }
    let _ = writer.flush().await;
    let mut stdin = writer.into_inner();
    let _ = stdin.shutdown().await;
}

async fn drain_stdout(stdout: tokio::process::ChildStdout, bucket_id: u64) {
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("bucket {}: rsync: {}", bucket_id, line);
    }
}

async fn tail_stderr(
    stderr: tokio::process::ChildStderr,
    bucket_id: u64,
    tail: &mut std::collections::VecDeque<String>,
) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("bucket {}: rsync stderr: {}", bucket_id, line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    bucket_id: u64,
) -> Option<std::process::ExitStatus> {
    if let Some(pid) = pid {
        tracing::info!("bucket {}: terminating child {}", bucket_id, pid);
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(
                "bucket {}: child survived {:?} after SIGTERM, killing",
                bucket_id,
                TERM_GRACE
            );
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Entry, EntryKind};
    use std::os::unix::fs::PermissionsExt;
    use test_log::test;

    /// Drop a fake rsync into a temp dir so the child lifecycle can be
    /// exercised without the real binary.
    fn fake_rsync(dir: &std::path::Path, script_body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-rsync");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_bucket() -> Bucket {
        let mut bucket = Bucket::new(1, 0);
        bucket.push(Entry::new(".".into(), 0, EntryKind::Directory));
        bucket.push(Entry::new("a".into(), 10, EntryKind::Regular));
        bucket.push(Entry::new("b".into(), 20, EntryKind::Regular));
        bucket
    }

    fn test_settings(rsync_path: std::path::PathBuf) -> SyncSettings {
        let mut settings = SyncSettings::new(vec!["/tmp/psync-src".into()], "/tmp/psync-dst".into());
        settings.rsync_path = rsync_path;
        settings
    }

    #[test(tokio::test)]
    async fn clean_exit_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_rsync(dir.path(), "cat > /dev/null; exit 0");
        let settings = test_settings(script);
        let result = run_bucket(
            &settings,
            &test_bucket(),
            &Cancellation::new(),
            &ChildRegistry::new(),
        )
        .await;
        assert_eq!(result.outcome, BucketOutcome::Ok);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.entries, 3);
        assert_eq!(result.bytes, 30);
    }

    #[test(tokio::test)]
    async fn vanished_files_exit_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_rsync(dir.path(), "cat > /dev/null; exit 24");
        let settings = test_settings(script);
        let result = run_bucket(
            &settings,
            &test_bucket(),
            &Cancellation::new(),
            &ChildRegistry::new(),
        )
        .await;
        assert_eq!(result.outcome, BucketOutcome::Partial);
        assert_eq!(result.exit_code, Some(24));
    }

    #[test(tokio::test)]
    async fn nonzero_exit_captures_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_rsync(
            dir.path(),
            "cat > /dev/null; echo 'boom: no such file' >&2; exit 12",
        );
        let settings = test_settings(script);
        let result = run_bucket(
            &settings,
            &test_bucket(),
            &Cancellation::new(),
            &ChildRegistry::new(),
        )
        .await;
        assert_eq!(result.outcome, BucketOutcome::Failed);
        assert_eq!(result.exit_code, Some(12));
        assert_eq!(result.stderr_tail, vec!["boom: no such file".to_string()]);
        assert_eq!(result.sample_path, std::path::PathBuf::from("a"));
    }

    #[test(tokio::test)]
    async fn stderr_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_rsync(
            dir.path(),
            "cat > /dev/null; i=0; while [ $i -lt 200 ]; do echo line$i >&2; i=$((i+1)); done; exit 1",
        );
        let settings = test_settings(script);
        let result = run_bucket(
            &settings,
            &test_bucket(),
            &Cancellation::new(),
            &ChildRegistry::new(),
        )
        .await;
        assert_eq!(result.stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(result.stderr_tail.last().unwrap(), "line199");
        assert_eq!(result.stderr_tail.first().unwrap(), "line136");
    }

    #[test(tokio::test)]
    async fn missing_executable_is_a_spawn_failure() {
        let settings = test_settings("/nonexistent/psync/rsync".into());
        let result = run_bucket(
            &settings,
            &test_bucket(),
            &Cancellation::new(),
            &ChildRegistry::new(),
        )
        .await;
        assert_eq!(result.outcome, BucketOutcome::Failed);
        assert!(result.spawn_error.is_some());
        assert_eq!(result.exit_code, None);
    }

    #[test(tokio::test)]
    async fn abort_terminates_a_hung_child() {
        let dir = tempfile::tempdir().unwrap();
        // ignore stdin and hang; SIGTERM must reap it
        let script = fake_rsync(dir.path(), "exec sleep 600");
        let settings = test_settings(script);
        let cancel = Cancellation::new();
        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            aborter.abort();
        });
        let started = std::time::Instant::now();
        let result = run_bucket(&settings, &test_bucket(), &cancel, &ChildRegistry::new()).await;
        assert_eq!(result.outcome, BucketOutcome::Cancelled);
        assert!(started.elapsed() < TERM_GRACE + std::time::Duration::from_secs(2));
    }

    #[test(tokio::test)]
    async fn workers_drain_the_channel_and_report_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_rsync(dir.path(), "cat > /dev/null; exit 0");
        let mut settings = test_settings(script);
        settings.processes = 2;
        let settings = Arc::new(settings);
        let (bucket_tx, bucket_rx) = tokio::sync::mpsc::channel(4);
        let (events_tx, mut events_rx) = crate::events::channel(2);
        let mut join_set = tokio::task::JoinSet::new();
        spawn_workers(
            &mut join_set,
            settings,
            Arc::new(tokio::sync::Mutex::new(bucket_rx)),
            events_tx,
            Cancellation::new(),
            ChildRegistry::new(),
        );
        for id in 1..=3u64 {
            let mut bucket = Bucket::new(id, 0);
            bucket.push(Entry::new("f".into(), 1, EntryKind::Regular));
            bucket_tx.send(bucket).await.unwrap();
        }
        drop(bucket_tx);
        while join_set.join_next().await.is_some() {}
        let mut finished = 0;
        let mut exited = 0;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                Event::BucketFinished(result) => {
                    assert_eq!(result.outcome, BucketOutcome::Ok);
                    finished += 1;
                }
                Event::WorkerExited { .. } => exited += 1,
                _ => {}
            }
        }
        assert_eq!(finished, 3);
        assert!(exited >= 1);
    }
}
