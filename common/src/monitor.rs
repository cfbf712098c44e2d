//! The monitor task: sole owner of aggregate run state and of the output
//! streams.
//!
//! Everything else reports through the event channel; the monitor folds the
//! events into counters, keeps the live progress line fresh, applies the
//! run-level failure policy and finally renders the summary.

use std::io::Write;

use crate::bucket::{BucketOutcome, BucketResult};
use crate::cancel::Cancellation;
use crate::config::SyncSettings;
use crate::error::{EXIT_CANCELLED, EXIT_FAILED, EXIT_OK};
use crate::events::Event;
use crate::progress::{ProgressLine, Snapshot};

/// Failed-bucket reports retained for the final summary.
const MAX_FAILURE_REPORTS: usize = 32;

const REDRAW_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

#[derive(Debug)]
pub struct FailureReport {
    pub bucket_id: u64,
    pub exit_code: Option<i32>,
    pub sample_path: std::path::PathBuf,
    pub stderr_tail: Vec<String>,
    pub spawn_error: Option<String>,
}

/// Aggregate outcome of one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub buckets_total: u64,
    pub buckets_ok: u64,
    pub buckets_partial: u64,
    pub buckets_failed: u64,
    pub buckets_cancelled: u64,
    pub entries_processed: u64,
    pub bytes_processed: u64,
    pub elapsed: std::time::Duration,
    /// Cancellation came from a user signal (as opposed to failure policy).
    pub signalled: bool,
    pub first_failure_code: Option<i32>,
    pub failures: Vec<FailureReport>,
}

impl RunSummary {
    /// 130 on user signal; without `--keep-going` the first failing child's
    /// own exit code; otherwise 1 if anything failed, 0 for ok/partial runs.
    pub fn exit_code(&self, keep_going: bool) -> i32 {
        if self.signalled {
            return EXIT_CANCELLED;
        }
        if self.buckets_failed > 0 {
            if !keep_going {
                return self.first_failure_code.unwrap_or(EXIT_FAILED);
            }
            return EXIT_FAILED;
        }
        EXIT_OK
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "buckets:  {} (ok: {}, partial: {}, failed: {}, cancelled: {})\n\
            entries:  {}\n\
            bytes:    {}\n\
            elapsed:  {:.1}s",
            self.buckets_total,
            self.buckets_ok,
            self.buckets_partial,
            self.buckets_failed,
            self.buckets_cancelled,
            self.entries_processed,
            bytesize::ByteSize(self.bytes_processed),
            self.elapsed.as_secs_f64(),
        )
    }
}

struct Monitor {
    settings: std::sync::Arc<SyncSettings>,
    cancel: Cancellation,
    summary: RunSummary,
    crawl_totals: Option<(u64, u64)>, // (entries, bytes)
    started: std::time::Instant,
    progress: ProgressLine,
    show_progress: bool,
    line_active: bool,
    announced_cancel: bool,
    announced_stop_policy: bool,
}

/// Drain the event channel until `Shutdown`, then emit the final report.
pub async fn run_monitor(
    mut events_rx: tokio::sync::mpsc::Receiver<Event>,
    settings: std::sync::Arc<SyncSettings>,
    cancel: Cancellation,
) -> RunSummary {
    use std::io::IsTerminal;
    let show_progress = settings.progress && std::io::stdout().is_terminal();
    let mut monitor = Monitor {
        settings,
        cancel,
        summary: RunSummary::default(),
        crawl_totals: None,
        started: std::time::Instant::now(),
        progress: ProgressLine::new(),
        show_progress,
        line_active: false,
        announced_cancel: false,
        announced_stop_policy: false,
    };
    let mut ticker = tokio::time::interval(REDRAW_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => monitor.handle(event),
                }
            }
            _ = ticker.tick() => monitor.redraw(),
        }
    }
    monitor.finish()
}

impl Monitor {
    fn handle(&mut self, event: Event) {
        match event {
            Event::BucketQueued { id, entries, bytes } => {
                tracing::debug!("bucket {} queued: {} entries, {} bytes", id, entries, bytes);
                self.summary.buckets_total += 1;
            }
            Event::BucketStarted { id, worker } => {
                tracing::debug!("bucket {} started on worker {}", id, worker);
            }
            Event::BucketFinished(result) => self.bucket_finished(result),
            Event::CrawlWarning { path, message } => {
                if !self.settings.quiet {
                    self.clear_line();
                    eprintln!("psync: warning: {}: {}", path.display(), message);
                }
            }
            Event::CrawlComplete {
                entries,
                bytes,
                buckets,
            } => {
                tracing::info!(
                    "crawl complete: {} entries, {} in {} buckets",
                    entries,
                    bytesize::ByteSize(bytes),
                    buckets
                );
                self.crawl_totals = Some((entries, bytes));
            }
            Event::WorkerExited { worker } => {
                tracing::debug!("worker {} exited", worker);
            }
            Event::CancelRequested => {
                self.summary.signalled = true;
                if !self.announced_cancel {
                    self.announced_cancel = true;
                    self.clear_line();
                    eprintln!("psync: cancelling, waiting for running rsync children...");
                }
            }
            Event::Shutdown => {}
        }
    }

    fn bucket_finished(&mut self, result: BucketResult) {
        match result.outcome {
            BucketOutcome::Ok => {
                self.summary.buckets_ok += 1;
                self.summary.entries_processed += result.entries as u64;
                self.summary.bytes_processed += result.bytes;
            }
            BucketOutcome::Partial => {
                self.summary.buckets_partial += 1;
                self.summary.entries_processed += result.entries as u64;
                self.summary.bytes_processed += result.bytes;
                if !self.settings.quiet {
                    self.clear_line();
                    eprintln!(
                        "psync: warning: bucket {} ({}): partial transfer, rsync exited {}",
                        result.id,
                        result.sample_path.display(),
                        result.exit_code.unwrap_or(-1),
                    );
                }
            }
            BucketOutcome::Failed => self.bucket_failed(result),
            BucketOutcome::Cancelled => {
                self.summary.buckets_cancelled += 1;
            }
        }
    }

    fn bucket_failed(&mut self, result: BucketResult) {
        self.summary.buckets_failed += 1;
        if self.summary.first_failure_code.is_none() {
            self.summary.first_failure_code = result.exit_code;
        }
        self.clear_line();
        match &result.spawn_error {
            Some(message) => eprintln!(
                "psync: bucket {} ({}): {}",
                result.id,
                result.sample_path.display(),
                message
            ),
            None => eprintln!(
                "psync: bucket {} ({}): rsync exited {}",
                result.id,
                result.sample_path.display(),
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "on a signal".to_string()),
            ),
        }
        let first_bucket_spawn_failure = result.id == 1 && result.spawn_error.is_some();
        if self.summary.failures.len() == MAX_FAILURE_REPORTS {
            self.summary.failures.remove(0);
        }
        self.summary.failures.push(FailureReport {
            bucket_id: result.id,
            exit_code: result.exit_code,
            sample_path: result.sample_path,
            stderr_tail: result.stderr_tail,
            spawn_error: result.spawn_error,
        });
        if first_bucket_spawn_failure {
            // the very first child not even starting smells like a broken
            // rsync path, not a per-bucket problem
            eprintln!("psync: first bucket could not spawn rsync, aborting the run");
            self.cancel.drain();
        } else if !self.settings.keep_going && !self.announced_stop_policy {
            self.announced_stop_policy = true;
            eprintln!("psync: stopping after first failed bucket (pass --keep-going to continue)");
            self.cancel.drain();
        }
    }

    fn redraw(&mut self) {
        if !self.show_progress || self.cancel.is_aborted() {
            return;
        }
        let done = self.summary.buckets_ok
            + self.summary.buckets_partial
            + self.summary.buckets_failed
            + self.summary.buckets_cancelled;
        let snapshot = Snapshot {
            buckets_done: done,
            buckets_total: self.summary.buckets_total,
            totals_known: self.crawl_totals.is_some(),
            entries: self.summary.entries_processed,
            bytes: self.summary.bytes_processed,
            total_bytes: self.crawl_totals.map(|(_, bytes)| bytes).unwrap_or(0),
        };
        let line = self.progress.render(&snapshot);
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "\r{}", line);
        let _ = stdout.flush();
        self.line_active = true;
    }

    /// Move off the progress line before printing anything that scrolls.
    fn clear_line(&mut self) {
        if self.line_active {
            println!();
            self.line_active = false;
        }
    }

    fn finish(mut self) -> RunSummary {
        self.redraw();
        self.clear_line();
        self.summary.elapsed = self.started.elapsed();
        for failure in &self.summary.failures {
            if !failure.stderr_tail.is_empty() {
                eprintln!(
                    "psync: bucket {} stderr (last {} lines):",
                    failure.bucket_id,
                    failure.stderr_tail.len()
                );
                for line in &failure.stderr_tail {
                    eprintln!("    {}", line);
                }
            }
        }
        if !self.settings.quiet {
            println!("{}", &self.summary);
        }
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketOutcome;

    fn quiet_settings() -> std::sync::Arc<SyncSettings> {
        let mut settings = SyncSettings::new(vec!["/s".into()], "/d".into());
        settings.quiet = true;
        std::sync::Arc::new(settings)
    }

    fn result(id: u64, outcome: BucketOutcome, exit_code: Option<i32>) -> BucketResult {
        BucketResult {
            id,
            outcome,
            exit_code,
            wall_time: std::time::Duration::from_millis(5),
            entries: 10,
            bytes: 100,
            sample_path: "some/file".into(),
            stderr_tail: Vec::new(),
            spawn_error: None,
        }
    }

    async fn run_with_events(
        settings: std::sync::Arc<SyncSettings>,
        cancel: Cancellation,
        events: Vec<Event>,
    ) -> RunSummary {
        let (tx, rx) = crate::events::channel(2);
        let handle = tokio::spawn(run_monitor(rx, settings, cancel));
        for event in events {
            tx.send(event).await.unwrap();
        }
        tx.send(Event::Shutdown).await.unwrap();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn counts_outcomes_and_processed_totals() {
        let summary = run_with_events(
            quiet_settings(),
            Cancellation::new(),
            vec![
                Event::BucketQueued {
                    id: 1,
                    entries: 10,
                    bytes: 100,
                },
                Event::BucketQueued {
                    id: 2,
                    entries: 10,
                    bytes: 100,
                },
                Event::BucketFinished(result(1, BucketOutcome::Ok, Some(0))),
                Event::BucketFinished(result(2, BucketOutcome::Partial, Some(24))),
                Event::CrawlComplete {
                    entries: 20,
                    bytes: 200,
                    buckets: 2,
                },
            ],
        )
        .await;
        assert_eq!(summary.buckets_total, 2);
        assert_eq!(summary.buckets_ok, 1);
        assert_eq!(summary.buckets_partial, 1);
        assert_eq!(summary.entries_processed, 20);
        assert_eq!(summary.bytes_processed, 200);
        assert_eq!(summary.exit_code(true), EXIT_OK);
        assert_eq!(summary.exit_code(false), EXIT_OK);
    }

    #[tokio::test]
    async fn failure_without_keep_going_drains_and_surfaces_rsync_code() {
        let settings = quiet_settings();
        let cancel = Cancellation::new();
        let summary = run_with_events(
            settings,
            cancel.clone(),
            vec![
                Event::BucketQueued {
                    id: 1,
                    entries: 10,
                    bytes: 100,
                },
                Event::BucketFinished(result(1, BucketOutcome::Failed, Some(11))),
            ],
        )
        .await;
        assert!(cancel.is_stopped());
        assert!(!cancel.is_aborted());
        assert_eq!(summary.buckets_failed, 1);
        assert_eq!(summary.exit_code(false), 11);
        assert_eq!(summary.exit_code(true), EXIT_FAILED);
    }

    #[tokio::test]
    async fn keep_going_does_not_cancel_on_failure() {
        let mut settings = SyncSettings::new(vec!["/s".into()], "/d".into());
        settings.quiet = true;
        settings.keep_going = true;
        let cancel = Cancellation::new();
        let summary = run_with_events(
            std::sync::Arc::new(settings),
            cancel.clone(),
            vec![
                Event::BucketFinished(result(3, BucketOutcome::Failed, Some(12))),
                Event::BucketFinished(result(4, BucketOutcome::Ok, Some(0))),
            ],
        )
        .await;
        assert!(!cancel.is_stopped());
        assert_eq!(summary.buckets_failed, 1);
        assert_eq!(summary.buckets_ok, 1);
        assert_eq!(summary.exit_code(true), EXIT_FAILED);
    }

    #[tokio::test]
    async fn spawn_failure_on_first_bucket_aborts_even_with_keep_going() {
        let mut settings = SyncSettings::new(vec!["/s".into()], "/d".into());
        settings.quiet = true;
        settings.keep_going = true;
        let cancel = Cancellation::new();
        let mut failed = result(1, BucketOutcome::Failed, None);
        failed.spawn_error = Some("no such executable".to_string());
        let summary = run_with_events(
            std::sync::Arc::new(settings),
            cancel.clone(),
            vec![Event::BucketFinished(failed)],
        )
        .await;
        assert!(cancel.is_stopped());
        assert_eq!(summary.buckets_failed, 1);
    }

    #[tokio::test]
    async fn signal_cancellation_exits_130() {
        let summary = run_with_events(
            quiet_settings(),
            Cancellation::new(),
            vec![
                Event::CancelRequested,
                Event::BucketFinished(result(1, BucketOutcome::Cancelled, None)),
            ],
        )
        .await;
        assert!(summary.signalled);
        assert_eq!(summary.buckets_cancelled, 1);
        assert_eq!(summary.exit_code(true), EXIT_CANCELLED);
        assert_eq!(summary.exit_code(false), EXIT_CANCELLED);
    }

    #[tokio::test]
    async fn failure_reports_are_bounded() {
        let mut events = Vec::new();
        for id in 1..=(MAX_FAILURE_REPORTS as u64 + 10) {
            events.push(Event::BucketFinished(result(
                id + 1, // keep away from the first-bucket spawn policy
                BucketOutcome::Failed,
                Some(1),
            )));
        }
        let mut settings = SyncSettings::new(vec!["/s".into()], "/d".into());
        settings.quiet = true;
        settings.keep_going = true;
        let summary =
            run_with_events(std::sync::Arc::new(settings), Cancellation::new(), events).await;
        assert_eq!(summary.failures.len(), MAX_FAILURE_REPORTS);
    }

    #[test]
    fn summary_display_mentions_all_counters() {
        let summary = RunSummary {
            buckets_total: 5,
            buckets_ok: 3,
            buckets_partial: 1,
            buckets_failed: 1,
            buckets_cancelled: 0,
            entries_processed: 123,
            bytes_processed: 1 << 20,
            elapsed: std::time::Duration::from_secs(2),
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("ok: 3"));
        assert!(text.contains("partial: 1"));
        assert!(text.contains("failed: 1"));
        assert!(text.contains("123"));
        assert!(text.contains("MiB"));
    }
}
