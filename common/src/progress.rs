//! Rendering of the single-line live progress display.
//!
//! The monitor redraws the line in place with a carriage return; this module
//! only builds the text. Throughput is computed over a sliding 5-second
//! window of byte samples, and the ETA appears once the crawl has completed
//! and the total byte count is exact. Until then the bucket total carries a
//! trailing `+`.

use std::collections::VecDeque;

const RATE_WINDOW: std::time::Duration = std::time::Duration::from_secs(5);

/// Monitor-owned counters copied out for one redraw.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub buckets_done: u64,
    pub buckets_total: u64,
    pub totals_known: bool,
    pub entries: u64,
    pub bytes: u64,
    pub total_bytes: u64,
}

pub struct ProgressLine {
    samples: VecDeque<(std::time::Instant, u64)>,
    last_len: usize,
}

impl ProgressLine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            last_len: 0,
        }
    }

    /// Render one refresh of the progress line, padded to overwrite the
    /// previous render.
    pub fn render(&mut self, snapshot: &Snapshot) -> String {
        self.render_at(std::time::Instant::now(), snapshot)
    }

    fn render_at(&mut self, now: std::time::Instant, snapshot: &Snapshot) -> String {
        self.samples.push_back((now, snapshot.bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > RATE_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let rate = self.current_rate(now);
        let plus = if snapshot.totals_known { "" } else { "+" };
        let mut line = format!(
            "{}/{}{} buckets  {} entries  {}",
            snapshot.buckets_done,
            snapshot.buckets_total,
            plus,
            snapshot.entries,
            bytesize::ByteSize(snapshot.bytes),
        );
        if let Some(rate) = rate {
            line.push_str(&format!("  {}/s", bytesize::ByteSize(rate as u64)));
            if snapshot.totals_known && rate > 0.0 {
                let remaining = snapshot.total_bytes.saturating_sub(snapshot.bytes);
                let eta = (remaining as f64 / rate).ceil() as u64;
                line.push_str(&format!("  eta {}", format_duration(eta)));
            }
        }
        let unpadded = line.chars().count();
        if unpadded < self.last_len {
            line.extend(std::iter::repeat(' ').take(self.last_len - unpadded));
        }
        self.last_len = unpadded;
        line
    }

    /// Bytes per second over the sampled window; None until two samples with
    /// a measurable gap exist.
    fn current_rate(&self, now: std::time::Instant) -> Option<f64> {
        let &(first_t, first_bytes) = self.samples.front()?;
        let elapsed = now.duration_since(first_t).as_secs_f64();
        if elapsed <= 0.0 || self.samples.len() < 2 {
            return None;
        }
        let &(_, last_bytes) = self.samples.back()?;
        Some((last_bytes.saturating_sub(first_bytes)) as f64 / elapsed)
    }
}

impl Default for ProgressLine {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
