//! Thread-safe transfer progress: running totals, instantaneous speed, ETA,
//! pushed to a pluggable sink (terminal bar, log line, or nothing).

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_ETA_SECS: u64 = 24 * 60 * 60;

/// A point-in-time view of a task's progress, handed to a `ProgressSink`.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub total_size: u64,
    pub transferred: u64,
    pub active_chunks: usize,
    pub bytes_per_sec: f64,
    pub eta: Duration,
    pub percent: f64,
}

/// Aggregates progress for a single task across all worker threads.
pub struct ProgressTracker {
    total_size: u64,
    transferred: AtomicU64,
    active_chunks: AtomicUsize,
    started_at: Instant,
    speed_window: Mutex<SpeedWindow>,
}

struct SpeedWindow {
    last_sample_at: Instant,
    last_sample_bytes: u64,
    current_speed: f64,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        let now = Instant::now();
        ProgressTracker {
            total_size,
            transferred: AtomicU64::new(0),
            active_chunks: AtomicUsize::new(0),
            started_at: now,
            speed_window: Mutex::new(SpeedWindow {
                last_sample_at: now,
                last_sample_bytes: 0,
                current_speed: 0.0,
            }),
        }
    }

    pub fn chunk_started(&self) {
        self.active_chunks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn chunk_finished(&self) {
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record `n` newly-transferred bytes (monotonic).
    pub fn add_bytes(&self, n: u64) {
        self.transferred.fetch_add(n, Ordering::SeqCst);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Instantaneous speed over a 1s window, recomputed at most once per
    /// window and held steady between samples.
    fn sample_speed(&self) -> f64 {
        let mut window = self.speed_window.lock().unwrap();
        let elapsed = window.last_sample_at.elapsed();
        if elapsed < Duration::from_secs(1) {
            return window.current_speed;
        }
        let bytes_now = self.transferred();
        let delta_bytes = bytes_now.saturating_sub(window.last_sample_bytes);
        let speed = delta_bytes as f64 / elapsed.as_secs_f64();
        window.last_sample_at = Instant::now();
        window.last_sample_bytes = bytes_now;
        window.current_speed = speed;
        speed
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let transferred = self.transferred();
        let bytes_per_sec = self.sample_speed();
        let remaining = self.total_size.saturating_sub(transferred);
        let eta_secs = if bytes_per_sec > 0.0 {
            (remaining as f64 / bytes_per_sec) as u64
        } else {
            MAX_ETA_SECS
        };
        let percent = if self.total_size == 0 {
            100.0
        } else {
            (transferred as f64 / self.total_size as f64) * 100.0
        };

        ProgressSnapshot {
            total_size: self.total_size,
            transferred,
            active_chunks: self.active_chunks.load(Ordering::SeqCst),
            bytes_per_sec,
            eta: Duration::from_secs(eta_secs.min(MAX_ETA_SECS)),
            percent,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Where progress updates go. Implementations must be cheap to call at up
/// to 30 Hz.
pub trait ProgressSink: Send + Sync {
    fn on_update(&self, snapshot: ProgressSnapshot);
    fn on_finish(&self, snapshot: ProgressSnapshot);
}

/// No-op sink, used in tests and non-interactive/piped invocations.
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    fn on_update(&self, _snapshot: ProgressSnapshot) {}
    fn on_finish(&self, _snapshot: ProgressSnapshot) {}
}

/// `indicatif`-backed terminal progress bar.
pub struct TerminalSink {
    bar: ProgressBar,
}

impl TerminalSink {
    pub fn new(total_size: u64) -> Self {
        let bar = ProgressBar::new(total_size);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {bytes}/{total_bytes} {binary_bytes_per_sec} eta {eta}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        TerminalSink { bar }
    }
}

impl ProgressSink for TerminalSink {
    fn on_update(&self, snapshot: ProgressSnapshot) {
        self.bar.set_length(snapshot.total_size);
        self.bar.set_position(snapshot.transferred);
    }

    fn on_finish(&self, snapshot: ProgressSnapshot) {
        self.bar.set_position(snapshot.transferred);
        self.bar.finish_and_clear();
    }
}

/// Emits a `tracing` line instead of redrawing a bar -- used for `-q`/`-v`
/// or non-tty output where a live bar would just spam the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_update(&self, snapshot: ProgressSnapshot) {
        tracing::info!(
            transferred = snapshot.transferred,
            total = snapshot.total_size,
            percent = format!("{:.1}", snapshot.percent),
            speed = format_speed(snapshot.bytes_per_sec),
            "progress"
        );
    }

    fn on_finish(&self, snapshot: ProgressSnapshot) {
        tracing::info!(
            transferred = snapshot.transferred,
            elapsed = format_duration(Duration::from_secs_f64(
                snapshot.transferred as f64 / snapshot.bytes_per_sec.max(1.0)
            )),
            "transfer finished"
        );
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn format_duration_buckets() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m05s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h01m05s");
    }

    #[test]
    fn tracker_reports_monotonic_transferred() {
        let tracker = ProgressTracker::new(100);
        tracker.add_bytes(10);
        tracker.add_bytes(20);
        assert_eq!(tracker.transferred(), 30);
        let snap = tracker.snapshot();
        assert_eq!(snap.transferred, 30);
        assert_eq!(snap.total_size, 100);
        assert!((snap.percent - 30.0).abs() < 0.01);
    }

    #[test]
    fn tracker_active_chunks_tracks_start_and_finish() {
        let tracker = ProgressTracker::new(10);
        tracker.chunk_started();
        tracker.chunk_started();
        assert_eq!(tracker.snapshot().active_chunks, 2);
        tracker.chunk_finished();
        assert_eq!(tracker.snapshot().active_chunks, 1);
    }

    #[test]
    fn tracker_zero_total_is_100_percent() {
        let tracker = ProgressTracker::new(0);
        assert_eq!(tracker.snapshot().percent, 100.0);
    }

    #[test]
    fn noop_sink_accepts_any_snapshot() {
        let tracker = ProgressTracker::new(10);
        tracker.add_bytes(5);
        let sink = NoOpSink;
        sink.on_update(tracker.snapshot());
        sink.on_finish(tracker.snapshot());
    }
}
