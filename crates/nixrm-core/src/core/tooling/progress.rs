use std::env;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const TICK: Duration = Duration::from_millis(80);
/// Stages that finish faster than this never draw anything.
const START_DELAY: Duration = Duration::from_millis(120);

/// Number of live `SuspendGuard`s; nothing is drawn while it is non-zero.
static SUSPENDED: AtomicUsize = AtomicUsize::new(0);
static STDERR: Mutex<()> = Mutex::new(());

pub(crate) fn progress_enabled() -> bool {
    match env::var("NIXRM_PROGRESS") {
        Ok(value) => value != "0",
        Err(_) => atty::is(atty::Stream::Stderr),
    }
}

fn draw(line: &str) {
    let _guard = STDERR.lock().ok();
    let mut stderr = io::stderr();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
}

fn clear_line() {
    draw("\r\x1b[2K");
}

struct Ticker {
    label: String,
    total: Option<usize>,
    done: AtomicUsize,
    stopped: AtomicBool,
}

impl Ticker {
    fn line(&self, frame: usize) -> String {
        let spinner = FRAMES[frame % FRAMES.len()];
        match self.total {
            Some(total) => {
                let done = self.done.load(Ordering::Relaxed).min(total);
                format!("\r\x1b[2Knixrm ▸ {} [{done}/{total}] {spinner}", self.label)
            }
            None => format!("\r\x1b[2Knixrm ▸ {} {spinner}", self.label),
        }
    }

    fn run(&self) {
        let started = Instant::now();
        let mut drawn = false;
        let mut frame = 0usize;
        while !self.stopped.load(Ordering::Acquire) {
            let suspended = SUSPENDED.load(Ordering::Acquire) > 0;
            if started.elapsed() >= START_DELAY && !suspended {
                draw(&self.line(frame));
                frame = frame.wrapping_add(1);
                drawn = true;
            } else if drawn {
                clear_line();
                drawn = false;
            }
            thread::park_timeout(TICK);
        }
        if drawn {
            clear_line();
        }
    }
}

/// A stderr spinner or `[done/total]` counter for one pipeline stage.
///
/// Inert when stderr is not a terminal or `NIXRM_PROGRESS=0`.
pub struct ProgressReporter {
    ticker: Option<(Arc<Ticker>, JoinHandle<()>)>,
}

impl ProgressReporter {
    pub fn spinner(label: impl Into<String>) -> Self {
        Self::start(label.into(), None)
    }

    pub fn bar(label: impl Into<String>, total: usize) -> Self {
        Self::start(label.into(), (total > 0).then_some(total))
    }

    fn start(label: String, total: Option<usize>) -> Self {
        if !progress_enabled() {
            return Self { ticker: None };
        }
        let ticker = Arc::new(Ticker {
            label,
            total,
            done: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        let worker = Arc::clone(&ticker);
        let handle = thread::spawn(move || worker.run());
        Self {
            ticker: Some((ticker, handle)),
        }
    }

    /// Safe to call from pool workers.
    pub fn increment(&self) {
        if let Some((ticker, _)) = &self.ticker {
            ticker.done.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stops drawing and prints `message` on its own line.
    pub fn finish(mut self, message: impl Into<String>) {
        if self.stop() {
            draw(&format!("nixrm ▸ {}\n", message.into()));
        }
    }

    fn stop(&mut self) -> bool {
        let Some((ticker, handle)) = self.ticker.take() else {
            return false;
        };
        ticker.stopped.store(true, Ordering::Release);
        handle.thread().unpark();
        let _ = handle.join();
        true
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hides progress output while the remote command owns the terminal.
pub(crate) struct SuspendGuard;

impl SuspendGuard {
    pub(crate) fn new() -> Self {
        SUSPENDED.fetch_add(1, Ordering::AcqRel);
        Self
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        SUSPENDED.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker count for per-object pools: the requested value or the available
/// parallelism, clamped to `1..=16` and never more than the amount of work.
pub(crate) fn worker_count(requested: Option<usize>, total: usize) -> usize {
    let available = thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    requested
        .unwrap_or(available)
        .clamp(1, 16)
        .min(total.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_bounded_by_work_and_limits() {
        assert_eq!(worker_count(Some(8), 3), 3);
        assert_eq!(worker_count(Some(64), 100), 16);
        assert_eq!(worker_count(Some(0), 10), 1);
        assert_eq!(worker_count(Some(4), 0), 1);
        assert!(worker_count(None, 100) >= 1);
    }

    #[test]
    fn counter_line_is_capped_at_total() {
        let ticker = Ticker {
            label: "transferring".into(),
            total: Some(2),
            done: AtomicUsize::new(5),
            stopped: AtomicBool::new(false),
        };
        assert!(ticker.line(0).ends_with("nixrm ▸ transferring [2/2] ⠋"));
    }
}
