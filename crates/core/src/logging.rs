//! Leveled, categorized logging for the CPU core.
//!
//! Configuration lives in a process-global [`LogConfig`] driven by atomics,
//! so the hot path costs one relaxed load when logging is off. Messages are
//! built lazily through closures and can be mirrored to a file through a
//! background writer thread so emulation never blocks on disk I/O. A
//! sliding-window rate limit per category keeps a misbehaving guest from
//! flooding the host with millions of identical lines per emulated second.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Log level for controlling verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse a log level from a string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Logging category, one per core subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Instruction execution and dispatch.
    Cpu,
    /// Linear bus and paging traffic.
    Bus,
    /// Segment register and descriptor activity.
    Segment,
    /// Interrupts, faults, and exception escalation.
    Interrupt,
    /// TSS task switches.
    Task,
    /// Unimplemented features and stubs.
    Stub,
}

const CATEGORY_COUNT: usize = 6;

impl LogCategory {
    fn index(self) -> usize {
        match self {
            LogCategory::Cpu => 0,
            LogCategory::Bus => 1,
            LogCategory::Segment => 2,
            LogCategory::Interrupt => 3,
            LogCategory::Task => 4,
            LogCategory::Stub => 5,
        }
    }
}

/// Sliding one-second window limiting output per category: timestamps of
/// recent lines are kept per category and evicted as they age out, so the
/// cap applies to any one-second span rather than to fixed wall-clock
/// buckets.
struct RateLimiter {
    max_per_second: AtomicUsize,
    window: Duration,
    windows: Mutex<[Window; CATEGORY_COUNT]>,
}

#[derive(Default)]
struct Window {
    stamps: VecDeque<Instant>,
    dropped: usize,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            window: Duration::from_secs(1),
            windows: Mutex::new(std::array::from_fn(|_| Window::default())),
        }
    }

    /// Returns (allowed, dropped-count-to-report).
    fn admit(&self, category: LogCategory) -> (bool, usize) {
        let now = Instant::now();
        let max = self.max_per_second.load(Ordering::Relaxed);
        let mut windows = self.windows.lock().unwrap();
        let w = &mut windows[category.index()];

        // Evict timestamps that have slid out of the window.
        while let Some(&front) = w.stamps.front() {
            if now.duration_since(front) > self.window {
                w.stamps.pop_front();
            } else {
                break;
            }
        }

        if w.stamps.len() < max {
            w.stamps.push_back(now);
            let dropped = std::mem::take(&mut w.dropped);
            (true, dropped)
        } else {
            w.dropped += 1;
            (false, 0)
        }
    }
}

/// Global logging configuration.
pub struct LogConfig {
    global_level: AtomicU8,
    category_levels: [AtomicU8; CATEGORY_COUNT],
    file_sender: Mutex<Option<Sender<String>>>,
    file_enabled: AtomicBool,
    limiter: RateLimiter,
}

impl LogConfig {
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            category_levels: Default::default(),
            file_sender: Mutex::new(None),
            file_enabled: AtomicBool::new(false),
            limiter: RateLimiter::new(60),
        }
    }

    /// Process-wide singleton.
    pub fn global() -> &'static Self {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    /// Set the level applied to categories without a specific level.
    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    /// Set a category-specific level, overriding the global one.
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.category_levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.category_levels[category.index()].load(Ordering::Relaxed))
    }

    /// True when a message at `level` should be emitted for `category`.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        let specific = self.level(category);
        if specific != LogLevel::Off {
            level <= specific
        } else {
            level <= self.global_level()
        }
    }

    /// Turn everything off.
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for lv in &self.category_levels {
            lv.store(LogLevel::Off as u8, Ordering::Relaxed);
        }
    }

    /// Cap on emitted lines per category per second.
    pub fn set_rate_limit(&self, max_per_second: usize) {
        self.limiter
            .max_per_second
            .store(max_per_second, Ordering::Relaxed);
    }

    /// Mirror output to a file through a background writer thread.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("cpu-log-writer".to_string())
            .spawn(move || {
                while let Ok(line) = receiver.recv() {
                    let _ = writeln!(file, "{}", line);
                    let _ = file.flush();
                }
                let _ = file.flush();
            })?;

        *self.file_sender.lock().unwrap() = Some(sender);
        self.file_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop mirroring to the file; the writer thread exits on its own.
    pub fn clear_log_file(&self) {
        *self.file_sender.lock().unwrap() = None;
        self.file_enabled.store(false, Ordering::Relaxed);
    }

    fn emit(&self, message: &str) {
        if self.file_enabled.load(Ordering::Relaxed) {
            let sender = self.file_sender.lock().unwrap();
            if let Some(ref s) = *sender {
                if s.send(message.to_string()).is_ok() {
                    return;
                }
            }
        }
        eprintln!("{}", message);
    }
}

/// Log a message; the closure only runs when the category/level is enabled
/// and the rate limiter admits the line.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }
    let (allowed, dropped) = config.limiter.admit(category);
    if dropped > 0 {
        config.emit(&format!(
            "[{:?}] rate limit: {} message(s) dropped in the last second",
            category, dropped
        ));
    }
    if allowed {
        config.emit(&message_fn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("bogus"), None);
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Off < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn category_overrides_global() {
        let config = LogConfig::new();
        config.set_global_level(LogLevel::Error);
        config.set_level(LogCategory::Segment, LogLevel::Debug);

        assert!(config.should_log(LogCategory::Segment, LogLevel::Debug));
        assert!(!config.should_log(LogCategory::Bus, LogLevel::Warn));
        assert!(config.should_log(LogCategory::Bus, LogLevel::Error));
    }

    #[test]
    fn rate_limiter_admits_within_budget() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            let (allowed, _) = limiter.admit(LogCategory::Cpu);
            assert!(allowed);
        }
        let (allowed, _) = limiter.admit(LogCategory::Cpu);
        assert!(!allowed);
        // An independent category still has budget.
        let (allowed, _) = limiter.admit(LogCategory::Interrupt);
        assert!(allowed);
    }

    #[test]
    fn rate_limiter_window_slides() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.admit(LogCategory::Bus).0);
        }
        assert!(!limiter.admit(LogCategory::Bus).0);

        // Wait past the window so the old timestamps age out.
        std::thread::sleep(Duration::from_millis(1100));
        let (allowed, dropped) = limiter.admit(LogCategory::Bus);
        assert!(allowed);
        assert_eq!(dropped, 1);
    }
}
