//! Link supervision helpers for the acquisition loop

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exponential reconnect backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Rolling count of decode errors over a time window
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    window: Duration,
    threshold: u32,
    events: VecDeque<Instant>,
}

impl ErrorWindow {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.events.push_back(now);
        self.prune(now);
    }

    /// Errors within the window ending at `now`
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }

    /// True while the count within the window is at or above the threshold
    pub fn is_degraded(&mut self, now: Instant) -> bool {
        self.count(now) >= self.threshold as usize
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Cooperative stop flag with an interruptible wait
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock() = true;
        wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for up to `timeout`; returns `true` if stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut stopped = flag.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if wake.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => wake.wait(&mut stopped),
            }
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
        let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_error_window_degrades_and_recovers() {
        let mut window = ErrorWindow::new(Duration::from_secs(1), 3);
        let start = Instant::now();
        window.record(start);
        window.record(start + Duration::from_millis(100));
        assert!(!window.is_degraded(start + Duration::from_millis(100)));

        window.record(start + Duration::from_millis(200));
        assert!(window.is_degraded(start + Duration::from_millis(200)));

        // first two errors fall out of the window
        assert!(!window.is_degraded(start + Duration::from_millis(1150)));
        assert_eq!(window.count(start + Duration::from_millis(1150)), 1);
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let stopped = remote.wait_timeout(Duration::from_secs(10));
            (stopped, started.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        signal.stop();
        let (stopped, elapsed) = waiter.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_wait_timeout_without_stop() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_unbounded_wait_ends_on_stop() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let waiter = thread::spawn(move || remote.wait_timeout(Duration::MAX));

        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(waiter.join().unwrap());
    }
}
