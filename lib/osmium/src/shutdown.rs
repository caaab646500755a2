use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Process-wide cooperative stop flag. Waiting threads use `sleep` so the flag
/// cuts pauses short instead of letting housekeepers finish their full interval.
pub struct Shutdown {
    flag: AtomicBool,
    lock: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            flag: AtomicBool::new(false),
            lock: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut stopped = self.lock.lock().expect("shutdown lock poisoned");
        *stopped = true;
        self.signal.notify_all();
    }

    /// Sleeps for the given duration. Returns true when the pause was cut short
    /// (or skipped) because shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let stopped = self.lock.lock().expect("shutdown lock poisoned");
        let (stopped, _) = self
            .signal
            .wait_timeout_while(stopped, duration, |stopped| !*stopped)
            .expect("shutdown lock poisoned");
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_sleep_runs_out() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep(Duration::from_millis(10)));
        assert!(!shutdown.is_set());
    }

    #[test]
    fn test_set_interrupts_sleep() {
        let shutdown = Arc::new(Shutdown::new());
        let remote = shutdown.clone();

        let waiter = thread::spawn(move || {
            let started = Instant::now();
            assert!(remote.sleep(Duration::from_secs(30)));
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        shutdown.set();

        let elapsed = waiter.join().unwrap();
        assert!(elapsed < Duration::from_secs(5));
        assert!(shutdown.is_set());
    }

    #[test]
    fn test_sleep_after_set_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.set();
        assert!(shutdown.sleep(Duration::from_secs(30)));
    }
}
