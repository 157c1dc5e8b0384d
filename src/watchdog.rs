//! A timer thread that expects to be "kicked" periodically; if it isn't,
//! it escalates by sending itself SIGUSR2, and if that still doesn't
//! produce a kick within the timeout, SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    last_kick: Instant,
    timeout: Duration,
}

/// Runs on its own thread; `kick()` is called from the main event loop
/// whenever it's made progress, and the watchdog thread wakes up on its own
/// schedule to check how long it's been since the last kick.
pub struct Watchdog {
    inner: Mutex<Inner>,
    cv: Condvar,
    run: AtomicBool,
    stop: AtomicBool,
    escalated: AtomicBool,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Arc<Watchdog> {
        Arc::new(Watchdog {
            inner: Mutex::new(Inner { last_kick: Instant::now(), timeout }),
            cv: Condvar::new(),
            run: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            escalated: AtomicBool::new(false),
        })
    }

    pub fn kick(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_kick = Instant::now();
        self.escalated.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.timeout = timeout;
    }

    /// Releases the thread from its startup gate; used once init has
    /// finished and steady-state supervision should begin.
    pub fn start(&self) {
        self.run.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Spawns the watchdog thread. `pid` is the process to signal on
    /// escalation (normally the caller's own pid).
    pub fn spawn(self: &Arc<Self>, pid: i32) -> std::io::Result<std::thread::JoinHandle<()>> {
        let wd = Arc::clone(self);
        std::thread::Builder::new().name("watchdog".into()).spawn(move || wd.run_loop(pid))
    }

    fn run_loop(&self, pid: i32) {
        {
            let mut inner = self.inner.lock().unwrap();
            while !self.run.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire) {
                let (guard, _) = self.cv.wait_timeout(inner, Duration::from_millis(100)).unwrap();
                inner = guard;
            }
        }

        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }

            let (elapsed, timeout) = {
                let inner = self.inner.lock().unwrap();
                (inner.last_kick.elapsed(), inner.timeout)
            };

            if elapsed >= timeout {
                if !self.escalated.swap(true, Ordering::AcqRel) {
                    unsafe { libc::kill(pid, libc::SIGUSR2) };
                } else {
                    unsafe { libc::kill(pid, libc::SIGTERM) };
                }
            }

            std::thread::sleep(Duration::from_millis(100).min(timeout / 4 + Duration::from_millis(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_resets_escalation_flag() {
        let wd = Watchdog::new(Duration::from_millis(50));
        wd.escalated.store(true, Ordering::Release);
        wd.kick();
        assert!(!wd.escalated.load(Ordering::Acquire));
    }

    #[test]
    fn set_timeout_updates_inner_value() {
        let wd = Watchdog::new(Duration::from_secs(7));
        wd.set_timeout(Duration::from_millis(750));
        assert_eq!(wd.inner.lock().unwrap().timeout, Duration::from_millis(750));
    }
}
