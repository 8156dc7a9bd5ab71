//! Change observation contract, with a polling fallback service.
//!
//! Push-based backends (local via inotify-style notification, document via
//! its provider) deliver events themselves and treat the subscribe interval
//! as a debounce window; backends with no native primitive use `PollWatch`,
//! which re-probes on the interval and fires on fingerprint change.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Callback invoked when the observed path (or its children) changed.
pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Subscription token returned by `Backend::observe`. Closing it stops
/// delivery; dropping without closing is tolerated but logged by impls that
/// hold OS resources.
pub trait WatchHandle: Send {
    fn close(&mut self);
}

// ============================================================================
// Polling fallback
// ============================================================================

/// Poll-based watch: re-evaluates a fingerprint probe every `interval` and
/// invokes the listener whenever it changes (including appearing/vanishing).
pub struct PollWatch {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollWatch {
    pub fn spawn(
        interval: Duration,
        probe: Box<dyn Fn() -> Option<String> + Send>,
        listener: ChangeListener,
    ) -> PollWatch {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            let mut last = probe();
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let current = probe();
                if current != last {
                    listener();
                    last = current;
                }
            }
        });
        PollWatch {
            stop,
            thread: Some(thread),
        }
    }
}

impl WatchHandle for PollWatch {
    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            // The poll thread exits at its next wakeup; don't block the
            // caller on the full interval.
            drop(thread);
        }
    }
}

impl Drop for PollWatch {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn poll_watch_fires_on_fingerprint_change() {
        let fingerprint = Arc::new(Mutex::new(String::from("a")));
        let fired = Arc::new(AtomicBool::new(false));

        let probe_fingerprint = Arc::clone(&fingerprint);
        let fired_flag = Arc::clone(&fired);
        let mut handle = PollWatch::spawn(
            Duration::from_millis(10),
            Box::new(move || Some(probe_fingerprint.lock().unwrap().clone())),
            Box::new(move || fired_flag.store(true, Ordering::Relaxed)),
        );

        *fingerprint.lock().unwrap() = String::from("b");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::Relaxed) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::Relaxed));
        handle.close();
    }
}
