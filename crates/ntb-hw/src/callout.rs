//! Deferred-work timers.
//!
//! One worker thread per device runs every timer callback, so timer
//! callbacks are serialized with each other — re-arming from inside a
//! callback is safe and is how both periodic polling and bounded retry are
//! expressed. `drain` gives the synchronous stop-and-wait needed by
//! callback unregistration and device teardown; it must not be called from
//! timer context.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type WorkFn = Box<dyn FnMut() + Send>;

struct Entry {
    work: Arc<Mutex<WorkFn>>,
    deadline: Option<Instant>,
    running: bool,
}

#[derive(Default)]
struct WheelState {
    entries: HashMap<u64, Entry>,
    next_id: u64,
    shutdown: bool,
}

struct WheelShared {
    state: Mutex<WheelState>,
    cv: Condvar,
}

/// Timer wheel owning the worker thread. Dropping it stops the thread
/// after the in-flight callback (if any) finishes.
pub(crate) struct TimerWheel {
    shared: Arc<WheelShared>,
    worker: Option<JoinHandle<()>>,
}

impl TimerWheel {
    pub(crate) fn new(name: &str) -> Self {
        let shared = Arc::new(WheelShared {
            state: Mutex::new(WheelState::default()),
            cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || run_wheel(&worker_shared))
            .expect("spawn timer thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Register a new callout. It stays idle until the first `reset`.
    pub(crate) fn callout(&self, work: impl FnMut() + Send + 'static) -> Callout {
        let mut st = self.shared.state.lock().unwrap();
        let id = st.next_id;
        st.next_id += 1;
        st.entries.insert(
            id,
            Entry {
                work: Arc::new(Mutex::new(Box::new(work))),
                deadline: None,
                running: false,
            },
        );
        Callout {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel").finish_non_exhaustive()
    }
}

fn run_wheel(shared: &WheelShared) {
    let mut st = shared.state.lock().unwrap();
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        let due = st
            .entries
            .iter()
            .filter_map(|(id, e)| e.deadline.map(|d| (d, *id)))
            .min();
        match due {
            Some((deadline, id)) if deadline <= now => {
                let entry = st.entries.get_mut(&id).expect("callout entry");
                entry.deadline = None;
                entry.running = true;
                let work = Arc::clone(&entry.work);
                drop(st);
                {
                    let mut f = work.lock().unwrap();
                    (*f)();
                }
                st = shared.state.lock().unwrap();
                if let Some(entry) = st.entries.get_mut(&id) {
                    entry.running = false;
                }
                shared.cv.notify_all();
            }
            Some((deadline, _)) => {
                let timeout = deadline.saturating_duration_since(now);
                st = shared.cv.wait_timeout(st, timeout).unwrap().0;
            }
            None => {
                st = shared.cv.wait(st).unwrap();
            }
        }
    }
}

/// Handle to one registered callout. Cloning yields another handle to the
/// same timer; the underlying entry lives as long as the wheel.
#[derive(Clone)]
pub(crate) struct Callout {
    shared: Arc<WheelShared>,
    id: u64,
}

impl Callout {
    /// Schedule (or reschedule) the callback to run after `delay`.
    pub(crate) fn reset(&self, delay: Duration) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(entry) = st.entries.get_mut(&self.id) {
            entry.deadline = Some(Instant::now() + delay);
        }
        self.shared.cv.notify_all();
    }

    /// Cancel a pending run. An in-flight callback keeps running.
    pub(crate) fn stop(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(entry) = st.entries.get_mut(&self.id) {
            entry.deadline = None;
        }
    }

    /// Cancel and wait for any in-flight callback to finish. After this
    /// returns the callback will not run again until the next `reset`,
    /// even if the in-flight run re-armed itself.
    pub(crate) fn drain(&self) {
        let mut st = self.shared.state.lock().unwrap();
        loop {
            let Some(entry) = st.entries.get_mut(&self.id) else {
                return;
            };
            entry.deadline = None;
            if !entry.running {
                return;
            }
            st = self.shared.cv.wait(st).unwrap();
        }
    }
}

impl std::fmt::Debug for Callout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callout").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fires_after_reset() {
        let wheel = TimerWheel::new("test");
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let callout = wheel.callout(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        callout.reset(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_until_first_reset() {
        let wheel = TimerWheel::new("test");
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _callout = wheel.callout(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_from_callback() {
        let wheel = TimerWheel::new("test");
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let slot: Arc<Mutex<Option<Callout>>> = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let callout = wheel.callout(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            if n < 4 {
                if let Some(me) = s.lock().unwrap().as_ref() {
                    me.reset(Duration::ZERO);
                }
            }
        });
        *slot.lock().unwrap() = Some(callout.clone());
        callout.reset(Duration::ZERO);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn drain_blocks_out_rearm() {
        let wheel = TimerWheel::new("test");
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let slot: Arc<Mutex<Option<Callout>>> = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let callout = wheel.callout(move || {
            c.fetch_add(1, Ordering::SeqCst);
            // Always re-arm; only drain can break the cycle.
            if let Some(me) = s.lock().unwrap().as_ref() {
                me.reset(Duration::ZERO);
            }
        });
        *slot.lock().unwrap() = Some(callout.clone());
        callout.reset(Duration::ZERO);
        thread::sleep(Duration::from_millis(20));
        callout.drain();
        let settled = count.load(Ordering::SeqCst);
        assert!(settled > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn stop_cancels_pending() {
        let wheel = TimerWheel::new("test");
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let callout = wheel.callout(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        callout.reset(Duration::from_millis(200));
        callout.stop();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
