//! One-shot timer contract driving the sync scheduler.
//!
//! The scheduler asks for a single callback after a delay and keeps the
//! returned [`TimerHandle`]. When the timer fires, its owner passes the
//! handle back to [`CorePlayer::on_timer`](crate::player::CorePlayer::on_timer);
//! handles that were cancelled or superseded are ignored there.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// Identifies one scheduled firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Reschedulable one-shot timer.
pub trait Timer: Send + Sync {
    /// Schedules a firing after `delay`.
    fn schedule_once(&self, delay: Duration) -> TimerHandle;

    /// Cancels a pending firing. Unknown or already fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

struct DeadlineState {
    next_id: u64,
    pending: Option<(TimerHandle, Instant)>,
}

/// Wall-clock timer for a playback thread.
///
/// Holds at most one pending deadline; scheduling replaces it. The owning
/// thread blocks in [`DeadlineTimer::wait_timeout`] and dispatches the
/// returned handle.
pub struct DeadlineTimer {
    state: Mutex<DeadlineState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            state: Mutex::new(DeadlineState {
                next_id: 0,
                pending: None,
            }),
            wake_tx,
            wake_rx,
        }
    }

    /// Blocks until the pending deadline passes or `timeout` elapses.
    ///
    /// Returns the fired handle, or `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TimerHandle> {
        let give_up = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let wake_at = {
                let mut state = self.state.lock();
                let pending = state.pending;
                match pending {
                    Some((handle, deadline)) if deadline <= now => {
                        state.pending = None;
                        return Some(handle);
                    }
                    Some((_, deadline)) => deadline.min(give_up),
                    None => give_up,
                }
            };
            if wake_at <= now {
                return None;
            }
            match self.wake_rx.recv_deadline(wake_at) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Returns true if a firing is scheduled.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

impl Default for DeadlineTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for DeadlineTimer {
    fn schedule_once(&self, delay: Duration) -> TimerHandle {
        let handle = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let handle = TimerHandle(state.next_id);
            state.pending = Some((handle, Instant::now() + delay));
            handle
        };
        self.wake();
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock();
        let pending = state.pending.map(|(pending, _)| pending);
        if pending == Some(handle) {
            state.pending = None;
            drop(state);
            self.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_deadline_fires() {
        let timer = DeadlineTimer::new();
        let handle = timer.schedule_once(Duration::from_millis(5));
        let started = Instant::now();
        assert_eq!(timer.wait_timeout(Duration::from_secs(2)), Some(handle));
        assert!(started.elapsed() >= Duration::from_millis(4));
        assert!(!timer.is_pending());
    }

    #[test]
    fn test_wait_times_out_without_deadline() {
        let timer = DeadlineTimer::new();
        assert_eq!(timer.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_cancel_and_reschedule() {
        let timer = DeadlineTimer::new();
        let first = timer.schedule_once(Duration::from_secs(60));
        timer.cancel(first);
        assert!(!timer.is_pending());

        let a = timer.schedule_once(Duration::from_secs(60));
        let b = timer.schedule_once(Duration::ZERO);
        assert_ne!(a, b);
        // Cancelling a superseded handle leaves the newer deadline alone
        timer.cancel(a);
        assert_eq!(timer.wait_timeout(Duration::from_secs(2)), Some(b));
    }

    #[test]
    fn test_reschedule_wakes_waiter() {
        let timer = Arc::new(DeadlineTimer::new());
        timer.schedule_once(Duration::from_secs(60));

        let waiter = {
            let timer = Arc::clone(&timer);
            std::thread::spawn(move || timer.wait_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        let soon = timer.schedule_once(Duration::from_millis(1));
        assert_eq!(waiter.join().unwrap(), Some(soon));
    }
}
