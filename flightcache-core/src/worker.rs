use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Stop flag for background threads that sleep between ticks.
#[derive(Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleeps up to `timeout`, returning true if the signal was raised.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}
