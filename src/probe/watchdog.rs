//! One-shot timer that fires a callback unless disarmed first

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Armed alarm. Dropping or disarming it cancels the callback.
pub struct Watchdog {
    disarm: mpsc::Sender<()>,
}

impl Watchdog {
    /// Run `on_fire` on a timer thread after `timeout`, unless disarmed first
    pub fn arm<F>(timeout: Duration, on_fire: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (disarm, rx) = mpsc::channel::<()>();
        thread::Builder::new()
            .name("probe-watchdog".to_string())
            .spawn(move || match rx.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Watchdog fired after {:?}", timeout);
                    on_fire();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Watchdog disarmed");
                }
            })?;
        Ok(Self { disarm })
    }

    pub fn disarm(self) {
        // Fails only when the timer thread already fired
        let _ = self.disarm.send(());
    }
}
