//! Last-resort exit timer for shutdown.
//!
//! Runs on a plain OS thread so it still fires when the async runtime is wedged.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Fires its action unless disarmed within the deadline.
///
/// Dropping the watchdog disarms it.
pub struct Watchdog {
    disarm: Option<mpsc::Sender<()>>,
}

impl Watchdog {
    /// Exit the process with status 1 once `deadline` passes.
    pub fn arm(deadline: Duration) -> Self {
        Self::with_action(deadline, || {
            error!("shutdown deadline exceeded, exiting");
            std::process::exit(1);
        })
    }

    /// Run `action` once `deadline` passes.
    pub fn with_action<F>(deadline: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("shutdown-watchdog".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(deadline) {
                    action();
                }
            });
        match spawned {
            Ok(_) => Self { disarm: Some(tx) },
            Err(e) => {
                warn!(error = %e, "could not start shutdown watchdog");
                Self { disarm: None }
            }
        }
    }

    /// Cancel the pending action.
    pub fn disarm(mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
    }
}
