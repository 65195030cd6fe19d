//! Process-wide shutdown request, set from SIGINT/SIGTERM.
//!
//! Signals never touch the camera directly.  A background task flips the flag
//! and the command layer checks it at safe points (between batch files, between
//! interactive commands), then closes the camera on its normal exit path.  A
//! second signal terminates immediately.

use std::sync::Arc;

use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the task that sets `flag` on SIGINT or SIGTERM.
pub fn install_signal_handlers(flag: ShutdownFlag) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        for count in 1.. {
            let name = tokio::select! {
                _ = sigint.recv()  => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if count > 1 {
                warn!("{name} received again, exiting now");
                std::process::exit(130);
            }
            info!("{name} received, stopping after the current operation");
            flag.trigger();
        }
    });
    Ok(())
}
