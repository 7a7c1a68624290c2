//! Run control flags and signal wiring.
//!
//! The scheduler never handles raw signals. Signals set atomic flags on a
//! shared [`RunControl`]; every partition polls the flags at barriers (or
//! on a coarse heartbeat in serial runs) and reacts at a safe point:
//! stop-soon winds the run down, checkpoint-soon triggers a checkpoint at
//! the next barrier, status-dump logs a one-line per-partition status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, signal-safe run control flags.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    stop: Arc<AtomicBool>,
    checkpoint: Arc<AtomicBool>,
    status: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn request_checkpoint(&self) {
        self.checkpoint.store(true, Ordering::Relaxed);
    }

    pub fn request_status(&self) {
        self.status.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Reads and clears the checkpoint request.
    pub fn take_checkpoint_request(&self) -> bool {
        self.checkpoint.swap(false, Ordering::Relaxed)
    }

    /// Reads and clears the status-dump request.
    pub fn take_status_request(&self) -> bool {
        self.status.swap(false, Ordering::Relaxed)
    }

    /// Registers unix signal handlers: SIGINT and SIGTERM request a stop,
    /// SIGALRM requests a checkpoint, SIGUSR1/SIGUSR2 request a status
    /// dump. Call once, on the main thread, before the simulation starts.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use signal_hook::consts::{SIGALRM, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
        use signal_hook::flag;

        flag::register(SIGINT, self.stop.clone())?;
        flag::register(SIGTERM, self.stop.clone())?;
        flag::register(SIGALRM, self.checkpoint.clone())?;
        flag::register(SIGUSR1, self.status.clone())?;
        flag::register(SIGUSR2, self.status.clone())?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signal handling is only supported on unix platforms",
        ))
    }
}
