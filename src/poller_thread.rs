//! A background thread that periodically refreshes A/B metadata through the
//! core's loader and publishes new snapshots into its store.
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::ab::AbCore;

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub(crate) struct PollerThreadConfig {
    /// Interval to wait between metadata refreshes.
    pub interval: Duration,
    /// Jitter applies a randomized reduction to the wait between refreshes.
    /// This helps to avoid multiple server instances synchronizing and
    /// producing spiky network load.
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: Duration::from_secs(60),
            jitter: PollerThreadConfig::DEFAULT_JITTER,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }
}

/// The metadata refresh thread. Ticks on a (jittered) interval until a stop
/// command arrives, refreshing the core's snapshot on each tick. Refresh
/// failures are logged and retried on the next tick; they never tear the
/// thread down.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollerThread {
    pub fn start(core: Arc<AbCore>, config: PollerThreadConfig) -> std::io::Result<PollerThread> {
        // `sync_channel` makes the sender shareable between threads. A buffer
        // of one is enough: extra stop commands can be dropped.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("abflow-meta-poller".to_owned())
            .spawn(move || loop {
                let timeout = jitter(config.interval, config.jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = core.load_remote_meta() {
                            log::error!(target: "abflow", "meta refresh failed: {err}");
                        }
                    }
                    Ok(()) => {
                        log::debug!(target: "abflow", "meta poller received stop command");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        // The sending half is gone; there is nobody left to
                        // stop us, so stop ourselves.
                        log::debug!(target: "abflow", "meta poller disconnected");
                        return;
                    }
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Signal the thread to stop without waiting for it to exit.
    pub fn stop(&self) {
        // A send error means the thread already exited or a stop command is
        // already buffered; both are fine.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and block until it exits.
    pub fn shutdown(self) {
        self.stop();
        // An error here means the thread panicked; nothing useful to do.
        let _ = self.join_handle.join();
    }
}

/// Apply randomized subtractive `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
