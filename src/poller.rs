//! A background thread that periodically reloads the configuration from the
//! server.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc},
    time::Duration,
};

use crate::{
    client::ConfigurationUpdater, protocol::ConfigurationLoadType, Error, Result,
};

/// Default interval between configuration polls.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Lower bound on the poll interval; configured values below it are clamped
/// up.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// A configuration poller thread.
///
/// Each cycle waits for the configured interval and then runs one
/// fetch-and-offer pass. The interval is measured from the end of one cycle
/// to the start of the next, so slow fetches drift the schedule rather than
/// overlap it. A failed fetch skips the cycle and never terminates the loop.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollerThread {
    /// Start the poller thread.
    ///
    /// The first configuration load is performed synchronously during client
    /// construction; the thread only handles steady-state reloads, so its
    /// first fetch happens one interval from now.
    pub fn start(
        updater: Arc<ConfigurationUpdater>,
        interval: Duration,
    ) -> std::io::Result<PollerThread> {
        let interval = effective_interval(interval);

        // Using `sync_channel` as it makes `stop_sender` `Sync`. Buffer size
        // of 1 is enough: `try_send()` on a full buffer means another thread
        // has sent a stop command already.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("appflags-poller".to_owned())
            .spawn(move || loop {
                match stop_receiver.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        log::debug!(target: "appflags", "triggering periodic configuration reload");
                        if let Err(err) =
                            updater.reload(ConfigurationLoadType::PeriodicReload, None)
                        {
                            // Skip this cycle; the next one proceeds normally.
                            log::warn!(target: "appflags", "periodic configuration reload failed: {:?}", err);
                        }
                    }
                    Ok(()) => {
                        log::debug!(target: "appflags", "poller thread received stop command");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        // When the other end of channel disconnects, calls to
                        // .recv_timeout() return immediately. Stop the thread.
                        log::debug!(target: "appflags", "poller thread received disconnected");
                        return;
                    }
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the poller thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means the receiver was dropped (thread exited) or the buffer
        // is full (a stop command is already pending). Both can be ignored.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        // Error means that the thread has panicked and there's nothing useful
        // we can do in that case.
        self.join_handle
            .join()
            .map_err(|_| Error::BackgroundThreadPanicked)?;

        Ok(())
    }
}

/// Clamp the configured poll interval to the floor.
fn effective_interval(requested: Duration) -> Duration {
    if requested < MIN_POLL_INTERVAL {
        log::info!(target: "appflags",
            "poll interval {requested:?} is below the {MIN_POLL_INTERVAL:?} floor, clamping up");
        MIN_POLL_INTERVAL
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{effective_interval, MIN_POLL_INTERVAL};

    #[test]
    fn interval_below_floor_is_clamped_up() {
        assert_eq!(
            effective_interval(Duration::from_secs(1)),
            MIN_POLL_INTERVAL
        );
        assert_eq!(effective_interval(Duration::ZERO), MIN_POLL_INTERVAL);
    }

    #[test]
    fn interval_at_or_above_floor_is_honored() {
        assert_eq!(effective_interval(MIN_POLL_INTERVAL), MIN_POLL_INTERVAL);
        assert_eq!(
            effective_interval(Duration::from_secs(15 * 60)),
            Duration::from_secs(15 * 60)
        );
    }
}
