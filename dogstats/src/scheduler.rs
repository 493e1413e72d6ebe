use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tokio::sync::Notify;

/// Runs an action on a dedicated worker thread every `interval` until
/// stopped.
///
/// The wait between invocations is interruptible: a stop signal (or the
/// handle being dropped, which disconnects the channel) short-circuits the
/// wait instead of letting the full interval elapse. The worker is never
/// joined, so it cannot keep the process alive past the end of `main`, and
/// stopping before the first tick cancels it cleanly.
pub(crate) struct PeriodicTimer {
    shutdown: Sender<()>,
}

impl PeriodicTimer {
    pub fn spawn<F>(interval: Duration, mut action: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown, signal) = bounded::<()>(1);

        thread::Builder::new().name("dogstats-flush".to_string()).spawn(move || loop {
            match signal.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => action(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;

        Ok(PeriodicTimer { shutdown })
    }

    /// Signals the worker to exit without waiting for it.
    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }
}

/// Cooperative flavor of [`PeriodicTimer`]: an asynchronous task on the
/// ambient tokio runtime that loops sleep-then-act, yielding to the runtime
/// between cycles.
pub(crate) struct CooperativeTask {
    shutdown: Arc<Notify>,
}

impl CooperativeTask {
    pub fn spawn<F>(runtime: &tokio::runtime::Handle, interval: Duration, mut action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        runtime.spawn(async move {
            loop {
                // A stop signal raced against the sleep; a signal sent before
                // the task is first polled is held as a permit, so stopping
                // before the first tick cancels cleanly here too.
                match tokio::time::timeout(interval, stop.notified()).await {
                    Ok(()) => break,
                    Err(_elapsed) => action(),
                }
            }
        });

        CooperativeTask { shutdown }
    }

    /// Signals the task to exit without waiting for it.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

/// Handle to whichever flush scheduler the client started.
pub(crate) enum FlushScheduler {
    Thread(PeriodicTimer),
    Cooperative(CooperativeTask),
}

impl FlushScheduler {
    pub fn stop(&self) {
        match self {
            FlushScheduler::Thread(timer) => timer.stop(),
            FlushScheduler::Cooperative(task) => task.stop(),
        }
    }
}
