//! Phase signals for barrage.
//!
//! A barrage run moves through two one-way phases per task: a virtual user
//! is retired as the load profile steps down, and eventually the whole run
//! shuts down. Each is a one-shot event modeled here as a [`Broadcaster`] and
//! its single [`Watcher`].
//!
//! A `Broadcaster` fires exactly once, when signaled or dropped.
//! [`Broadcaster::signal_and_wait`] additionally blocks until its `Watcher`
//! has observed the signal or been dropped, which is how the run lets
//! in-flight work drain before exiting.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The broadcast channel is never sent on. Dropping the sender closes the
    // channel and the receiver observes the close.
    let (sender, receiver) = broadcast::channel(1);
    let watching = Arc::new(AtomicBool::new(true));
    let notify = Arc::new(Notify::new());

    let watcher = Watcher {
        watching: Arc::clone(&watching),
        receiver,
        notify: Arc::clone(&notify),
    };
    let broadcaster = Broadcaster {
        watching,
        sender,
        notify,
    };

    (watcher, broadcaster)
}

#[derive(Debug)]
/// The sending half of a phase signal.
pub struct Broadcaster {
    /// True while the `Watcher` is alive and has not seen the signal.
    watching: Arc<AtomicBool>,
    /// Dropped to deliver the signal.
    sender: broadcast::Sender<()>,
    /// Woken by the `Watcher` when it logs off.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Deliver the signal without waiting on the `Watcher`.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Deliver the signal and wait until the `Watcher` has received it or
    /// been dropped.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        // Register interest before reading the flag. Reading first would let
        // the watcher log off and notify in the gap, and the wakeup would be
        // lost.
        loop {
            let notified = self.notify.notified();
            if !self.watching.load(Ordering::SeqCst) {
                break;
            }
            debug!("waiting on watcher");
            notified.await;
        }
    }
}

#[derive(Debug)]
/// The receiving half of a phase signal.
pub struct Watcher {
    watching: Arc<AtomicBool>,
    receiver: broadcast::Receiver<()>,
    notify: Arc<Notify>,
}

impl Watcher {
    fn log_off(&self) {
        if self.watching.swap(false, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the signal.
    ///
    /// # Panics
    ///
    /// Panics if the underlying channel reports lag, which cannot happen
    /// since nothing is ever sent on it.
    pub async fn recv(mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => self.log_off(),
            Err(error::RecvError::Lagged(_)) => {
                panic!("phase signal channel lagged, nothing should ever be sent");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.log_off();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::signal;

    #[tokio::test]
    async fn signal_reaches_watcher() {
        let (watcher, broadcaster) = signal();
        let handle = tokio::spawn(watcher.recv());
        broadcaster.signal_and_wait().await;
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn signal_and_wait_blocks_on_live_watcher() {
        let (watcher, broadcaster) = signal();
        let wait = tokio::spawn(broadcaster.signal_and_wait());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!wait.is_finished());

        drop(watcher);
        wait.await.expect("broadcaster task panicked");
    }

    #[tokio::test]
    async fn dropped_broadcaster_fires() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("watcher never saw the signal");
    }

    #[test]
    fn signal_without_watcher() {
        let (watcher, broadcaster) = signal();
        drop(watcher);
        broadcaster.signal();
    }
}
