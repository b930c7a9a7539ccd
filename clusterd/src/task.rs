use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::{fmt, thread};

use tracing::warn;

/// Thread handle that joins the thread when dropped
pub struct AutoJoinHandle {
    pub(crate) join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(name: &str, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from(
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(f)
                .expect("Failed to spawn a thread"),
        )
    }

    pub fn spawn_res<F, E>(name: &str, f: F) -> Self
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: Send + fmt::Debug + 'static,
    {
        Self::spawn(name, || f().expect("Task failed"))
    }
}

impl From<JoinHandle<()>> for AutoJoinHandle {
    fn from(value: JoinHandle<()>) -> Self {
        Self {
            join_handle: Some(value),
        }
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        let join_handle = self.join_handle.take().expect("Missing join handle");
        // A panic was already reported by the `PanicGuard` of the task
        if join_handle.join().is_err() && !thread::panicking() {
            panic!("Task thread panicked");
        }
    }
}

pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Wake-up signal for a background loop
///
/// Notifications don't queue up: any number of `notify` calls
/// between two waits wake the waiter only once.
pub struct Signal {
    tx: flume::Sender<()>,
    rx: flume::Receiver<()>,
}

impl Default for Signal {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }
}

impl Signal {
    pub fn notify(&self) {
        // full means a wake-up is already pending
        let _ = self.tx.try_send(());
    }

    /// Wait until notified or `timeout` passes
    ///
    /// Returns `true` if woken by a notification.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

#[test]
fn signal_notifications_coalesce() {
    let signal = Signal::default();
    signal.notify();
    signal.notify();
    assert!(signal.wait_timeout(Duration::from_millis(1)));
    assert!(!signal.wait_timeout(Duration::from_millis(1)));
}
