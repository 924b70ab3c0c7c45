use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Shared leadership flag handed to every component that must only act on the
/// leader (the firing loop, the write path). Dropping the last handle signals
/// the owning coordinator to shut down.
#[derive(Clone)]
pub struct LeaderHandle {
    inner: Arc<LeaderInner>,
}

struct LeaderInner {
    is_leader: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl LeaderHandle {
    pub(crate) fn new(sender: watch::Sender<bool>) -> Self {
        Self {
            inner: Arc::new(LeaderInner {
                is_leader: AtomicBool::new(false),
                shutdown: Mutex::new(Some(sender)),
            }),
        }
    }

    /// A handle that is always leader; used by single-node deployments and
    /// tests that do not start a coordinator.
    pub fn standalone() -> Self {
        let (sender, _receiver) = watch::channel(false);
        let handle = Self::new(sender);
        handle.set_leader(true);
        handle
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub(crate) fn set_leader(&self, value: bool) {
        self.inner.is_leader.store(value, Ordering::SeqCst);
    }
}

impl Drop for LeaderHandle {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        if let Ok(mut guard) = self.inner.shutdown.lock() {
            if let Some(sender) = guard.take() {
                let _ = sender.send(true);
            }
        }
        self.inner.is_leader.store(false, Ordering::SeqCst);
    }
}
