//! Network reachability oracle.
//!
//! An injected dependency rather than process-wide state: the application
//! owns a [`Reachability`] driver, feeds it transitions from whatever
//! platform notifier it has, and hands clonable [`ReachabilityHandle`]s to
//! the pieces that need to observe them. Connect attempts block on
//! [`ReachabilityHandle::await_up`]; the socket force-closes its transport
//! when a `down` edge arrives.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Driver half: whatever watches the platform network calls [`set_up`].
///
/// [`set_up`]: Reachability::set_up
pub struct Reachability {
    tx: watch::Sender<bool>,
}

impl Reachability {
    pub fn new(initially_up: bool) -> Self {
        let (tx, _) = watch::channel(initially_up);
        Self { tx }
    }

    /// Records a transition. Edges are deduplicated: publishing the current
    /// state is a no-op. Returns whether a transition was recorded.
    pub fn set_up(&self, up: bool) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == up {
                false
            } else {
                *state = up;
                true
            }
        });
        if changed {
            debug!(up, "reachability changed");
        }
        changed
    }

    pub fn is_up(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new observer of this oracle.
    pub fn handle(&self) -> ReachabilityHandle {
        ReachabilityHandle {
            rx: self.tx.subscribe(),
            _pinned: None,
        }
    }
}

/// Observer half. Clones observe the same oracle independently; each clone
/// tracks its own "seen" position, so no waiter misses an edge that happens
/// after it started waiting.
#[derive(Clone)]
pub struct ReachabilityHandle {
    rx: watch::Receiver<bool>,
    // Keeps a driverless handle's channel open.
    _pinned: Option<Arc<watch::Sender<bool>>>,
}

impl ReachabilityHandle {
    /// A handle pinned to `up`, for applications without a platform notifier.
    pub fn always_up() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            rx,
            _pinned: Some(Arc::new(tx)),
        }
    }

    pub fn is_up(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when reachability is up: immediately if it already is,
    /// otherwise on the next `up` edge. If the driver is gone while down,
    /// no edge can ever arrive; this resolves anyway so callers degrade to
    /// plain (failing) connect attempts instead of hanging.
    pub async fn await_up(&mut self) {
        if self.rx.wait_for(|up| *up).await.is_err() {
            debug!("reachability driver gone; proceeding without gate");
        }
    }

    /// Observes the next edge and returns the new state, or `None` once the
    /// driver is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn edges_are_deduplicated() {
        let oracle = Reachability::new(false);
        assert!(oracle.set_up(true));
        assert!(!oracle.set_up(true));
        assert!(oracle.set_up(false));
        assert!(!oracle.set_up(false));
    }

    #[tokio::test]
    async fn await_up_is_immediate_when_up() {
        let oracle = Reachability::new(true);
        let mut handle = oracle.handle();
        tokio::time::timeout(Duration::from_secs(1), handle.await_up())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn await_up_releases_waiters_on_up_edge() {
        let oracle = Reachability::new(false);
        let mut a = oracle.handle();
        let mut b = oracle.handle();

        let wa = tokio::spawn(async move { a.await_up().await });
        let wb = tokio::spawn(async move { b.await_up().await });
        tokio::task::yield_now().await;

        oracle.set_up(true);
        tokio::time::timeout(Duration::from_secs(1), async {
            wa.await.unwrap();
            wb.await.unwrap();
        })
        .await
        .expect("waiters released");
    }

    #[tokio::test]
    async fn changed_observes_down_edge() {
        let oracle = Reachability::new(true);
        let mut handle = oracle.handle();
        let watcher = tokio::spawn(async move { handle.changed().await });
        tokio::task::yield_now().await;

        oracle.set_up(false);
        let edge = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("edge observed")
            .unwrap();
        assert_eq!(edge, Some(false));
    }

    #[tokio::test]
    async fn always_up_never_blocks() {
        let mut handle = ReachabilityHandle::always_up();
        assert!(handle.is_up());
        handle.await_up().await;
    }

    #[tokio::test]
    async fn await_up_resolves_when_driver_dropped_while_down() {
        let oracle = Reachability::new(false);
        let mut handle = oracle.handle();
        drop(oracle);
        tokio::time::timeout(Duration::from_secs(1), handle.await_up())
            .await
            .expect("should degrade instead of hanging");
    }
}
