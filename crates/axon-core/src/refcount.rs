//! Reference counts whose holders can be waited out

use tokio::sync::watch;

/// Count of external holders with an awaitable drain to zero
///
/// Backed by a `watch` channel so that [`RefCount::wait_drained`] sleeps
/// until the last [`RefCount::put`] instead of polling.
#[derive(Debug)]
pub struct RefCount {
    tx: watch::Sender<usize>,
}

impl RefCount {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Take one reference
    pub fn get(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    /// Drop one reference
    pub fn put(&self) {
        self.tx.send_modify(|count| {
            debug_assert!(*count > 0, "reference count underflow");
            *count = count.saturating_sub(1);
        });
    }

    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until every holder has called [`RefCount::put`]
    pub async fn wait_drained(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}
