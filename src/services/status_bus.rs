//! Level-triggered broadcast of processing file status changes.
//!
//! Publishers bump a shared generation counter and never block. A
//! subscriber only learns that *something* changed since it last looked;
//! several publishes in between collapse into one wake-up, so readers are
//! expected to re-read the full listing instead of trusting the payload.

use std::sync::Arc;

use tokio::sync::watch;

/// Snapshot of the bus at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusChange {
    /// Number of publishes since the bus was created.
    pub generation: u64,
    /// File that triggered the most recent publish.
    pub last_file_id: Option<i32>,
}

#[derive(Clone)]
pub struct StatusBus {
    sender: Arc<watch::Sender<StatusChange>>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(StatusChange::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Wakes every current subscriber. Returns immediately.
    pub fn publish(&self, file_id: i32) {
        // send_modify stores the value even when nobody is listening
        self.sender.send_modify(|change| {
            change.generation += 1;
            change.last_file_id = Some(file_id);
        });
        tracing::debug!(file_id, "Status change published");
    }

    /// Subscribes starting from the current state: earlier publishes are not replayed.
    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn current(&self) -> StatusChange {
        *self.sender.borrow()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StatusSubscription {
    receiver: watch::Receiver<StatusChange>,
}

impl StatusSubscription {
    /// Marks everything published so far as seen.
    ///
    /// Call this before reading state so a publish that lands during the
    /// read still wakes the next `changed()`.
    pub fn mark_seen(&mut self) -> StatusChange {
        *self.receiver.borrow_and_update()
    }

    /// Suspends until a publish happens that has not been seen yet.
    ///
    /// Returns `None` once the bus itself is gone.
    pub async fn changed(&mut self) -> Option<StatusChange> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }
}
