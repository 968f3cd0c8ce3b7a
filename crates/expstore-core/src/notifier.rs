use crate::model::Id;
use tokio::sync::mpsc;

/// Receives the identity of every entry whose label state changed.
///
/// Called synchronously while the entry cache is locked, so implementations
/// must not block. Subscribers re-read current state themselves.
pub trait ChangeNotifier: Send + Sync {
    fn notify_change(&self, id: &Id);
}

/// Forwards notifications into an unbounded channel, e.g. for an indexer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Id>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Id>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn notify_change(&self, id: &Id) {
        if self.tx.send(id.clone()).is_err() {
            tracing::debug!(event = "expstore.notify.dropped", id = %id, "change subscriber is gone");
        }
    }
}
