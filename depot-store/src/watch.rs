//! Replay-latest multicast subject.
//!
//! Wraps `tokio::sync::watch` so every consumer sees the same semantics:
//! emissions reach all current subscribers, and a new subscriber
//! immediately receives the latest value. Dropping the subject terminates
//! all subscriber streams after their final value.

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

pub(crate) struct Subject<V> {
    tx: watch::Sender<V>,
}

impl<V: Clone + Send + Sync + 'static> Subject<V> {
    pub(crate) fn new(initial: V) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the current value and notify all subscribers, even when the
    /// new value equals the old one.
    pub(crate) fn emit(&self, value: V) {
        self.tx.send_replace(value);
    }

    /// Snapshot the current value.
    pub(crate) fn get(&self) -> V {
        self.tx.borrow().clone()
    }

    /// Subscribe; the stream yields the current value first, then every
    /// subsequent emission.
    pub(crate) fn subscribe(&self) -> WatchStream<V> {
        WatchStream::new(self.tx.subscribe())
    }
}
