//! Send path shared by both ends of the bridge.
//!
//! While a link is attached, envelopes go straight to it. Otherwise they wait
//! in a memory-only FIFO queue that is drained, in order, into the next link.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc::{self, error::SendError};

use crate::protocol::Envelope;

/// Sender half of a live link.
pub type LinkSender = mpsc::UnboundedSender<Envelope>;

#[derive(Default)]
struct Inner {
    link: Option<LinkSender>,
    queue: VecDeque<Envelope>,
}

/// Outbound queue with an optional live link.
#[derive(Default)]
pub struct Outbox {
    inner: Mutex<Inner>,
}

impl Outbox {
    /// Create an empty, detached outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send now if a link is attached, otherwise queue.
    pub fn send(&self, envelope: Envelope) {
        let mut inner = self.lock();
        let envelope = match &inner.link {
            Some(link) => match link.send(envelope) {
                Ok(()) => return,
                Err(SendError(envelope)) => envelope,
            },
            None => envelope,
        };
        // A link whose receiver is gone is as good as detached.
        inner.link = None;
        tracing::debug!(kind = %envelope.kind, "[QUEUED] [>]");
        inner.queue.push_back(envelope);
    }

    /// Attach a live link, draining the queue into it first.
    ///
    /// If the link dies mid-drain the undelivered entries stay queued and the
    /// outbox stays detached.
    pub fn attach(&self, link: LinkSender) {
        let mut inner = self.lock();
        if !inner.queue.is_empty() {
            tracing::debug!("Sending {} queued bridge messages", inner.queue.len());
        }
        while let Some(envelope) = inner.queue.pop_front() {
            tracing::debug!(kind = %envelope.kind, "[FROM QUEUE] [>]");
            if let Err(SendError(envelope)) = link.send(envelope) {
                inner.queue.push_front(envelope);
                return;
            }
        }
        inner.link = Some(link);
    }

    /// Detach the live link.
    ///
    /// `unsent` is the envelope the link failed to write, if any; together
    /// with everything still buffered in `pending` it goes back to the front
    /// of the queue in submission order.
    pub fn detach(&self, unsent: Option<Envelope>, pending: &mut mpsc::UnboundedReceiver<Envelope>) {
        let mut inner = self.lock();
        inner.link = None;
        pending.close();

        let mut requeue: Vec<Envelope> = unsent.into_iter().collect();
        while let Ok(envelope) = pending.try_recv() {
            requeue.push(envelope);
        }
        for envelope in requeue.into_iter().rev() {
            inner.queue.push_front(envelope);
        }
    }

    /// Drop the queued request carrying `nonce`, if it has not been sent.
    ///
    /// Returns whether an envelope was removed.
    pub fn withdraw(&self, nonce: &str) -> bool {
        let mut inner = self.lock();
        let before = inner.queue.len();
        inner
            .queue
            .retain(|envelope| envelope.response_nonce().is_some() || envelope.nonce.as_deref() != Some(nonce));
        before != inner.queue.len()
    }

    /// Whether a live link is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Number of queued envelopes.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn note(n: u32) -> Envelope {
        Envelope::notification("note", json!({ "n": n }))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<u64> {
        let mut seen = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            seen.push(envelope.data["n"].as_u64().unwrap());
        }
        seen
    }

    #[test]
    fn test_queues_while_detached() {
        let outbox = Outbox::new();
        outbox.send(note(1));
        outbox.send(note(2));
        assert_eq!(outbox.queued(), 2);
        assert!(!outbox.is_attached());
    }

    #[test]
    fn test_attach_drains_in_order_then_sends_live() {
        let outbox = Outbox::new();
        for n in 1..=3 {
            outbox.send(note(n));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        outbox.send(note(4));

        assert_eq!(drain(&mut rx), vec![1, 2, 3, 4]);
        assert_eq!(outbox.queued(), 0);
        assert!(outbox.is_attached());
    }

    #[test]
    fn test_dead_link_keeps_queue() {
        let outbox = Outbox::new();
        outbox.send(note(1));
        outbox.send(note(2));

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        outbox.attach(tx);

        assert!(!outbox.is_attached());
        assert_eq!(outbox.queued(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        assert_eq!(drain(&mut rx), vec![1, 2]);
    }

    #[test]
    fn test_withdraw_removes_only_the_queued_request() {
        let outbox = Outbox::new();
        outbox.send(Envelope::request("n1", "requestLogin", json!({})));
        outbox.send(Envelope::response("n1", json!({})));
        outbox.send(note(1));

        assert!(outbox.withdraw("n1"));
        assert!(!outbox.withdraw("n1"));
        assert_eq!(outbox.queued(), 2);
    }

    #[test]
    fn test_detach_requeues_unwritten_ahead_of_new_sends() {
        let outbox = Outbox::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        for n in 1..=3 {
            outbox.send(note(n));
        }

        // The writer took #1 off the link and failed to write it.
        let in_flight = rx.try_recv().ok();
        outbox.detach(in_flight, &mut rx);
        outbox.send(note(4));
        assert_eq!(outbox.queued(), 4);

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        assert_eq!(drain(&mut rx), vec![1, 2, 3, 4]);
    }
}
