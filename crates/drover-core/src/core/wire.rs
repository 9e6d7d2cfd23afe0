//! One-directional event bus ("wire") and the approval round-trip.
//!
//! A single run loop produces [`WireMessage`]s; any number of consumers
//! subscribe. High-volume deltas are sent best-effort (a slow consumer drops
//! them rather than blocking the run); everything else awaits delivery.
//! Subscribers may request pre-merged delivery, which coalesces consecutive
//! compatible content events into fewer, coarser ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use crate::core::events::{ApprovalDecision, ApprovalRequest, WireMessage};

/// Default subscriber channel capacity.
///
/// Set high enough (128) to accommodate best-effort delta sends without
/// dropping under normal consumption.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An approval forwarded from a tool, awaiting a decision.
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub respond: oneshot::Sender<ApprovalDecision>,
}

/// Cloneable handle tools use to ask for approval.
///
/// The run loop owns the receiving end and relays requests onto the wire.
/// Nested (subagent) runs must be handed a clone of the root route so
/// approvals reach the root wire instead of opening a second channel.
#[derive(Clone)]
pub struct ApprovalRoute {
    tx: mpsc::Sender<PendingApproval>,
}

impl ApprovalRoute {
    /// Creates a route and the receiver the relay task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Requests approval and waits for the decision.
    ///
    /// Resolves to `Reject` when the run side is gone, so no tool ever hangs.
    pub async fn request(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (respond, rx) = oneshot::channel();
        if self
            .tx
            .send(PendingApproval { request, respond })
            .await
            .is_err()
        {
            return ApprovalDecision::Reject;
        }
        rx.await.unwrap_or(ApprovalDecision::Reject)
    }
}

/// Single-producer, multi-consumer broadcast bus.
#[derive(Default)]
pub struct Wire {
    subscribers: Mutex<Vec<mpsc::Sender<Arc<WireMessage>>>>,
    approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    closed: AtomicBool,
}

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new consumer. With `merge_deltas`, consecutive compatible
    /// content events are delivered pre-merged.
    pub fn subscribe(&self, merge_deltas: bool) -> WireReceiver {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        lock(&self.subscribers).push(tx);
        WireReceiver {
            rx,
            pending: None,
            merge_deltas,
        }
    }

    /// Reliable send: awaits delivery to every live subscriber.
    pub async fn publish(&self, message: WireMessage) {
        let message = Arc::new(message);
        let senders: Vec<_> = lock(&self.subscribers).clone();
        let mut saw_closed = false;
        for tx in &senders {
            if tx.send(Arc::clone(&message)).await.is_err() {
                saw_closed = true;
            }
        }
        if saw_closed {
            lock(&self.subscribers).retain(|tx| !tx.is_closed());
        }
    }

    /// Best-effort send: never awaits, drops for full consumers. Use for
    /// high-volume deltas that can afford loss. Closed consumers are pruned.
    pub fn publish_delta(&self, message: WireMessage) {
        let message = Arc::new(message);
        lock(&self.subscribers).retain(|tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Registers an approval slot, emits `ApprovalRequested`, and returns the
    /// receiver the relay blocks on. On a torn-down bus the receiver resolves
    /// `Reject` immediately.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(ApprovalDecision::Reject);
            return rx;
        }
        lock(&self.approvals).insert(request.id.clone(), tx);
        self.publish(WireMessage::ApprovalRequested { request }).await;
        rx
    }

    /// Resolves an outstanding approval by id. The slot is settable exactly
    /// once; returns `false` for unknown or already-resolved ids.
    pub fn resolve_approval(&self, id: &str, decision: ApprovalDecision) -> bool {
        match lock(&self.approvals).remove(id) {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Number of approvals awaiting resolution.
    pub fn pending_approvals(&self) -> usize {
        lock(&self.approvals).len()
    }

    /// Tears the bus down: every outstanding approval resolves as `Reject`
    /// and subsequent requests reject immediately, so no caller hangs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, tx) in lock(&self.approvals).drain() {
            let _ = tx.send(ApprovalDecision::Reject);
        }
        lock(&self.subscribers).clear();
    }
}

/// Receiving side of one wire subscription.
pub struct WireReceiver {
    rx: mpsc::Receiver<Arc<WireMessage>>,
    /// Next message stashed by a merge pass.
    pending: Option<Arc<WireMessage>>,
    merge_deltas: bool,
}

impl WireReceiver {
    /// Receives the next event, blocking until one arrives or the producer
    /// side is gone.
    pub async fn recv(&mut self) -> Option<Arc<WireMessage>> {
        let first = match self.pending.take() {
            Some(message) => message,
            None => self.rx.recv().await?,
        };

        if !self.merge_deltas {
            return Some(first);
        }
        let mut merged = match &*first {
            WireMessage::TextDelta { .. } | WireMessage::ThinkingDelta { .. } => (*first).clone(),
            _ => return Some(first),
        };
        loop {
            match self.rx.try_recv() {
                Ok(next) => {
                    if !merged.merge_delta(&next) {
                        self.pending = Some(next);
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        Some(Arc::new(merged))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn text_delta(text: &str) -> WireMessage {
        WireMessage::TextDelta {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let wire = Wire::new();
        let mut a = wire.subscribe(false);
        let mut b = wire.subscribe(false);

        wire.publish(WireMessage::StepStarted { step: 1 }).await;

        for rx in [&mut a, &mut b] {
            let msg = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(&*msg, WireMessage::StepStarted { step: 1 }));
        }
    }

    #[tokio::test]
    async fn test_publish_delta_never_blocks_on_full_consumer() {
        let wire = Wire::new();
        let _rx = wire.subscribe(false);

        // Far beyond the channel capacity; must not deadlock.
        for i in 0..(DEFAULT_CHANNEL_CAPACITY * 4) {
            wire.publish_delta(text_delta(&format!("chunk {i}")));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let wire = Wire::new();
        let dead = wire.subscribe(false);
        drop(dead);
        let mut live = wire.subscribe(false);

        wire.publish_delta(text_delta("x"));
        wire.publish(WireMessage::StepStarted { step: 1 }).await;

        // Both events still reach the live subscriber.
        assert!(matches!(
            &*live.recv().await.unwrap(),
            WireMessage::TextDelta { .. }
        ));
        assert!(matches!(
            &*live.recv().await.unwrap(),
            WireMessage::StepStarted { .. }
        ));
    }

    #[tokio::test]
    async fn test_merged_delivery_coalesces_consecutive_deltas() {
        let wire = Wire::new();
        let mut rx = wire.subscribe(true);

        wire.publish(text_delta("4")).await;
        wire.publish(text_delta(" is")).await;
        wire.publish(text_delta(" the answer")).await;
        wire.publish(WireMessage::StepStarted { step: 2 }).await;

        let merged = rx.recv().await.unwrap();
        assert!(
            matches!(&*merged, WireMessage::TextDelta { text } if text == "4 is the answer")
        );
        let next = rx.recv().await.unwrap();
        assert!(matches!(&*next, WireMessage::StepStarted { step: 2 }));
    }

    #[tokio::test]
    async fn test_merged_delivery_keeps_incompatible_runs_apart() {
        let wire = Wire::new();
        let mut rx = wire.subscribe(true);

        wire.publish(WireMessage::ThinkingDelta {
            text: "mull ".to_string(),
        })
        .await;
        wire.publish(WireMessage::ThinkingDelta {
            text: "it over".to_string(),
        })
        .await;
        wire.publish(text_delta("done")).await;

        let thinking = rx.recv().await.unwrap();
        assert!(
            matches!(&*thinking, WireMessage::ThinkingDelta { text } if text == "mull it over")
        );
        let text = rx.recv().await.unwrap();
        assert!(matches!(&*text, WireMessage::TextDelta { text } if text == "done"));
    }

    #[tokio::test]
    async fn test_approval_resolves_exactly_once() {
        let wire = Wire::new();
        let mut rx = wire.subscribe(false);

        let request = ApprovalRequest::new("bash:ls", "List files", "bash");
        let id = request.id.clone();
        let decision_rx = wire.request_approval(request).await;

        // The request is observable on the wire.
        let msg = rx.recv().await.unwrap();
        assert!(matches!(&*msg, WireMessage::ApprovalRequested { .. }));

        assert!(wire.resolve_approval(&id, ApprovalDecision::Approve));
        assert!(!wire.resolve_approval(&id, ApprovalDecision::Reject));
        assert_eq!(decision_rx.await.unwrap(), ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_and_future_requests() {
        let wire = Wire::new();
        let pending = wire
            .request_approval(ApprovalRequest::new("a", "b", "c"))
            .await;
        wire.close();
        assert_eq!(pending.await.unwrap(), ApprovalDecision::Reject);

        let after = wire
            .request_approval(ApprovalRequest::new("d", "e", "f"))
            .await;
        assert_eq!(after.await.unwrap(), ApprovalDecision::Reject);
        assert_eq!(wire.pending_approvals(), 0);
    }

    #[tokio::test]
    async fn test_approval_route_rejects_when_relay_gone() {
        let (route, rx) = ApprovalRoute::channel(4);
        drop(rx);
        let decision = route.request(ApprovalRequest::new("a", "b", "c")).await;
        assert_eq!(decision, ApprovalDecision::Reject);
    }
}
