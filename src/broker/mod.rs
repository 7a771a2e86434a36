//! Embedded subject-based publish/subscribe broker
//!
//! In-process fan-out with `*`/`>` wildcard subscriptions plus a loopback
//! TCP listener ([`BrokerServer`]) so external analytics workers can join
//! as clients. Publishing is non-blocking and best-effort: a subscriber
//! whose queue is full has the message dropped and the `slow_consumers`
//! counter incremented. No persistence, no replay.

mod client;
mod proto;
mod server;
pub mod subject;

pub use client::{BrokerClient, ClientSubscription};
pub use server::BrokerServer;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default maximum payload: large enough for a base64 JPEG frame envelope.
pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Queue depth per subscription before the drop policy kicks in.
const SUBSCRIPTION_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("payload of {0} bytes exceeds maximum of {1}")]
    PayloadTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker connection closed")]
    Closed,
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
}

struct SubEntry {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Message>,
}

struct BrokerInner {
    max_payload: usize,
    subs: RwLock<Vec<SubEntry>>,
    next_sid: AtomicU64,
    msgs_in: AtomicU64,
    msgs_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    slow_consumers: AtomicU64,
    clients: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub msgs_in: u64,
    pub msgs_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub slow_consumers: u64,
    pub subscriptions: u64,
    pub clients: u64,
}

/// Handle to the embedded broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                max_payload,
                subs: RwLock::new(Vec::new()),
                next_sid: AtomicU64::new(1),
                msgs_in: AtomicU64::new(0),
                msgs_out: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                slow_consumers: AtomicU64::new(0),
                clients: AtomicU64::new(0),
            }),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.inner.max_payload
    }

    /// Publishes to all current subscribers of `subject`. Non-blocking;
    /// subscribers that cannot keep up lose the message.
    pub fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        if !subject::valid_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        if payload.len() > self.inner.max_payload {
            return Err(BrokerError::PayloadTooLarge(
                payload.len(),
                self.inner.max_payload,
            ));
        }

        self.inner.msgs_in.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_in
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let mut dead = false;
        {
            let subs = self.inner.subs.read();
            for entry in subs.iter() {
                if !subject::matches(&entry.pattern, subject) {
                    continue;
                }
                let msg = Message {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                };
                match entry.tx.try_send(msg) {
                    Ok(()) => {
                        self.inner.msgs_out.fetch_add(1, Ordering::Relaxed);
                        self.inner
                            .bytes_out
                            .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.slow_consumers.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead = true;
                    }
                }
            }
        }

        if dead {
            self.inner.subs.write().retain(|e| !e.tx.is_closed());
        }
        Ok(())
    }

    /// Registers a subscription for `pattern` and returns its receiving
    /// half. The subscription is removed when the handle is dropped.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        if !subject::valid_pattern(pattern) {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let id = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().push(SubEntry {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            msgs_in: self.inner.msgs_in.load(Ordering::Relaxed),
            msgs_out: self.inner.msgs_out.load(Ordering::Relaxed),
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            slow_consumers: self.inner.slow_consumers.load(Ordering::Relaxed),
            subscriptions: self.inner.subs.read().len() as u64,
            clients: self.inner.clients.load(Ordering::Relaxed),
        }
    }

    fn client_connected(&self) {
        self.inner.clients.fetch_add(1, Ordering::Relaxed);
    }

    fn client_disconnected(&self) {
        self.inner.clients.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Receiving half of an in-process subscription.
pub struct Subscription {
    id: u64,
    pattern: String,
    rx: mpsc::Receiver<Message>,
    inner: Arc<BrokerInner>,
}

impl Subscription {
    /// Awaits the next message. Returns `None` once the broker is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by synchronous callers.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.subs.write().retain(|e| e.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = Broker::default();
        let mut frames = broker.subscribe("frames.*").unwrap();
        let mut all = broker.subscribe(">").unwrap();
        let mut other = broker.subscribe("events.>").unwrap();

        broker
            .publish("frames.cam_01", Bytes::from_static(b"jpeg"))
            .unwrap();

        assert_eq!(frames.next().await.unwrap().subject, "frames.cam_01");
        assert_eq!(all.next().await.unwrap().subject, "frames.cam_01");
        assert!(other.try_next().is_none());
    }

    #[tokio::test]
    async fn test_per_subject_order_preserved() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("frames.cam_01").unwrap();

        for i in 0..10u8 {
            broker
                .publish("frames.cam_01", Bytes::from(vec![i]))
                .unwrap();
        }
        for i in 0..10u8 {
            let msg = sub.next().await.unwrap();
            assert_eq!(msg.payload[0], i);
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_with_counter() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("frames.cam_01").unwrap();

        for _ in 0..(SUBSCRIPTION_DEPTH + 5) {
            broker
                .publish("frames.cam_01", Bytes::from_static(b"x"))
                .unwrap();
        }

        assert_eq!(broker.stats().slow_consumers, 5);

        // The queued prefix is still delivered in order.
        let mut received = 0;
        while sub.try_next().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIPTION_DEPTH);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let broker = Broker::default();
        let sub = broker.subscribe("frames.*").unwrap();
        assert_eq!(broker.stats().subscriptions, 1);
        drop(sub);
        assert_eq!(broker.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_payload_cap_enforced() {
        let broker = Broker::new(8);
        let err = broker
            .publish("a.b", Bytes::from(vec![0u8; 9]))
            .unwrap_err();
        assert!(matches!(err, BrokerError::PayloadTooLarge(9, 8)));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let broker = Broker::default();
        broker.publish("a.b", Bytes::from_static(b"early")).unwrap();
        let mut sub = broker.subscribe("a.b").unwrap();
        assert!(sub.try_next().is_none());
    }
}
