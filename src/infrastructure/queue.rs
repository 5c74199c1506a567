//! In-process message queue.
//!
//! A tokio mpsc channel standing in for a broker. Every settlement (ack or
//! nack) is written to a shared [`Ledger`], so callers can observe exactly
//! how each message was resolved. With redelivery enabled, a nack with
//! `requeue = true` puts the message back at the tail of the queue.

use crate::application::ports::{Delivery, MessageSource};
use crate::domain::error::BoxError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked { requeue: bool },
}

/// A resolved delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub kind: Settlement,
}

/// Append-only record of settlements, shared by a queue and its deliveries.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Arc<Mutex<Vec<Settled>>>,
}

impl Ledger {
    /// All settlements in the order they happened.
    pub fn settlements(&self) -> Vec<Settled> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn acked(&self) -> usize {
        self.count(|kind| kind == Settlement::Acked)
    }

    /// Nacks with `requeue = true`.
    pub fn requeued(&self) -> usize {
        self.count(|kind| kind == Settlement::Nacked { requeue: true })
    }

    /// Nacks with `requeue = false`.
    pub fn discarded(&self) -> usize {
        self.count(|kind| kind == Settlement::Nacked { requeue: false })
    }

    fn count(&self, pred: impl Fn(Settlement) -> bool) -> usize {
        self.lock().iter().filter(|entry| pred(entry.kind)).count()
    }

    fn record(&self, entry: Settled) {
        self.lock().push(entry);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Settled>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct Message {
    tag: u64,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

/// Error returned when publishing to a queue whose consumer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Producer side of a [`ChannelQueue`].
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Message>,
    next_tag: Arc<AtomicU64>,
}

impl ChannelPublisher {
    /// Enqueue a message, waiting for capacity. Returns its delivery tag.
    pub async fn publish(
        &self,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Result<u64, QueueClosed> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.tx
            .send(Message {
                tag,
                routing_key: routing_key.into(),
                body: body.into(),
                redelivered: false,
            })
            .await
            .map_err(|_| QueueClosed)?;
        Ok(tag)
    }
}

/// Consumer side: a [`MessageSource`] over a bounded channel.
///
/// The source ends once every [`ChannelPublisher`] has been dropped and the
/// channel is empty.
#[derive(Debug)]
pub struct ChannelQueue {
    rx: mpsc::Receiver<Message>,
    requeue_tx: mpsc::WeakSender<Message>,
    ledger: Ledger,
    redeliver: bool,
}

impl ChannelQueue {
    /// Create a queue holding at most `capacity` pending messages.
    pub fn bounded(capacity: usize) -> (ChannelPublisher, ChannelQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = ChannelQueue {
            rx,
            requeue_tx: tx.downgrade(),
            ledger: Ledger::default(),
            redeliver: false,
        };
        let publisher = ChannelPublisher {
            tx,
            next_tag: Arc::new(AtomicU64::new(0)),
        };
        (publisher, queue)
    }

    /// Put nacked-with-requeue messages back on the queue.
    ///
    /// Redelivery only works while a publisher is alive.
    pub fn with_redelivery(mut self) -> Self {
        self.redeliver = true;
        self
    }

    /// Handle to this queue's settlement record.
    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }
}

#[async_trait]
impl MessageSource for ChannelQueue {
    type Delivery = ChannelDelivery;

    async fn next_delivery(&mut self) -> Option<ChannelDelivery> {
        let message = self.rx.recv().await?;
        Some(ChannelDelivery {
            message,
            ledger: self.ledger.clone(),
            requeue_tx: self.redeliver.then(|| self.requeue_tx.clone()),
        })
    }
}

/// A message taken from a [`ChannelQueue`].
#[derive(Debug)]
pub struct ChannelDelivery {
    message: Message,
    ledger: Ledger,
    requeue_tx: Option<mpsc::WeakSender<Message>>,
}

impl ChannelDelivery {
    pub fn tag(&self) -> u64 {
        self.message.tag
    }

    /// Whether this message was requeued at least once before.
    pub fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    fn settle(&self, kind: Settlement) {
        self.ledger.record(Settled {
            tag: self.message.tag,
            routing_key: self.message.routing_key.clone(),
            body: self.message.body.clone(),
            redelivered: self.message.redelivered,
            kind,
        });
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    fn body(&self) -> &[u8] {
        &self.message.body
    }

    async fn ack(self) -> Result<(), BoxError> {
        self.settle(Settlement::Acked);
        Ok(())
    }

    async fn nack(self, requeue: bool) -> Result<(), BoxError> {
        self.settle(Settlement::Nacked { requeue });

        if !requeue {
            return Ok(());
        }
        let Some(tx) = self.requeue_tx.as_ref().and_then(mpsc::WeakSender::upgrade) else {
            return Ok(());
        };

        let mut message = self.message;
        message.redelivered = true;
        tx.send(message).await.map_err(|_| Box::new(QueueClosed) as BoxError)
    }
}
