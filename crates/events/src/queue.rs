//! Publish/receive abstraction (mechanics only).
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a delivery that is not acknowledged becomes visible
//!   again after the backend's visibility timeout, so handlers must tolerate
//!   duplicates.
//! - **No ordering across consumers**: each delivery goes to one consumer of a
//!   group; several workers pulling from the same group see messages in no
//!   particular relative order.
//! - **Manual acknowledgment**: consumers call [`MessageQueue::ack`] once a
//!   message is fully handled (or deliberately dropped).

use std::sync::Arc;
use std::time::Duration;

/// Queue operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("queue lock poisoned")]
    Poisoned,
}

/// A message handed to one consumer of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Backend-assigned id, used to acknowledge.
    pub id: String,
    pub payload: Vec<u8>,
    /// How many times this message has been handed out (1 on first delivery).
    pub attempts: u32,
}

/// Producer side.
///
/// Implementations must be safe to share across threads; the Scheduler and
/// every Consumer worker publish through the same handle.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError>;
}

/// Consumer side, with consumer groups and manual acknowledgment.
pub trait MessageQueue: Publisher {
    /// Wait up to `timeout` for the next delivery for `group` on `topic`.
    fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery as handled; it will not be redelivered.
    fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<(), QueueError>;
}

impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError> {
        (**self).publish(topic, payload)
    }
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        (**self).receive(topic, group, timeout)
    }

    fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(topic, group, delivery)
    }
}

impl<P> Publisher for &P
where
    P: Publisher + ?Sized,
{
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError> {
        (**self).publish(topic, payload)
    }
}

impl<Q> MessageQueue for &Q
where
    Q: MessageQueue + ?Sized,
{
    fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        (**self).receive(topic, group, timeout)
    }

    fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(topic, group, delivery)
    }
}

/// A consumer's view of one topic through one group.
///
/// ```ignore
/// let sub = Subscription::new(queue.clone(), "campaigner", "campaigner");
/// loop {
///     match sub.recv_timeout(Duration::from_millis(250))? {
///         Some(delivery) => {
///             handle(&delivery.payload);
///             sub.ack(&delivery)?;
///         }
///         None => continue, // check for shutdown
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Subscription<Q> {
    queue: Q,
    topic: String,
    group: String,
}

impl<Q: MessageQueue> Subscription<Q> {
    pub fn new(queue: Q, topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
            group: group.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Block for up to `timeout` waiting for a delivery.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        self.queue.receive(&self.topic, &self.group, timeout)
    }

    pub fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.queue.ack(&self.topic, &self.group, delivery)
    }
}
