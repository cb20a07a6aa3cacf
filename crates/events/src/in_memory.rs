//! In-memory queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::queue::{Delivery, MessageQueue, Publisher, QueueError};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_IN_FLIGHT: usize = 200;

/// In-memory queue with consumer groups.
///
/// - No IO
/// - Every group sees every message published to the topic (groups start at
///   the beginning of the topic, like a stream group created at `0`)
/// - Within a group each message goes to one receiver
/// - Unacked deliveries are redelivered after the visibility timeout
#[derive(Debug)]
pub struct InMemoryQueue {
    inner: Mutex<Topics>,
    ready: Condvar,
    visibility_timeout: Duration,
    max_in_flight: usize,
}

#[derive(Debug, Default)]
struct Topics {
    next_id: u64,
    topics: HashMap<String, TopicState>,
}

#[derive(Debug, Default)]
struct TopicState {
    log: Vec<(String, Vec<u8>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    next_offset: usize,
    redeliver: VecDeque<Delivery>,
    in_flight: HashMap<String, (Delivery, Instant)>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Every payload ever published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        let topics = match self.inner.lock() {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        topics
            .topics
            .get(topic)
            .map(|t| t.log.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of deliveries handed out to `group` and not yet acknowledged.
    pub fn in_flight(&self, topic: &str, group: &str) -> usize {
        let topics = match self.inner.lock() {
            Ok(t) => t,
            Err(_) => return 0,
        };
        topics
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.in_flight.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Topics::default()),
            ready: Condvar::new(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl Publisher for InMemoryQueue {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut topics = self.inner.lock().map_err(|_| QueueError::Poisoned)?;
        topics.next_id += 1;
        let id = format!("{}-{}", topic, topics.next_id);
        topics
            .topics
            .entry(topic.to_string())
            .or_default()
            .log
            .push((id, payload.to_vec()));
        drop(topics);

        self.ready.notify_all();
        Ok(())
    }
}

impl MessageQueue for InMemoryQueue {
    fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut topics = self.inner.lock().map_err(|_| QueueError::Poisoned)?;

        loop {
            let now = Instant::now();
            let state = topics.topics.entry(topic.to_string()).or_default();
            let log_len = state.log.len();
            let g = state.groups.entry(group.to_string()).or_default();

            // Expired deliveries become visible again.
            let expired: Vec<String> = g
                .in_flight
                .iter()
                .filter(|(_, (_, visible_at))| *visible_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some((delivery, _)) = g.in_flight.remove(&id) {
                    debug!(topic, group, delivery_id = %delivery.id, attempts = delivery.attempts, "delivery visibility expired");
                    g.redeliver.push_back(delivery);
                }
            }

            if g.in_flight.len() < self.max_in_flight {
                let next = match g.redeliver.pop_front() {
                    Some(d) => Some(d),
                    None if g.next_offset < log_len => {
                        let (id, payload) = state.log[g.next_offset].clone();
                        g.next_offset += 1;
                        Some(Delivery {
                            id,
                            payload,
                            attempts: 0,
                        })
                    }
                    None => None,
                };

                if let Some(mut delivery) = next {
                    delivery.attempts += 1;
                    g.in_flight.insert(
                        delivery.id.clone(),
                        (delivery.clone(), now + self.visibility_timeout),
                    );
                    return Ok(Some(delivery));
                }
            }

            if now >= deadline {
                return Ok(None);
            }

            // Wake up for new publishes, acks, or the earliest visibility expiry.
            let next_expiry = g.in_flight.values().map(|(_, at)| *at).min();
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));
            let wait = wake_at.saturating_duration_since(now);
            let (guard, _) = self
                .ready
                .wait_timeout(topics, wait)
                .map_err(|_| QueueError::Poisoned)?;
            topics = guard;
        }
    }

    fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut topics = self.inner.lock().map_err(|_| QueueError::Poisoned)?;
        let removed = topics
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
            .and_then(|g| g.in_flight.remove(&delivery.id));
        drop(topics);

        match removed {
            Some(_) => {
                self.ready.notify_all();
                Ok(())
            }
            None => Err(QueueError::UnknownDelivery(delivery.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Subscription;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn publish_then_receive_and_ack() {
        let q = InMemoryQueue::new();
        q.publish("t", b"one").unwrap();

        let d = q.receive("t", "g", SHORT).unwrap().unwrap();
        assert_eq!(d.payload, b"one");
        assert_eq!(d.attempts, 1);
        assert_eq!(q.in_flight("t", "g"), 1);

        q.ack("t", "g", &d).unwrap();
        assert_eq!(q.in_flight("t", "g"), 0);
        assert!(q.receive("t", "g", SHORT).unwrap().is_none());
    }

    #[test]
    fn unacked_delivery_is_redelivered_after_visibility_timeout() {
        let q = InMemoryQueue::new().with_visibility_timeout(Duration::from_millis(30));
        q.publish("t", b"one").unwrap();

        let first = q.receive("t", "g", SHORT).unwrap().unwrap();
        let again = q
            .receive("t", "g", Duration::from_millis(500))
            .unwrap()
            .unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn each_group_sees_every_message_once() {
        let q = InMemoryQueue::new();
        q.publish("t", b"a").unwrap();
        q.publish("t", b"b").unwrap();

        for group in ["g1", "g2"] {
            let sub = Subscription::new(&q, "t", group);
            let a = sub.recv_timeout(SHORT).unwrap().unwrap();
            let b = sub.recv_timeout(SHORT).unwrap().unwrap();
            sub.ack(&a).unwrap();
            sub.ack(&b).unwrap();
            assert_eq!((a.payload.as_slice(), b.payload.as_slice()), (&b"a"[..], &b"b"[..]));
            assert!(sub.recv_timeout(SHORT).unwrap().is_none());
        }
    }

    #[test]
    fn max_in_flight_bounds_outstanding_deliveries() {
        let q = InMemoryQueue::new().with_max_in_flight(1);
        q.publish("t", b"a").unwrap();
        q.publish("t", b"b").unwrap();

        let a = q.receive("t", "g", SHORT).unwrap().unwrap();
        assert!(q.receive("t", "g", SHORT).unwrap().is_none());

        q.ack("t", "g", &a).unwrap();
        let b = q.receive("t", "g", SHORT).unwrap().unwrap();
        assert_eq!(b.payload, b"b");
    }

    #[test]
    fn acking_an_unknown_delivery_fails() {
        let q = InMemoryQueue::new();
        let bogus = Delivery {
            id: "nope".into(),
            payload: vec![],
            attempts: 1,
        };
        assert_eq!(
            q.ack("t", "g", &bogus),
            Err(QueueError::UnknownDelivery("nope".into()))
        );
    }

    #[test]
    fn receive_wakes_up_on_publish_from_another_thread() {
        let q = Arc::new(InMemoryQueue::new());
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.publish("t", b"late").unwrap();
        });

        let d = q.receive("t", "g", Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(d.map(|d| d.payload), Some(b"late".to_vec()));
    }

    #[test]
    fn published_lists_payloads_in_order() {
        let q = InMemoryQueue::new();
        q.publish("t", b"1").unwrap();
        q.publish("t", b"2").unwrap();
        q.publish("other", b"x").unwrap();
        assert_eq!(q.published("t"), vec![b"1".to_vec(), b"2".to_vec()]);
        assert!(q.published("missing").is_empty());
    }
}
