//! Fixed-size pool of consumer worker threads.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use campaigner_core::Clock;
use campaigner_events::{MessageQueue, Publisher, Subscription};

use crate::store::CampaignStore;
use crate::template::TemplateRenderer;

use super::{CampaignHandler, HandleOutcome};

/// Consumer pool configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Dispatch topic to consume.
    pub topic: String,
    /// Consumer group shared by all workers.
    pub group: String,
    /// Number of worker threads
    pub concurrency: usize,
    /// How long a worker waits for a message before checking for shutdown
    pub poll_interval: Duration,
    /// Thread name prefix
    pub name: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "campaigner".to_string(),
            group: "campaigner".to_string(),
            concurrency: 20,
            poll_interval: Duration::from_millis(250),
            name: "campaigner".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>, group: impl Into<String>) -> Self {
        self.topic = topic.into();
        self.group = group.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    pub handled: u64,
    pub sent: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub aborted: u64,
    pub retried: u64,
    pub uptime_secs: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &HandleOutcome) {
        self.handled += 1;
        match outcome {
            HandleOutcome::Sent { .. } => self.sent += 1,
            HandleOutcome::TemplateFailed(_) | HandleOutcome::StatusWriteFailed { .. } => {
                self.failed += 1
            }
            HandleOutcome::Duplicate(_) => self.duplicates += 1,
            HandleOutcome::Malformed(_) | HandleOutcome::CampaignMissing => self.dropped += 1,
            HandleOutcome::Aborted { .. } => self.aborted += 1,
            HandleOutcome::Retry(_) => self.retried += 1,
        }
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current message.
    fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn join(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) {
        self.request_shutdown();
        self.join();
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct ConsumerPoolHandle {
    workers: Vec<WorkerHandle>,
    stats: Arc<Mutex<ConsumerStats>>,
    started: Instant,
}

impl ConsumerPoolHandle {
    /// Stop accepting messages and wait for in-flight handlers to finish.
    pub fn shutdown(self) -> ConsumerStats {
        for w in &self.workers {
            w.request_shutdown();
        }
        for w in self.workers {
            w.join();
        }
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> ConsumerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

/// Spawns worker threads that pull dispatch messages from a queue group and
/// run them through a shared [`CampaignHandler`].
#[derive(Debug)]
pub struct ConsumerPool;

impl ConsumerPool {
    pub fn spawn<S, P, R, C, Q>(
        handler: Arc<CampaignHandler<S, P, R, C>>,
        queue: Q,
        config: ConsumerConfig,
    ) -> io::Result<ConsumerPoolHandle>
    where
        S: CampaignStore + 'static,
        P: Publisher + 'static,
        R: TemplateRenderer + 'static,
        C: Clock + 'static,
        Q: MessageQueue + Clone + 'static,
    {
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let mut workers = Vec::with_capacity(config.concurrency);

        for n in 0..config.concurrency.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let sub = Subscription::new(queue.clone(), config.topic.clone(), config.group.clone());
            let handler = handler.clone();
            let stats = stats.clone();
            let name = format!("{}-{}", config.name, n);
            let poll = config.poll_interval;

            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, sub, shutdown_rx, &handler, &stats, poll));

            match spawned {
                Ok(join) => workers.push(WorkerHandle {
                    shutdown: shutdown_tx,
                    join: Some(join),
                }),
                Err(e) => {
                    for w in workers {
                        w.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            workers = workers.len(),
            topic = %config.topic,
            group = %config.group,
            "consumer pool started"
        );
        Ok(ConsumerPoolHandle {
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop<S, P, R, C, Q>(
    name: &str,
    sub: Subscription<Q>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &CampaignHandler<S, P, R, C>,
    stats: &Mutex<ConsumerStats>,
    poll: Duration,
) where
    S: CampaignStore,
    P: Publisher,
    R: TemplateRenderer,
    C: Clock,
    Q: MessageQueue,
{
    loop {
        // Shutdown check (non-blocking)
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let delivery = match sub.recv_timeout(poll) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => {
                error!(worker = name, error = %e, "failed to receive dispatch message");
                thread::sleep(poll);
                continue;
            }
        };

        if delivery.attempts > 1 {
            warn!(worker = name, delivery_id = %delivery.id, attempts = delivery.attempts, "redelivered dispatch message");
        }

        let outcome = handler.handle(&delivery.payload);
        stats.lock().unwrap().record(&outcome);

        if outcome.should_ack() {
            if let Err(e) = sub.ack(&delivery) {
                error!(worker = name, delivery_id = %delivery.id, error = %e, "failed to ack dispatch message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use campaigner_core::{
        Campaign, CampaignId, CampaignStatus, DispatchMessage, RenderedTemplate, ScheduleId,
        SegmentId, SesKeys, Subscriber, SubscriberId, SystemClock, TemplateId, UserId,
    };
    use campaigner_events::InMemoryQueue;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::store::InMemoryCampaignStore;
    use crate::template::TemplateError;

    struct Plain;

    impl TemplateRenderer for Plain {
        fn parse_template(
            &self,
            _: TemplateId,
            _: UserId,
        ) -> Result<RenderedTemplate, TemplateError> {
            Ok(RenderedTemplate {
                html_part: "<p>hi</p>".into(),
                text_part: "hi".into(),
                subject_part: "hi".into(),
            })
        }
    }

    fn message(campaign_id: i64) -> Vec<u8> {
        DispatchMessage {
            event_id: ScheduleId::new(),
            campaign_id: CampaignId::new(campaign_id),
            segment_ids: vec![SegmentId::new(1)],
            template_data: BTreeMap::new(),
            source: "Badger <news@example.com>".into(),
            user_id: UserId::new(1),
            user_uuid: Uuid::new_v4(),
            configuration_set_exists: false,
            ses_keys: SesKeys {
                user_id: UserId::new(1),
                access_key: "ak".into(),
                secret_key: "sk".into(),
                region: "eu-west-1".into(),
            },
        }
        .to_bytes()
        .unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for pool");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn pool_sends_campaigns_and_drops_duplicates() {
        let store = InMemoryCampaignStore::arc();
        let now = Utc::now();
        for id in 1..=4 {
            store.insert_campaign(Campaign::new(
                CampaignId::new(id),
                UserId::new(1),
                "c",
                TemplateId::new(1),
                now,
            ));
        }
        store.insert_subscriber(Subscriber {
            id: SubscriberId::new(1),
            user_id: UserId::new(1),
            name: "Jane".into(),
            email: "jane@example.com".into(),
            metadata: BTreeMap::new(),
            segment_ids: vec![SegmentId::new(1)],
            blacklisted: false,
            active: true,
            created_at: now,
            updated_at: now,
        });

        let queue = Arc::new(InMemoryQueue::new());
        let handler = Arc::new(CampaignHandler::new(
            store.clone(),
            queue.clone(),
            Plain,
            SystemClock,
            "send_email",
        ));
        let pool = ConsumerPool::spawn(
            handler,
            queue.clone(),
            ConsumerConfig::default()
                .with_concurrency(3)
                .with_poll_interval(Duration::from_millis(20)),
        )
        .unwrap();
        assert_eq!(pool.workers(), 3);

        for id in 1..=4 {
            queue.publish("campaigner", &message(id)).unwrap();
        }
        // Second copy of campaign 1.
        queue.publish("campaigner", &message(1)).unwrap();
        queue.publish("campaigner", b"").unwrap();

        wait_for(|| pool.stats().handled == 6);
        let stats = pool.shutdown();

        // The copy of campaign 1 may be handled before or after the first one.
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(queue.published("send_email").len(), 4);
        assert_eq!(queue.in_flight("campaigner", "campaigner"), 0);
        for id in 1..=4 {
            assert_eq!(
                store.campaign(CampaignId::new(id)).unwrap().status,
                CampaignStatus::Sent
            );
        }
    }

    #[test]
    fn shutdown_stops_idle_workers() {
        let store = InMemoryCampaignStore::arc();
        let queue = Arc::new(InMemoryQueue::new());
        let handler = Arc::new(CampaignHandler::new(
            store,
            queue.clone(),
            Plain,
            SystemClock,
            "send_email",
        ));
        let pool = ConsumerPool::spawn(
            handler,
            queue,
            ConsumerConfig::default()
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

        let stats = pool.shutdown();
        assert_eq!(stats.handled, 0);
    }
}
