//! Scheduled campaign dispatch.
//!
//! A [`Scheduler`] run is a single-shot batch: it scans due schedules and, for
//! each candidate in turn, publishes a [`DispatchMessage`] and then flips the
//! campaign `scheduled → sending`. Candidates fail independently; nothing is
//! retried inside a run because the next tick re-discovers campaigns that are
//! still `scheduled`.
//!
//! [`DispatchMessage`]: campaigner_core::DispatchMessage

mod launcher;
mod prepare;
mod schedules;

pub use launcher::{CampaignLauncher, LaunchRequest};
pub use prepare::SkipReason;
pub use schedules::{ScheduleError, ScheduleRequest, ScheduleService};

use chrono::{DateTime, Utc};
use tracing::{error, info, info_span, warn};

use campaigner_core::{CampaignId, CampaignSchedule, CampaignStatus};
use campaigner_events::Publisher;

use crate::store::{CampaignStore, StoreError};
use crate::tracking::TrackingProbe;

use prepare::{DispatchRequest, prepare_dispatch};

/// Result of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Number of due schedules found.
    pub due: usize,
    /// Campaigns published and moved to `sending`.
    pub dispatched: Vec<CampaignId>,
    /// Campaigns not started, with the reason.
    pub skipped: Vec<(CampaignId, SkipReason)>,
}

impl SchedulerReport {
    /// Campaigns whose message went out but whose status write failed.
    pub fn unconfirmed(&self) -> Vec<CampaignId> {
        self.skipped
            .iter()
            .filter(|(_, reason)| matches!(reason, SkipReason::StatusUpdate(_)))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Scans due schedules and hands each valid campaign to the dispatch queue.
#[derive(Debug, Clone)]
pub struct Scheduler<S, P, T> {
    store: S,
    publisher: P,
    probe: T,
    topic: String,
}

impl<S, P, T> Scheduler<S, P, T>
where
    S: CampaignStore,
    P: Publisher,
    T: TrackingProbe,
{
    pub fn new(store: S, publisher: P, probe: T, topic: impl Into<String>) -> Self {
        Self {
            store,
            publisher,
            probe,
            topic: topic.into(),
        }
    }

    /// Run one scan at `now`.
    ///
    /// Only a failure to list the due schedules is returned as an error;
    /// per-candidate failures end up in the report.
    pub fn run(&self, now: DateTime<Utc>) -> Result<SchedulerReport, StoreError> {
        let schedules = self.store.get_scheduled_campaigns(now).map_err(|e| {
            error!(error = %e, "failed to get scheduled campaigns");
            e
        })?;

        let mut report = SchedulerReport {
            due: schedules.len(),
            ..SchedulerReport::default()
        };

        for schedule in &schedules {
            let span = info_span!(
                "schedule",
                campaign_id = %schedule.campaign_id,
                user_id = %schedule.user_id
            );
            let _guard = span.enter();

            match self.start(schedule, now) {
                Ok(()) => report.dispatched.push(schedule.campaign_id),
                Err(reason) => {
                    if reason.is_warning() {
                        warn!(reason = %reason, "campaign skipped");
                    } else {
                        error!(reason = %reason, "campaign skipped");
                    }
                    report.skipped.push((schedule.campaign_id, reason));
                }
            }
        }

        info!(
            due = report.due,
            dispatched = report.dispatched.len(),
            skipped = report.skipped.len(),
            "scheduler run finished"
        );
        Ok(report)
    }

    fn start(&self, schedule: &CampaignSchedule, now: DateTime<Utc>) -> Result<(), SkipReason> {
        let prepared = prepare_dispatch(
            &self.store,
            &self.probe,
            DispatchRequest {
                event_id: schedule.id,
                campaign_id: schedule.campaign_id,
                user_id: schedule.user_id,
                expected_status: CampaignStatus::Scheduled,
                from_name: &schedule.from_name,
                source: &schedule.source,
                template_data: schedule.template_data(),
                segment_ids: schedule.segment_ids(),
            },
        )?;

        self.publisher
            .publish(&self.topic, &prepared.payload)
            .map_err(SkipReason::Publish)?;

        // Published; from here on a failure leaves the message in flight.
        let mut campaign = prepared.campaign;
        campaign
            .transition(CampaignStatus::Sending, now)
            .map_err(|e| SkipReason::StatusUpdate(StoreError::Storage(e.to_string())))?;
        self.store
            .compare_and_set_campaign(&campaign, CampaignStatus::Scheduled)
            .map_err(SkipReason::StatusUpdate)?;

        if let Err(e) = self.store.delete_campaign_schedule(schedule.campaign_id) {
            warn!(error = %e, "failed to delete campaign schedule");
        }

        info!(
            segment_ids = ?prepared.message.segment_ids,
            event_id = %prepared.message.event_id,
            "campaign dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use campaigner_core::{
        Campaign, DispatchMessage, Segment, SegmentId, SesKeys, Template, TemplateData,
        TemplateId, User, UserId,
    };
    use campaigner_events::InMemoryQueue;
    use chrono::Duration;
    use uuid::Uuid;

    use crate::store::InMemoryCampaignStore;
    use crate::tracking::StaticTrackingProbe;

    const TOPIC: &str = "campaigner";

    fn seed(store: &InMemoryCampaignStore, campaign_id: i64, status: CampaignStatus, now: DateTime<Utc>) {
        let user = UserId::new(1);
        store.insert_user(User {
            id: user,
            uuid: Uuid::new_v4(),
            username: "badger".into(),
            active: true,
        });
        store.insert_template(Template {
            id: TemplateId::new(1),
            user_id: user,
            name: "news".into(),
            subject_part: "Hi {{name}}".into(),
            html_part: "<p>{{discount}}</p>".into(),
            text_part: "{{discount}}".into(),
        });
        store.insert_ses_keys(SesKeys {
            user_id: user,
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: "eu-west-1".into(),
        });
        store.insert_segment(Segment {
            id: SegmentId::new(1),
            user_id: user,
            name: "all".into(),
        });
        store.insert_campaign(
            Campaign::new(
                CampaignId::new(campaign_id),
                user,
                "launch",
                TemplateId::new(1),
                now,
            )
            .with_status(status),
        );

        let mut data = TemplateData::new();
        data.insert("name".into(), "friend".into());
        data.insert("discount".into(), "10%".into());
        store.insert_schedule(
            CampaignSchedule::new(
                CampaignId::new(campaign_id),
                user,
                now - Duration::minutes(1),
                "Badger",
                "news@example.com",
                &[SegmentId::new(1)],
                &data,
                now,
            )
            .unwrap(),
        );
    }

    fn scheduler(
        store: &Arc<InMemoryCampaignStore>,
        queue: &Arc<InMemoryQueue>,
    ) -> Scheduler<Arc<InMemoryCampaignStore>, Arc<InMemoryQueue>, StaticTrackingProbe> {
        Scheduler::new(store.clone(), queue.clone(), StaticTrackingProbe(true), TOPIC)
    }

    #[test]
    fn dispatches_due_campaign_and_marks_it_sending() {
        let store = InMemoryCampaignStore::arc();
        let queue = Arc::new(InMemoryQueue::new());
        let now = Utc::now();
        seed(&store, 1, CampaignStatus::Scheduled, now);

        let report = scheduler(&store, &queue).run(now).unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched, vec![CampaignId::new(1)]);

        let published = queue.published(TOPIC);
        assert_eq!(published.len(), 1);
        let msg = DispatchMessage::from_bytes(&published[0]).unwrap();
        assert_eq!(msg.campaign_id, CampaignId::new(1));
        assert_eq!(msg.source, "Badger <news@example.com>");
        assert!(msg.configuration_set_exists);

        let campaign = store.campaign(CampaignId::new(1)).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sending);
        assert_eq!(campaign.started_at, Some(now));
        assert_eq!(store.schedule_count(), 0);
    }

    #[test]
    fn draft_campaign_with_due_schedule_is_skipped_with_warning() {
        let store = InMemoryCampaignStore::arc();
        let queue = Arc::new(InMemoryQueue::new());
        let now = Utc::now();
        seed(&store, 1, CampaignStatus::Draft, now);

        let report = scheduler(&store, &queue).run(now).unwrap();
        assert_eq!(report.due, 1);
        assert!(report.dispatched.is_empty());
        let (_, reason) = &report.skipped[0];
        assert!(reason.is_warning());
        assert!(queue.published(TOPIC).is_empty());
    }

    #[test]
    fn missing_segments_skip_only_that_candidate() {
        let store = InMemoryCampaignStore::arc();
        let queue = Arc::new(InMemoryQueue::new());
        let now = Utc::now();
        seed(&store, 1, CampaignStatus::Scheduled, now);
        seed(&store, 2, CampaignStatus::Scheduled, now);

        let mut broken = store
            .get_campaign_schedule(CampaignId::new(1))
            .unwrap()
            .unwrap();
        broken.segment_ids_json = "[404]".into();
        store.insert_schedule(broken);

        let report = scheduler(&store, &queue).run(now).unwrap();
        assert_eq!(report.dispatched, vec![CampaignId::new(2)]);
        assert_eq!(
            report.skipped,
            vec![(
                CampaignId::new(1),
                SkipReason::NoSegments(vec![SegmentId::new(404)])
            )]
        );
        assert_eq!(queue.published(TOPIC).len(), 1);
    }

    #[test]
    fn incomplete_default_data_is_rejected() {
        let store = InMemoryCampaignStore::arc();
        let queue = Arc::new(InMemoryQueue::new());
        let now = Utc::now();
        seed(&store, 1, CampaignStatus::Scheduled, now);

        let mut schedule = store
            .get_campaign_schedule(CampaignId::new(1))
            .unwrap()
            .unwrap();
        schedule.default_template_data_json = r#"{"name":"friend"}"#.into();
        store.insert_schedule(schedule);

        let report = scheduler(&store, &queue).run(now).unwrap();
        assert!(matches!(
            report.skipped[0].1,
            SkipReason::TemplateData(_)
        ));
        assert_eq!(
            store.campaign(CampaignId::new(1)).unwrap().status,
            CampaignStatus::Scheduled
        );
    }

    #[test]
    fn listing_failure_is_returned() {
        struct Broken;
        impl CampaignStore for Broken {
            fn get_scheduled_campaigns(
                &self,
                _now: DateTime<Utc>,
            ) -> Result<Vec<CampaignSchedule>, StoreError> {
                Err(StoreError::Storage("down".into()))
            }
            fn get_user(&self, _: UserId) -> Result<User, StoreError> {
                unreachable!()
            }
            fn get_campaign(&self, _: CampaignId, _: UserId) -> Result<Campaign, StoreError> {
                unreachable!()
            }
            fn get_template(&self, _: TemplateId, _: UserId) -> Result<Template, StoreError> {
                unreachable!()
            }
            fn get_ses_keys(&self, _: UserId) -> Result<SesKeys, StoreError> {
                unreachable!()
            }
            fn get_segments_by_ids(
                &self,
                _: UserId,
                _: &[SegmentId],
            ) -> Result<Vec<Segment>, StoreError> {
                unreachable!()
            }
            fn get_distinct_subscribers_by_segment_ids(
                &self,
                _: &crate::store::SubscriberQuery,
                _: Option<campaigner_core::SubscriberCursor>,
                _: usize,
            ) -> Result<Vec<campaigner_core::Subscriber>, StoreError> {
                unreachable!()
            }
            fn update_campaign(&self, _: &Campaign) -> Result<(), StoreError> {
                unreachable!()
            }
            fn compare_and_set_campaign(
                &self,
                _: &Campaign,
                _: CampaignStatus,
            ) -> Result<(), StoreError> {
                unreachable!()
            }
            fn create_send_log(&self, _: &campaigner_core::SendLog) -> Result<(), StoreError> {
                unreachable!()
            }
            fn create_campaign_schedule(&self, _: &CampaignSchedule) -> Result<(), StoreError> {
                unreachable!()
            }
            fn delete_campaign_schedule(&self, _: CampaignId) -> Result<(), StoreError> {
                unreachable!()
            }
            fn get_campaign_schedule(
                &self,
                _: CampaignId,
            ) -> Result<Option<CampaignSchedule>, StoreError> {
                unreachable!()
            }
        }

        let queue = Arc::new(InMemoryQueue::new());
        let scheduler = Scheduler::new(Broken, queue, StaticTrackingProbe(false), TOPIC);
        assert_eq!(
            scheduler.run(Utc::now()),
            Err(StoreError::Storage("down".into()))
        );
    }
}
