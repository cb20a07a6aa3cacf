//! Send-now path: publish a dispatch message for a draft campaign.

use tracing::{error, info, info_span};

use campaigner_core::{CampaignId, CampaignStatus, DispatchMessage, ScheduleId, SegmentId, TemplateData, UserId};
use campaigner_events::Publisher;

use crate::store::CampaignStore;
use crate::tracking::TrackingProbe;

use super::prepare::{DispatchRequest, SkipReason, prepare_dispatch};

/// What to send and to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub from_name: String,
    /// Sender address; combined with `from_name` into the `From` header.
    pub source: String,
    pub segment_ids: Vec<SegmentId>,
    pub template_data: TemplateData,
}

/// Starts a draft campaign immediately.
///
/// Runs the same checks as a scheduled start but expects `draft` and leaves
/// the status alone: the consumer moves the campaign to `sending` when it
/// picks the message up.
#[derive(Debug, Clone)]
pub struct CampaignLauncher<S, P, T> {
    store: S,
    publisher: P,
    probe: T,
    topic: String,
}

impl<S, P, T> CampaignLauncher<S, P, T>
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

    pub fn start(&self, request: LaunchRequest) -> Result<DispatchMessage, SkipReason> {
        let span = info_span!(
            "launch",
            campaign_id = %request.campaign_id,
            user_id = %request.user_id
        );
        let _guard = span.enter();

        let prepared = prepare_dispatch(
            &self.store,
            &self.probe,
            DispatchRequest {
                event_id: ScheduleId::new(),
                campaign_id: request.campaign_id,
                user_id: request.user_id,
                expected_status: CampaignStatus::Draft,
                from_name: &request.from_name,
                source: &request.source,
                template_data: Ok(request.template_data.clone()),
                segment_ids: Ok(request.segment_ids.clone()),
            },
        )
        .inspect_err(|reason| error!(reason = %reason, "campaign not launched"))?;

        self.publisher
            .publish(&self.topic, &prepared.payload)
            .map_err(SkipReason::Publish)
            .inspect_err(|reason| error!(reason = %reason, "campaign not launched"))?;

        info!(segment_ids = ?prepared.message.segment_ids, "campaign launched");
        Ok(prepared.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use campaigner_core::{Campaign, Segment, SesKeys, Template, TemplateId, User};
    use campaigner_events::InMemoryQueue;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::store::InMemoryCampaignStore;
    use crate::tracking::StaticTrackingProbe;

    fn store_with(status: CampaignStatus) -> Arc<InMemoryCampaignStore> {
        let store = InMemoryCampaignStore::arc();
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
            name: "plain".into(),
            subject_part: "Hello".into(),
            html_part: "<p>Hello</p>".into(),
            text_part: "Hello".into(),
        });
        store.insert_ses_keys(SesKeys {
            user_id: user,
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: "eu-west-1".into(),
        });
        store.insert_segment(Segment {
            id: SegmentId::new(3),
            user_id: user,
            name: "vip".into(),
        });
        store.insert_campaign(
            Campaign::new(CampaignId::new(9), user, "now", TemplateId::new(1), Utc::now())
                .with_status(status),
        );
        store
    }

    fn request() -> LaunchRequest {
        LaunchRequest {
            campaign_id: CampaignId::new(9),
            user_id: UserId::new(1),
            from_name: "Badger".into(),
            source: "hi@example.com".into(),
            segment_ids: vec![SegmentId::new(3)],
            template_data: TemplateData::new(),
        }
    }

    #[test]
    fn publishes_and_leaves_draft_untouched() {
        let store = store_with(CampaignStatus::Draft);
        let queue = Arc::new(InMemoryQueue::new());
        let launcher =
            CampaignLauncher::new(store.clone(), queue.clone(), StaticTrackingProbe(false), "campaigner");

        let msg = launcher.start(request()).unwrap();
        assert_eq!(msg.segment_ids, vec![SegmentId::new(3)]);
        assert!(!msg.configuration_set_exists);
        assert_eq!(queue.published("campaigner").len(), 1);
        assert_eq!(
            store.campaign(CampaignId::new(9)).unwrap().status,
            CampaignStatus::Draft
        );
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn refuses_campaign_that_is_not_draft() {
        let store = store_with(CampaignStatus::Sent);
        let queue = Arc::new(InMemoryQueue::new());
        let launcher = CampaignLauncher::new(store, queue.clone(), StaticTrackingProbe(false), "campaigner");

        assert_eq!(
            launcher.start(request()),
            Err(SkipReason::Status {
                expected: CampaignStatus::Draft,
                found: CampaignStatus::Sent,
            })
        );
        assert!(queue.published("campaigner").is_empty());
    }
}
