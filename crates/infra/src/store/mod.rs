//! Campaign Store boundary.
//!
//! The pipeline never owns persisted entities; it reads and writes them
//! through this contract. Implementations must be safe to share across worker
//! threads.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCampaignStore;
pub use postgres::PostgresCampaignStore;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use campaigner_core::{
    Campaign, CampaignId, CampaignSchedule, CampaignStatus, Segment, SegmentId, SendLog, SesKeys,
    Subscriber, SubscriberCursor, Template, TemplateId, User, UserId,
};

/// Store operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// A conditional update found a different status than expected.
    #[error("status conflict: expected '{expected}', found '{found}'")]
    Conflict {
        expected: CampaignStatus,
        found: CampaignStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Filter for the distinct-subscriber scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberQuery {
    pub segment_ids: Vec<SegmentId>,
    pub user_id: UserId,
    /// Skip subscribers that are no longer active.
    pub exclude_unsubscribed: bool,
    pub exclude_blacklisted: bool,
}

pub trait CampaignStore: Send + Sync {
    /// Schedules due at `now` whose campaign is still `draft` or `scheduled`,
    /// oldest first.
    fn get_scheduled_campaigns(&self, now: DateTime<Utc>)
    -> Result<Vec<CampaignSchedule>, StoreError>;

    fn get_user(&self, user_id: UserId) -> Result<User, StoreError>;

    fn get_campaign(&self, campaign_id: CampaignId, user_id: UserId)
    -> Result<Campaign, StoreError>;

    fn get_template(&self, template_id: TemplateId, user_id: UserId)
    -> Result<Template, StoreError>;

    fn get_ses_keys(&self, user_id: UserId) -> Result<SesKeys, StoreError>;

    /// Segments owned by `user_id` among `segment_ids`; unknown ids are ignored.
    fn get_segments_by_ids(
        &self,
        user_id: UserId,
        segment_ids: &[SegmentId],
    ) -> Result<Vec<Segment>, StoreError>;

    /// One page of subscribers that belong to any of the query's segments.
    ///
    /// Rows sort by `(created_at, id)`, start strictly after `after`, and never
    /// repeat a subscriber even when it is in several of the segments.
    fn get_distinct_subscribers_by_segment_ids(
        &self,
        query: &SubscriberQuery,
        after: Option<SubscriberCursor>,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError>;

    /// Unconditional write of the campaign's mutable fields.
    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;

    /// Write the campaign only if the stored status is still `expected`.
    ///
    /// Returns `StoreError::Conflict` when another writer got there first.
    fn compare_and_set_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<(), StoreError>;

    fn create_send_log(&self, log: &SendLog) -> Result<(), StoreError>;

    /// Insert or replace the schedule for `schedule.campaign_id`.
    fn create_campaign_schedule(&self, schedule: &CampaignSchedule) -> Result<(), StoreError>;

    /// Remove the schedule for a campaign. Removing a missing schedule is not an error.
    fn delete_campaign_schedule(&self, campaign_id: CampaignId) -> Result<(), StoreError>;

    fn get_campaign_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, StoreError>;
}

impl<S> CampaignStore for Arc<S>
where
    S: CampaignStore + ?Sized,
{
    fn get_scheduled_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignSchedule>, StoreError> {
        (**self).get_scheduled_campaigns(now)
    }

    fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        (**self).get_user(user_id)
    }

    fn get_campaign(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> Result<Campaign, StoreError> {
        (**self).get_campaign(campaign_id, user_id)
    }

    fn get_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Template, StoreError> {
        (**self).get_template(template_id, user_id)
    }

    fn get_ses_keys(&self, user_id: UserId) -> Result<SesKeys, StoreError> {
        (**self).get_ses_keys(user_id)
    }

    fn get_segments_by_ids(
        &self,
        user_id: UserId,
        segment_ids: &[SegmentId],
    ) -> Result<Vec<Segment>, StoreError> {
        (**self).get_segments_by_ids(user_id, segment_ids)
    }

    fn get_distinct_subscribers_by_segment_ids(
        &self,
        query: &SubscriberQuery,
        after: Option<SubscriberCursor>,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        (**self).get_distinct_subscribers_by_segment_ids(query, after, limit)
    }

    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        (**self).update_campaign(campaign)
    }

    fn compare_and_set_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<(), StoreError> {
        (**self).compare_and_set_campaign(campaign, expected)
    }

    fn create_send_log(&self, log: &SendLog) -> Result<(), StoreError> {
        (**self).create_send_log(log)
    }

    fn create_campaign_schedule(&self, schedule: &CampaignSchedule) -> Result<(), StoreError> {
        (**self).create_campaign_schedule(schedule)
    }

    fn delete_campaign_schedule(&self, campaign_id: CampaignId) -> Result<(), StoreError> {
        (**self).delete_campaign_schedule(campaign_id)
    }

    fn get_campaign_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, StoreError> {
        (**self).get_campaign_schedule(campaign_id)
    }
}
