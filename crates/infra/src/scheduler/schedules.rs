//! Creating and cancelling campaign schedules.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use campaigner_core::{
    CampaignId, CampaignSchedule, CampaignStatus, DomainError, SegmentId, TemplateData, UserId,
};

use crate::store::{CampaignStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub scheduled_at: DateTime<Utc>,
    pub from_name: String,
    pub source: String,
    pub segment_ids: Vec<SegmentId>,
    pub default_template_data: TemplateData,
}

/// Keeps a campaign's status and its schedule row in step.
#[derive(Debug, Clone)]
pub struct ScheduleService<S> {
    store: S,
}

impl<S: CampaignStore> ScheduleService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Schedule (or reschedule) a campaign.
    ///
    /// A `draft` campaign moves to `scheduled`; an already scheduled one only
    /// has its schedule replaced.
    #[instrument(skip_all, fields(campaign_id = %campaign_id, user_id = %user_id), err)]
    pub fn schedule(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
        request: ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<CampaignSchedule, ScheduleError> {
        let mut campaign = self.store.get_campaign(campaign_id, user_id)?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(DomainError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Scheduled,
            }
            .into());
        }
        if request.segment_ids.is_empty() {
            return Err(DomainError::validation("at least one segment is required").into());
        }
        if request.scheduled_at <= now {
            return Err(DomainError::validation("scheduled time must be in the future").into());
        }

        let template = self.store.get_template(campaign.template_id, user_id)?;
        template.validate_data(&request.default_template_data)?;

        let schedule = CampaignSchedule::new(
            campaign_id,
            user_id,
            request.scheduled_at,
            request.from_name,
            request.source,
            &request.segment_ids,
            &request.default_template_data,
            now,
        )?;

        // The status moves first so a failed write never leaves a due row
        // behind a draft campaign.
        let promoted = campaign.status == CampaignStatus::Draft;
        if promoted {
            campaign.transition(CampaignStatus::Scheduled, now)?;
            self.store
                .compare_and_set_campaign(&campaign, CampaignStatus::Draft)?;
        }

        if let Err(err) = self.store.create_campaign_schedule(&schedule) {
            if promoted {
                campaign.transition(CampaignStatus::Draft, now)?;
                if let Err(revert) = self
                    .store
                    .compare_and_set_campaign(&campaign, CampaignStatus::Scheduled)
                {
                    warn!(error = %revert, "failed to return campaign to draft");
                }
            }
            return Err(err.into());
        }

        info!(scheduled_at = %schedule.scheduled_at, "campaign scheduled");
        Ok(schedule)
    }

    /// Cancel a schedule and return the campaign to `draft`.
    ///
    /// Cancelling a campaign without a schedule is a no-op.
    #[instrument(skip_all, fields(campaign_id = %campaign_id, user_id = %user_id), err)]
    pub fn unschedule(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut campaign = self.store.get_campaign(campaign_id, user_id)?;
        self.store.delete_campaign_schedule(campaign_id)?;

        if campaign.status == CampaignStatus::Scheduled {
            campaign.transition(CampaignStatus::Draft, now)?;
            self.store
                .compare_and_set_campaign(&campaign, CampaignStatus::Scheduled)?;
            info!("campaign unscheduled");
        }
        Ok(())
    }
}
