//! Validation and snapshot building shared by the scheduled and send-now paths.

use thiserror::Error;

use campaigner_core::{
    Campaign, CampaignId, CampaignStatus, DomainError, DomainResult, DispatchMessage, ScheduleId,
    SegmentId, TemplateData, UserId, compose_source,
};
use campaigner_events::QueueError;

use crate::store::{CampaignStore, StoreError};
use crate::tracking::TrackingProbe;

/// Why a campaign was not started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("failed to get user: {0}")]
    User(StoreError),

    #[error("failed to get campaign: {0}")]
    Campaign(StoreError),

    #[error("campaign status is '{found}', expected '{expected}'")]
    Status {
        expected: CampaignStatus,
        found: CampaignStatus,
    },

    #[error("failed to get template: {0}")]
    Template(StoreError),

    #[error("invalid default template data: {0}")]
    TemplateData(DomainError),

    #[error("failed to get ses keys: {0}")]
    SesKeys(StoreError),

    #[error("invalid segment ids: {0}")]
    SegmentIds(DomainError),

    #[error("failed to get segments by ids: {0}")]
    Segments(StoreError),

    #[error("no segments found for ids {0:?}")]
    NoSegments(Vec<SegmentId>),

    #[error("failed to serialize dispatch message: {0}")]
    Serialize(DomainError),

    #[error("failed to publish dispatch message: {0}")]
    Publish(QueueError),

    /// The message is already on the queue but the campaign kept its old status.
    #[error("dispatch message published but campaign status was not updated: {0}")]
    StatusUpdate(StoreError),
}

impl SkipReason {
    /// Status mismatches are expected under races and only warrant a warning.
    pub fn is_warning(&self) -> bool {
        matches!(self, SkipReason::Status { .. })
    }
}

/// Inputs for building one dispatch message.
///
/// The decoded segment ids and template data are carried as results so a
/// decoding failure is reported at the same step it would be checked in.
pub(crate) struct DispatchRequest<'a> {
    pub event_id: ScheduleId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub expected_status: CampaignStatus,
    pub from_name: &'a str,
    pub source: &'a str,
    pub template_data: DomainResult<TemplateData>,
    pub segment_ids: DomainResult<Vec<SegmentId>>,
}

pub(crate) struct PreparedDispatch {
    pub campaign: Campaign,
    pub message: DispatchMessage,
    pub payload: Vec<u8>,
}

pub(crate) fn prepare_dispatch<S, T>(
    store: &S,
    probe: &T,
    request: DispatchRequest<'_>,
) -> Result<PreparedDispatch, SkipReason>
where
    S: CampaignStore + ?Sized,
    T: TrackingProbe + ?Sized,
{
    let user = store.get_user(request.user_id).map_err(SkipReason::User)?;
    let campaign = store
        .get_campaign(request.campaign_id, user.id)
        .map_err(SkipReason::Campaign)?;
    if campaign.status != request.expected_status {
        return Err(SkipReason::Status {
            expected: request.expected_status,
            found: campaign.status,
        });
    }

    let template = store
        .get_template(campaign.template_id, user.id)
        .map_err(SkipReason::Template)?;
    let template_data = request.template_data.map_err(SkipReason::TemplateData)?;
    template
        .validate_data(&template_data)
        .map_err(SkipReason::TemplateData)?;

    let ses_keys = store.get_ses_keys(user.id).map_err(SkipReason::SesKeys)?;

    let segment_ids = request.segment_ids.map_err(SkipReason::SegmentIds)?;
    let segments = store
        .get_segments_by_ids(user.id, &segment_ids)
        .map_err(SkipReason::Segments)?;
    if segments.is_empty() {
        return Err(SkipReason::NoSegments(segment_ids));
    }

    let configuration_set_exists = probe.configuration_set_exists(&ses_keys);

    let message = DispatchMessage {
        event_id: request.event_id,
        campaign_id: campaign.id,
        segment_ids,
        template_data,
        source: compose_source(request.from_name, request.source),
        user_id: user.id,
        user_uuid: user.uuid,
        configuration_set_exists,
        ses_keys,
    };
    let payload = message.to_bytes().map_err(SkipReason::Serialize)?;

    Ok(PreparedDispatch {
        campaign,
        message,
        payload,
    })
}
