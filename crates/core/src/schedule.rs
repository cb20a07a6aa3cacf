//! Pending campaign schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, ScheduleId, SegmentId, UserId};
use crate::template::TemplateData;

/// One-to-one with a campaign while it waits for its send time.
///
/// Segment ids and default template data are kept in their serialized JSON
/// form, as persisted; use [`CampaignSchedule::segment_ids`] and
/// [`CampaignSchedule::template_data`] to decode them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSchedule {
    pub id: ScheduleId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub scheduled_at: DateTime<Utc>,
    pub from_name: String,
    pub source: String,
    pub segment_ids_json: String,
    pub default_template_data_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignSchedule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaign_id: CampaignId,
        user_id: UserId,
        scheduled_at: DateTime<Utc>,
        from_name: impl Into<String>,
        source: impl Into<String>,
        segment_ids: &[SegmentId],
        default_template_data: &TemplateData,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let segment_ids_json = serde_json::to_string(segment_ids)
            .map_err(|e| DomainError::validation(format!("segment ids: {e}")))?;
        let default_template_data_json = serde_json::to_string(default_template_data)
            .map_err(|e| DomainError::validation(format!("default template data: {e}")))?;

        Ok(Self {
            id: ScheduleId::new(),
            campaign_id,
            user_id,
            scheduled_at,
            from_name: from_name.into(),
            source: source.into(),
            segment_ids_json,
            default_template_data_json,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Decode the target segment ids.
    pub fn segment_ids(&self) -> DomainResult<Vec<SegmentId>> {
        serde_json::from_str(&self.segment_ids_json)
            .map_err(|e| DomainError::validation(format!("malformed segment ids: {e}")))
    }

    /// Decode the default per-field template data.
    pub fn template_data(&self) -> DomainResult<TemplateData> {
        serde_json::from_str(&self.default_template_data_json)
            .map_err(|e| DomainError::validation(format!("malformed default template data: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> CampaignSchedule {
        let mut data = TemplateData::new();
        data.insert("foo".into(), "bar".into());
        CampaignSchedule::new(
            CampaignId::new(1),
            UserId::new(1),
            Utc::now(),
            "from name",
            "bla@email.com",
            &[SegmentId::new(1), SegmentId::new(2)],
            &data,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn decodes_serialized_fields() {
        let s = schedule();
        assert_eq!(s.segment_ids().unwrap(), vec![SegmentId::new(1), SegmentId::new(2)]);
        assert_eq!(s.template_data().unwrap().get("foo").map(String::as_str), Some("bar"));
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let mut s = schedule();
        s.segment_ids_json = "[1,".into();
        s.default_template_data_json = "nope".into();
        assert!(matches!(s.segment_ids(), Err(DomainError::Validation(_))));
        assert!(matches!(s.template_data(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn due_when_scheduled_at_is_not_in_the_future() {
        let s = schedule();
        assert!(s.is_due(s.scheduled_at));
        assert!(!s.is_due(s.scheduled_at - chrono::Duration::seconds(1)));
    }
}
