//! Campaign and the records a dispatch needs to resolve around it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainResult;
use crate::id::{CampaignId, SegmentId, TemplateId, UserId};
use crate::status::CampaignStatus;

/// A bulk email campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    pub status: CampaignStatus,
    pub template_id: TemplateId,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new draft campaign.
    pub fn new(
        id: CampaignId,
        user_id: UserId,
        name: impl Into<String>,
        template_id: TemplateId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            name: name.into(),
            status: CampaignStatus::Draft,
            template_id,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: CampaignStatus) -> Self {
        self.status = status;
        self
    }

    /// Move to `next`, rejecting moves the transition table does not allow.
    ///
    /// Entering `sending` stamps `started_at`; entering `sent` stamps `completed_at`.
    pub fn transition(&mut self, next: CampaignStatus, at: DateTime<Utc>) -> DomainResult<()> {
        self.status.check_transition(next)?;
        match next {
            CampaignStatus::Sending => self.started_at = Some(at),
            CampaignStatus::Sent => self.completed_at = Some(at),
            _ => {}
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}

/// Account owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub uuid: Uuid,
    pub username: String,
    pub active: bool,
}

/// Sender credentials for the owner's SES account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SesKeys {
    pub user_id: UserId,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl core::fmt::Debug for SesKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SesKeys")
            .field("user_id", &self.user_id)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// A named grouping of subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub user_id: UserId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;

    fn campaign() -> Campaign {
        Campaign::new(
            CampaignId::new(1),
            UserId::new(1),
            "launch",
            TemplateId::new(1),
            Utc::now(),
        )
    }

    #[test]
    fn sending_stamps_start_and_sent_stamps_completion() {
        let mut c = campaign();
        let started = Utc::now();
        c.transition(CampaignStatus::Sending, started).unwrap();
        assert_eq!(c.started_at, Some(started));
        assert_eq!(c.completed_at, None);

        let done = started + chrono::Duration::seconds(5);
        c.transition(CampaignStatus::Sent, done).unwrap();
        assert_eq!(c.status, CampaignStatus::Sent);
        assert_eq!(c.completed_at, Some(done));
    }

    #[test]
    fn illegal_transition_leaves_campaign_untouched() {
        let mut c = campaign().with_status(CampaignStatus::Sent);
        let before = c.clone();
        let err = c.transition(CampaignStatus::Sending, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(c, before);
    }

    #[test]
    fn ses_keys_debug_hides_secret() {
        let keys = SesKeys {
            user_id: UserId::new(1),
            access_key: "AKIA".into(),
            secret_key: "very-secret".into(),
            region: "eu-west-1".into(),
        };
        let debug = format!("{keys:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("AKIA"));
    }
}
