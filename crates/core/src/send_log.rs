//! Append-only record of per-subscriber send attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{CampaignId, SubscriberId, UserId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendLogStatus {
    Failed,
    Successful,
}

impl SendLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendLogStatus::Failed => "failed",
            SendLogStatus::Successful => "successful",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLog {
    pub uuid: Uuid,
    pub user_id: UserId,
    pub subscriber_id: SubscriberId,
    pub campaign_id: CampaignId,
    pub status: SendLogStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl SendLog {
    pub fn failed(
        uuid: Uuid,
        user_id: UserId,
        subscriber_id: SubscriberId,
        campaign_id: CampaignId,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid,
            user_id,
            subscriber_id,
            campaign_id,
            status: SendLogStatus::Failed,
            description: description.into(),
            created_at: at,
        }
    }
}
