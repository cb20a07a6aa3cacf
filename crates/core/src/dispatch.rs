//! Queue payloads: the campaign dispatch snapshot and per-subscriber send parameters.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::SesKeys;
use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, ScheduleId, SegmentId, SubscriberId, UserId};
use crate::subscriber::Subscriber;
use crate::template::{RenderedTemplate, TemplateData};

/// Instruction for a worker to send one campaign.
///
/// Immutable snapshot taken when the campaign is started. The Consumer never
/// re-reads the schedule row (it may already be gone), so everything needed to
/// finish the send lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub event_id: ScheduleId,
    pub campaign_id: CampaignId,
    #[serde(default)]
    pub segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub template_data: TemplateData,
    /// Composed `From` header, `Name <address>`.
    pub source: String,
    pub user_id: UserId,
    pub user_uuid: Uuid,
    /// Whether a delivery-tracking configuration set was found when the message was built.
    pub configuration_set_exists: bool,
    pub ses_keys: SesKeys,
}

impl DispatchMessage {
    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DomainError::validation(format!("dispatch message: {e}")))
    }

    /// Decode a queue payload. Empty bodies are rejected explicitly.
    pub fn from_bytes(payload: &[u8]) -> DomainResult<Self> {
        if payload.is_empty() {
            return Err(DomainError::validation("empty dispatch message"));
        }
        serde_json::from_slice(payload)
            .map_err(|e| DomainError::validation(format!("malformed dispatch message: {e}")))
    }
}

/// `"Name <address>"`.
pub fn compose_source(from_name: &str, address: &str) -> String {
    format!("{} <{}>", from_name, address)
}

/// Everything the downstream sender needs to email one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailParams {
    pub uuid: Uuid,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub user_uuid: Uuid,
    pub subscriber_id: SubscriberId,
    pub subscriber_email: String,
    pub source: String,
    pub template_data: TemplateData,
    pub html_part: String,
    pub subject_part: String,
    pub text_part: String,
    pub configuration_set_exists: bool,
    pub ses_keys: SesKeys,
}

impl SendEmailParams {
    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DomainError::validation(format!("send email params: {e}")))
    }
}

/// Assemble the send parameters for one subscriber.
///
/// The subscriber's own data (name and metadata) is layered over the
/// campaign's default template data.
pub fn prepare_subscriber_email(
    subscriber: &Subscriber,
    uuid: Uuid,
    msg: &DispatchMessage,
    campaign_id: CampaignId,
    template: &RenderedTemplate,
) -> DomainResult<SendEmailParams> {
    if !looks_like_email(&subscriber.email) {
        return Err(DomainError::validation(format!(
            "subscriber {} has an invalid email address '{}'",
            subscriber.id, subscriber.email
        )));
    }

    let mut template_data = msg.template_data.clone();
    template_data.extend(subscriber.template_data());

    Ok(SendEmailParams {
        uuid,
        campaign_id,
        user_id: msg.user_id,
        user_uuid: msg.user_uuid,
        subscriber_id: subscriber.id,
        subscriber_email: subscriber.email.clone(),
        source: msg.source.clone(),
        template_data,
        html_part: template.html_part.clone(),
        subject_part: template.subject_part.clone(),
        text_part: template.text_part.clone(),
        configuration_set_exists: msg.configuration_set_exists,
        ses_keys: msg.ses_keys.clone(),
    })
}

fn looks_like_email(email: &str) -> bool {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@') && domain.contains('.')
        }
        None => false,
    }
}
