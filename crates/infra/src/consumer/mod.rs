//! Campaign consumer: turns one dispatch message into per-subscriber sends.

mod pool;

pub use pool::{ConsumerConfig, ConsumerPool, ConsumerPoolHandle, ConsumerStats, WorkerHandle};

use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use campaigner_core::{
    Campaign, CampaignStatus, Clock, DispatchMessage, DomainError, RenderedTemplate, SendLog,
    Subscriber, SubscriberId, prepare_subscriber_email,
};
use campaigner_events::{Publisher, QueueError};

use crate::pagination::{DEFAULT_PAGE_SIZE, SubscriberPages};
use crate::store::{CampaignStore, StoreError, SubscriberQuery};
use crate::template::{TemplateError, TemplateRenderer};

/// Why a subscriber scan stopped early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    #[error("failed to fetch subscribers: {0}")]
    Fetch(StoreError),

    #[error("failed to prepare email for subscriber {subscriber_id}: {error}")]
    Prepare {
        subscriber_id: SubscriberId,
        error: DomainError,
    },

    #[error("failed to publish email for subscriber {subscriber_id}: {error}")]
    Publish {
        subscriber_id: SubscriberId,
        error: QueueError,
    },
}

/// What happened to one dispatch message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Empty or unparseable payload.
    Malformed(DomainError),
    /// The campaign no longer exists.
    CampaignMissing,
    /// The campaign had already left `draft`; the message is a duplicate.
    Duplicate(CampaignStatus),
    /// The campaign could not be read; nothing was written.
    Retry(StoreError),
    /// A status write failed; the campaign stays in `status`.
    StatusWriteFailed {
        status: CampaignStatus,
        error: StoreError,
    },
    /// The template could not be rendered; the campaign is `failed`.
    TemplateFailed(TemplateError),
    /// Every subscriber was published and the campaign is `sent`.
    Sent { published: usize },
    /// The scan stopped early; the campaign is left in `sending`.
    Aborted {
        published: usize,
        reason: AbortReason,
    },
}

impl HandleOutcome {
    /// Whether the delivery should be acknowledged.
    ///
    /// Everything is acknowledged except a failed campaign read, which is
    /// safe to see again because nothing was written yet.
    pub fn should_ack(&self) -> bool {
        !matches!(self, HandleOutcome::Retry(_))
    }
}

/// Processes dispatch messages.
///
/// Handlers share nothing mutable; concurrent duplicate deliveries are
/// serialized by the conditional `draft → sending` write in the store.
pub struct CampaignHandler<S, P, R, C> {
    store: S,
    publisher: P,
    renderer: R,
    clock: C,
    send_topic: String,
    page_size: usize,
}

impl<S, P, R, C> CampaignHandler<S, P, R, C>
where
    S: CampaignStore,
    P: Publisher,
    R: TemplateRenderer,
    C: Clock,
{
    pub fn new(store: S, publisher: P, renderer: R, clock: C, send_topic: impl Into<String>) -> Self {
        Self {
            store,
            publisher,
            renderer,
            clock,
            send_topic: send_topic.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Handle one raw queue payload.
    pub fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let msg = match DispatchMessage::from_bytes(payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!(error = %e, "dropping dispatch message");
                return HandleOutcome::Malformed(e);
            }
        };

        let span = info_span!(
            "dispatch",
            campaign_id = %msg.campaign_id,
            user_id = %msg.user_id,
            event_id = %msg.event_id,
            segment_ids = ?msg.segment_ids
        );
        let _guard = span.enter();

        self.handle_message(&msg)
    }

    fn handle_message(&self, msg: &DispatchMessage) -> HandleOutcome {
        let mut campaign = match self.store.get_campaign(msg.campaign_id, msg.user_id) {
            Ok(c) => c,
            Err(StoreError::NotFound(_)) => {
                warn!("campaign not found, dropping message");
                return HandleOutcome::CampaignMissing;
            }
            Err(e) => {
                error!(error = %e, "failed to get campaign");
                return HandleOutcome::Retry(e);
            }
        };

        if campaign.status != CampaignStatus::Draft {
            warn!(status = %campaign.status, "campaign is not a draft, dropping duplicate message");
            return HandleOutcome::Duplicate(campaign.status);
        }

        if let Err(outcome) = self.advance(&mut campaign, CampaignStatus::Sending) {
            return outcome;
        }

        let template = match self.renderer.parse_template(campaign.template_id, msg.user_id) {
            Ok(t) => t,
            Err(e) => {
                error!(template_id = %campaign.template_id, error = %e, "failed to parse template");
                if let Err(outcome) = self.advance(&mut campaign, CampaignStatus::Failed) {
                    return outcome;
                }
                return HandleOutcome::TemplateFailed(e);
            }
        };

        let mut published = 0;
        if let Err(reason) = self.send_to_subscribers(msg, &campaign, &template, &mut published) {
            error!(published, reason = %reason, "subscriber scan aborted, campaign left in sending");
            return HandleOutcome::Aborted { published, reason };
        }

        if let Err(outcome) = self.advance(&mut campaign, CampaignStatus::Sent) {
            return outcome;
        }
        info!(published, "campaign sent");
        HandleOutcome::Sent { published }
    }

    /// Transition and persist, conditional on the status the campaign was read with.
    fn advance(&self, campaign: &mut Campaign, next: CampaignStatus) -> Result<(), HandleOutcome> {
        let previous = campaign.status;
        let mut updated = campaign.clone();
        if let Err(e) = updated.transition(next, self.clock.now()) {
            error!(error = %e, "refusing campaign status change");
            return Err(HandleOutcome::StatusWriteFailed {
                status: previous,
                error: StoreError::Storage(e.to_string()),
            });
        }

        match self.store.compare_and_set_campaign(&updated, previous) {
            Ok(()) => {
                debug!(from = %previous, to = %next, "campaign status updated");
                *campaign = updated;
                Ok(())
            }
            Err(StoreError::Conflict { found, .. }) if previous == CampaignStatus::Draft => {
                warn!(status = %found, "campaign was claimed by another worker");
                Err(HandleOutcome::Duplicate(found))
            }
            Err(e) => {
                error!(to = %next, error = %e, "failed to update campaign status");
                Err(HandleOutcome::StatusWriteFailed {
                    status: previous,
                    error: e,
                })
            }
        }
    }

    fn send_to_subscribers(
        &self,
        msg: &DispatchMessage,
        campaign: &Campaign,
        template: &RenderedTemplate,
        published: &mut usize,
    ) -> Result<(), AbortReason> {
        let query = SubscriberQuery {
            segment_ids: msg.segment_ids.clone(),
            user_id: msg.user_id,
            exclude_unsubscribed: false,
            exclude_blacklisted: true,
        };

        for page in SubscriberPages::new(&self.store, query, self.page_size) {
            let page = page.map_err(AbortReason::Fetch)?;
            debug!(size = page.len(), "processing subscriber page");
            for subscriber in &page {
                self.send_one(msg, campaign, template, subscriber)?;
                *published += 1;
            }
        }
        Ok(())
    }

    fn send_one(
        &self,
        msg: &DispatchMessage,
        campaign: &Campaign,
        template: &RenderedTemplate,
        subscriber: &Subscriber,
    ) -> Result<(), AbortReason> {
        let uuid = Uuid::new_v4();

        let bytes = prepare_subscriber_email(subscriber, uuid, msg, campaign.id, template)
            .and_then(|params| params.to_bytes())
            .map_err(|error| {
                self.log_failure(
                    uuid,
                    msg,
                    subscriber,
                    format!("Failed to prepare subscriber email data error: {error}"),
                );
                AbortReason::Prepare {
                    subscriber_id: subscriber.id,
                    error,
                }
            })?;

        self.publisher
            .publish(&self.send_topic, &bytes)
            .map_err(|error| {
                self.log_failure(
                    uuid,
                    msg,
                    subscriber,
                    format!("Failed to publish subscriber email data error: {error}"),
                );
                AbortReason::Publish {
                    subscriber_id: subscriber.id,
                    error,
                }
            })?;

        debug!(subscriber_id = %subscriber.id, uuid = %uuid, "subscriber email published");
        Ok(())
    }

    fn log_failure(
        &self,
        uuid: Uuid,
        msg: &DispatchMessage,
        subscriber: &Subscriber,
        description: String,
    ) {
        error!(subscriber_id = %subscriber.id, uuid = %uuid, reason = %description, "subscriber send failed");
        let log = SendLog::failed(
            uuid,
            msg.user_id,
            subscriber.id,
            msg.campaign_id,
            description,
            self.clock.now(),
        );
        if let Err(e) = self.store.create_send_log(&log) {
            error!(subscriber_id = %subscriber.id, error = %e, "failed to create send log");
        }
    }
}
