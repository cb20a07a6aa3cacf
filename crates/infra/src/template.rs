//! Template rendering boundary used by the consumer.

use thiserror::Error;
use tracing::debug;

use campaigner_core::{RenderedTemplate, TemplateId, UserId};

use crate::store::{CampaignStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template {0} not found")]
    NotFound(TemplateId),

    #[error("template {id} is invalid: {reason}")]
    Invalid { id: TemplateId, reason: String },

    #[error("failed to load template: {0}")]
    Store(StoreError),
}

/// Produces the subject/html/text parts a campaign is sent with.
pub trait TemplateRenderer: Send + Sync {
    fn parse_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<RenderedTemplate, TemplateError>;
}

impl<R> TemplateRenderer for std::sync::Arc<R>
where
    R: TemplateRenderer + ?Sized,
{
    fn parse_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<RenderedTemplate, TemplateError> {
        (**self).parse_template(template_id, user_id)
    }
}

/// Renders templates straight out of the campaign store.
///
/// Placeholders are left in place; substitution happens per subscriber in the
/// sender, using the template data carried on each message.
#[derive(Debug, Clone)]
pub struct StoredTemplateRenderer<S> {
    store: S,
}

impl<S: CampaignStore> StoredTemplateRenderer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: CampaignStore> TemplateRenderer for StoredTemplateRenderer<S> {
    fn parse_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<RenderedTemplate, TemplateError> {
        let template = self
            .store
            .get_template(template_id, user_id)
            .map_err(|e| match e {
                StoreError::NotFound(_) => TemplateError::NotFound(template_id),
                other => TemplateError::Store(other),
            })?;

        if template.subject_part.trim().is_empty() {
            return Err(TemplateError::Invalid {
                id: template_id,
                reason: "empty subject".to_string(),
            });
        }
        if template.html_part.trim().is_empty() && template.text_part.trim().is_empty() {
            return Err(TemplateError::Invalid {
                id: template_id,
                reason: "no html or text body".to_string(),
            });
        }

        debug!(template_id = %template_id, variables = template.variables().len(), "template parsed");
        Ok(template.parts())
    }
}
