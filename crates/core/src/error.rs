//! Domain error model.

use thiserror::Error;

use crate::status::CampaignStatus;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of domain rules. Store and queue failures have
/// their own error types in `campaigner-infra` / `campaigner-events`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: payloads, JSON columns, email addresses.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Placeholders in a template with no value in the supplied data.
    #[error("template '{template}' is missing data for: {}", .keys.join(", "))]
    MissingTemplateData { template: String, keys: Vec<String> },

    #[error("invalid campaign status transition: {from} -> {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
