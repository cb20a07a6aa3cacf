//! Campaign status state machine.
//!
//! Every status change in the pipeline goes through [`CampaignStatus::check_transition`],
//! so the Scheduler, the Consumer and the schedule management path agree on a
//! single transition table:
//!
//! ```text
//! draft ──▶ scheduled ──▶ sending ──▶ sent
//!   │  ◀──────┘              │
//!   └─────────────────────▶  └──────▶ failed
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Campaign lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Editable; the only status the Consumer accepts as new work.
    Draft,
    /// Has a pending schedule row; the Scheduler may start it.
    Scheduled,
    /// Handed to the pipeline.
    Sending,
    /// Every subscriber was enqueued.
    Sent,
    /// The template could not be prepared.
    Failed,
}

impl CampaignStatus {
    pub const ALL: [CampaignStatus; 5] = [
        CampaignStatus::Draft,
        CampaignStatus::Scheduled,
        CampaignStatus::Sending,
        CampaignStatus::Sent,
        CampaignStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Sent | CampaignStatus::Failed)
    }

    /// Whether the transition table allows `self -> next`.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Draft)
                | (Draft, Sending)
                | (Scheduled, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
        )
    }

    pub fn check_transition(self, next: CampaignStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for CampaignStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown campaign status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CampaignStatus::*;

    #[test]
    fn allowed_transitions() {
        assert!(Draft.can_transition_to(Sending));
        assert!(Scheduled.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Failed));
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Draft));
    }

    #[test]
    fn terminal_statuses_never_move() {
        for next in CampaignStatus::ALL {
            assert!(!Sent.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn self_transitions_are_rejected() {
        for status in CampaignStatus::ALL {
            assert_eq!(
                status.check_transition(status),
                Err(DomainError::InvalidTransition {
                    from: status,
                    to: status
                })
            );
        }
    }

    #[test]
    fn sending_cannot_go_back() {
        assert!(!Sending.can_transition_to(Draft));
        assert!(!Sending.can_transition_to(Scheduled));
        assert!(!Draft.can_transition_to(Sent));
    }

    #[test]
    fn status_round_trips_as_lowercase_string() {
        for status in CampaignStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<CampaignStatus>().unwrap(), status);
        }
    }
}
