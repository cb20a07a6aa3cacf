//! `campaigner-core`: domain building blocks for campaign dispatch.
//!
//! This crate contains **pure domain** types (no IO). Stores, queues and
//! workers live in `campaigner-infra`.

pub mod campaign;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod schedule;
pub mod send_log;
pub mod status;
pub mod subscriber;
pub mod template;

pub use campaign::{Campaign, Segment, SesKeys, User};
pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{DispatchMessage, SendEmailParams, compose_source, prepare_subscriber_email};
pub use error::{DomainError, DomainResult};
pub use id::{CampaignId, ScheduleId, SegmentId, SubscriberId, TemplateId, UserId};
pub use schedule::CampaignSchedule;
pub use send_log::{SendLog, SendLogStatus};
pub use status::CampaignStatus;
pub use subscriber::{Subscriber, SubscriberCursor};
pub use template::{RenderedTemplate, Template, TemplateData};
