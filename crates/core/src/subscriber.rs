//! Segment members.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{SegmentId, SubscriberId, UserId};
use crate::template::TemplateData;

/// A subscriber and the segments it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub segment_ids: Vec<SegmentId>,
    pub blacklisted: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    /// Per-subscriber template data: `name` plus every metadata pair.
    pub fn template_data(&self) -> TemplateData {
        let mut data = TemplateData::new();
        data.insert("name".to_string(), self.name.clone());
        for (k, v) in &self.metadata {
            data.insert(k.clone(), v.clone());
        }
        data
    }

    pub fn cursor(&self) -> SubscriberCursor {
        SubscriberCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }

    pub fn in_any_segment(&self, segment_ids: &[SegmentId]) -> bool {
        self.segment_ids.iter().any(|s| segment_ids.contains(s))
    }
}

/// Compound pagination key `(created_at, id)` of the last row of a page.
///
/// Ordering is lexicographic, matching the `ORDER BY created_at, id` of the
/// distinct-subscriber scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberCursor {
    pub created_at: DateTime<Utc>,
    pub id: SubscriberId,
}

impl SubscriberCursor {
    /// Whether `subscriber` sorts strictly after this cursor.
    pub fn is_before(&self, subscriber: &Subscriber) -> bool {
        *self < subscriber.cursor()
    }
}
