//! In-memory campaign store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use campaigner_core::{
    Campaign, CampaignId, CampaignSchedule, CampaignStatus, Segment, SegmentId, SendLog, SesKeys,
    Subscriber, SubscriberCursor, SubscriberId, Template, TemplateId, User, UserId,
};

use super::{CampaignStore, StoreError, SubscriberQuery};

/// In-memory campaign store.
///
/// Besides the store contract it offers seeding helpers, inspectors and
/// fault switches so tests can drive every failure branch of the pipeline.
#[derive(Debug, Default)]
pub struct InMemoryCampaignStore {
    users: RwLock<HashMap<UserId, User>>,
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    templates: RwLock<HashMap<TemplateId, Template>>,
    ses_keys: RwLock<HashMap<UserId, SesKeys>>,
    segments: RwLock<HashMap<SegmentId, Segment>>,
    subscribers: RwLock<BTreeMap<SubscriberId, Subscriber>>,
    schedules: RwLock<HashMap<CampaignId, CampaignSchedule>>,
    send_logs: RwLock<Vec<SendLog>>,
    writes: AtomicUsize,
    page_fetches: AtomicUsize,
    fail_campaign_writes: AtomicBool,
    fail_send_logs: AtomicBool,
    fail_subscriber_fetches: AtomicBool,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // Seeding

    pub fn insert_user(&self, user: User) {
        self.users.write().unwrap().insert(user.id, user);
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.write().unwrap().insert(campaign.id, campaign);
    }

    pub fn insert_template(&self, template: Template) {
        self.templates.write().unwrap().insert(template.id, template);
    }

    pub fn insert_ses_keys(&self, keys: SesKeys) {
        self.ses_keys.write().unwrap().insert(keys.user_id, keys);
    }

    pub fn insert_segment(&self, segment: Segment) {
        self.segments.write().unwrap().insert(segment.id, segment);
    }

    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.id, subscriber);
    }

    /// Seed a schedule without counting it as a pipeline write.
    pub fn insert_schedule(&self, schedule: CampaignSchedule) {
        self.schedules
            .write()
            .unwrap()
            .insert(schedule.campaign_id, schedule);
    }

    // Inspection

    pub fn campaign(&self, campaign_id: CampaignId) -> Option<Campaign> {
        self.campaigns.read().unwrap().get(&campaign_id).cloned()
    }

    pub fn send_logs(&self) -> Vec<SendLog> {
        self.send_logs.read().unwrap().clone()
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.read().unwrap().len()
    }

    /// Number of successful writes (campaign updates, send logs, schedule changes).
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of subscriber pages served.
    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    // Fault injection

    /// Make every campaign update (plain or conditional) fail.
    pub fn fail_campaign_writes(&self, fail: bool) {
        self.fail_campaign_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send_logs(&self, fail: bool) {
        self.fail_send_logs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscriber_fetches(&self, fail: bool) {
        self.fail_subscriber_fetches.store(fail, Ordering::SeqCst);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn check_campaign_writable(&self) -> Result<(), StoreError> {
        if self.fail_campaign_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("campaign write rejected".to_string()));
        }
        Ok(())
    }
}

impl CampaignStore for InMemoryCampaignStore {
    fn get_scheduled_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignSchedule>, StoreError> {
        let schedules = self.schedules.read().unwrap();
        let campaigns = self.campaigns.read().unwrap();

        let mut due: Vec<CampaignSchedule> = schedules
            .values()
            .filter(|s| s.is_due(now))
            .filter(|s| {
                campaigns.get(&s.campaign_id).is_some_and(|c| {
                    matches!(c.status, CampaignStatus::Draft | CampaignStatus::Scheduled)
                })
            })
            .cloned()
            .collect();

        due.sort_by_key(|s| (s.scheduled_at, s.campaign_id));
        Ok(due)
    }

    fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("user {user_id}")))
    }

    fn get_campaign(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> Result<Campaign, StoreError> {
        self.campaigns
            .read()
            .unwrap()
            .get(&campaign_id)
            .filter(|c| c.user_id == user_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("campaign {campaign_id}")))
    }

    fn get_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Template, StoreError> {
        self.templates
            .read()
            .unwrap()
            .get(&template_id)
            .filter(|t| t.user_id == user_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("template {template_id}")))
    }

    fn get_ses_keys(&self, user_id: UserId) -> Result<SesKeys, StoreError> {
        self.ses_keys
            .read()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("ses keys for user {user_id}")))
    }

    fn get_segments_by_ids(
        &self,
        user_id: UserId,
        segment_ids: &[SegmentId],
    ) -> Result<Vec<Segment>, StoreError> {
        let segments = self.segments.read().unwrap();
        let mut found: Vec<Segment> = segment_ids
            .iter()
            .filter_map(|id| segments.get(id))
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        found.dedup_by_key(|s| s.id);
        Ok(found)
    }

    fn get_distinct_subscribers_by_segment_ids(
        &self,
        query: &SubscriberQuery,
        after: Option<SubscriberCursor>,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        if self.fail_subscriber_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("subscriber scan failed".to_string()));
        }
        self.page_fetches.fetch_add(1, Ordering::SeqCst);

        // Keyed by id, so a subscriber in several segments appears once.
        let subscribers = self.subscribers.read().unwrap();
        let mut page: Vec<Subscriber> = subscribers
            .values()
            .filter(|s| s.user_id == query.user_id)
            .filter(|s| s.in_any_segment(&query.segment_ids))
            .filter(|s| !query.exclude_unsubscribed || s.active)
            .filter(|s| !query.exclude_blacklisted || !s.blacklisted)
            .filter(|s| after.is_none_or(|c| c.is_before(s)))
            .cloned()
            .collect();

        page.sort_by_key(Subscriber::cursor);
        page.truncate(limit);
        Ok(page)
    }

    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.check_campaign_writable()?;
        let mut campaigns = self.campaigns.write().unwrap();
        match campaigns.get_mut(&campaign.id) {
            Some(stored) if stored.user_id == campaign.user_id => {
                *stored = campaign.clone();
            }
            _ => return Err(StoreError::not_found(format!("campaign {}", campaign.id))),
        }
        self.record_write();
        Ok(())
    }

    fn compare_and_set_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.check_campaign_writable()?;
        let mut campaigns = self.campaigns.write().unwrap();
        match campaigns.get_mut(&campaign.id) {
            Some(stored) if stored.user_id == campaign.user_id => {
                if stored.status != expected {
                    return Err(StoreError::Conflict {
                        expected,
                        found: stored.status,
                    });
                }
                *stored = campaign.clone();
            }
            _ => return Err(StoreError::not_found(format!("campaign {}", campaign.id))),
        }
        self.record_write();
        Ok(())
    }

    fn create_send_log(&self, log: &SendLog) -> Result<(), StoreError> {
        if self.fail_send_logs.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("send log write rejected".to_string()));
        }
        self.send_logs.write().unwrap().push(log.clone());
        self.record_write();
        Ok(())
    }

    fn create_campaign_schedule(&self, schedule: &CampaignSchedule) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write().unwrap();
        let mut next = schedule.clone();
        if let Some(existing) = schedules.get(&schedule.campaign_id) {
            next.id = existing.id;
            next.created_at = existing.created_at;
        }
        schedules.insert(next.campaign_id, next);
        self.record_write();
        Ok(())
    }

    fn delete_campaign_schedule(&self, campaign_id: CampaignId) -> Result<(), StoreError> {
        if self.schedules.write().unwrap().remove(&campaign_id).is_some() {
            self.record_write();
        }
        Ok(())
    }

    fn get_campaign_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, StoreError> {
        Ok(self.schedules.read().unwrap().get(&campaign_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaigner_core::TemplateData;
    use chrono::Duration;

    fn campaign(id: i64, status: CampaignStatus) -> Campaign {
        Campaign::new(
            CampaignId::new(id),
            UserId::new(1),
            format!("campaign {id}"),
            TemplateId::new(1),
            Utc::now(),
        )
        .with_status(status)
    }

    fn subscriber(id: i64, segments: &[i64], created_at: DateTime<Utc>) -> Subscriber {
        Subscriber {
            id: SubscriberId::new(id),
            user_id: UserId::new(1),
            name: format!("sub {id}"),
            email: format!("sub{id}@example.com"),
            metadata: BTreeMap::new(),
            segment_ids: segments.iter().copied().map(SegmentId::new).collect(),
            blacklisted: false,
            active: true,
            created_at,
            updated_at: created_at,
        }
    }

    fn schedule(campaign_id: i64, at: DateTime<Utc>) -> CampaignSchedule {
        CampaignSchedule::new(
            CampaignId::new(campaign_id),
            UserId::new(1),
            at,
            "Badger",
            "news@example.com",
            &[SegmentId::new(1)],
            &TemplateData::new(),
            at,
        )
        .unwrap()
    }

    #[test]
    fn conditional_update_rejects_stale_status() {
        let store = InMemoryCampaignStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Sending));

        let mut next = campaign(1, CampaignStatus::Draft);
        next.transition(CampaignStatus::Sending, Utc::now()).unwrap();

        let err = store
            .compare_and_set_campaign(&next, CampaignStatus::Draft)
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                expected: CampaignStatus::Draft,
                found: CampaignStatus::Sending,
            }
        );
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn campaigns_are_scoped_to_their_owner() {
        let store = InMemoryCampaignStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Draft));

        assert!(store.get_campaign(CampaignId::new(1), UserId::new(1)).is_ok());
        let err = store
            .get_campaign(CampaignId::new(1), UserId::new(2))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn due_schedules_skip_campaigns_already_started() {
        let store = InMemoryCampaignStore::new();
        let now = Utc::now();
        store.insert_campaign(campaign(1, CampaignStatus::Scheduled));
        store.insert_campaign(campaign(2, CampaignStatus::Sending));
        store.insert_campaign(campaign(3, CampaignStatus::Draft));
        store.insert_campaign(campaign(4, CampaignStatus::Scheduled));
        store.insert_schedule(schedule(1, now - Duration::minutes(1)));
        store.insert_schedule(schedule(2, now - Duration::minutes(2)));
        store.insert_schedule(schedule(3, now - Duration::minutes(3)));
        store.insert_schedule(schedule(4, now + Duration::minutes(1)));

        let due: Vec<_> = store
            .get_scheduled_campaigns(now)
            .unwrap()
            .into_iter()
            .map(|s| s.campaign_id)
            .collect();
        assert_eq!(due, vec![CampaignId::new(3), CampaignId::new(1)]);
    }

    #[test]
    fn subscriber_scan_is_distinct_ordered_and_resumable() {
        let store = InMemoryCampaignStore::new();
        let t = Utc::now();
        store.insert_subscriber(subscriber(3, &[1, 2], t));
        store.insert_subscriber(subscriber(1, &[2], t + Duration::seconds(1)));
        store.insert_subscriber(subscriber(2, &[1], t));
        store.insert_subscriber(subscriber(4, &[9], t));
        let mut blacklisted = subscriber(5, &[1], t);
        blacklisted.blacklisted = true;
        store.insert_subscriber(blacklisted);

        let query = SubscriberQuery {
            segment_ids: vec![SegmentId::new(1), SegmentId::new(2)],
            user_id: UserId::new(1),
            exclude_unsubscribed: false,
            exclude_blacklisted: true,
        };

        let first = store
            .get_distinct_subscribers_by_segment_ids(&query, None, 2)
            .unwrap();
        let ids: Vec<i64> = first.iter().map(|s| s.id.get()).collect();
        assert_eq!(ids, vec![2, 3]);

        let rest = store
            .get_distinct_subscribers_by_segment_ids(&query, Some(first[1].cursor()), 2)
            .unwrap();
        let ids: Vec<i64> = rest.iter().map(|s| s.id.get()).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(store.page_fetches(), 2);
    }

    #[test]
    fn schedule_upsert_keeps_one_row_per_campaign() {
        let store = InMemoryCampaignStore::new();
        let now = Utc::now();
        let first = schedule(1, now);
        store.create_campaign_schedule(&first).unwrap();
        store
            .create_campaign_schedule(&schedule(1, now + Duration::hours(1)))
            .unwrap();

        assert_eq!(store.schedule_count(), 1);
        let stored = store
            .get_campaign_schedule(CampaignId::new(1))
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.scheduled_at, now + Duration::hours(1));

        store.delete_campaign_schedule(CampaignId::new(1)).unwrap();
        store.delete_campaign_schedule(CampaignId::new(1)).unwrap();
        assert_eq!(store.schedule_count(), 0);
    }

    #[test]
    fn fault_switches_reject_writes() {
        let store = InMemoryCampaignStore::new();
        store.insert_campaign(campaign(1, CampaignStatus::Draft));
        store.fail_campaign_writes(true);

        let c = campaign(1, CampaignStatus::Draft);
        assert!(matches!(
            store.update_campaign(&c),
            Err(StoreError::Storage(_))
        ));

        store.fail_send_logs(true);
        let log = SendLog::failed(
            uuid::Uuid::new_v4(),
            UserId::new(1),
            SubscriberId::new(1),
            CampaignId::new(1),
            "boom",
            Utc::now(),
        );
        assert!(store.create_send_log(&log).is_err());
        assert!(store.send_logs().is_empty());
    }
}
