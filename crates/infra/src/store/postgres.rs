//! Postgres-backed campaign store.
//!
//! ## Tables
//!
//! | Table | Key | Notes |
//! |-------|-----|-------|
//! | `users` | `id` | owner account, `uuid` column is forwarded downstream |
//! | `campaigns` | `id` | `status` holds the lowercase status name |
//! | `templates` | `id` | subject/html/text parts |
//! | `ses_keys` | `user_id` | one credential set per user |
//! | `segments` | `id` | |
//! | `subscribers` | `id` | `metadata` is a `jsonb` object of strings |
//! | `subscribers_segments` | `(subscriber_id, segment_id)` | membership join |
//! | `campaign_schedules` | `id`, unique `campaign_id` | JSON text columns for segment ids and defaults |
//! | `send_logs` | `uuid` | append-only |
//!
//! ## Runtime
//!
//! The [`CampaignStore`] contract is synchronous. The store keeps the handle of
//! the runtime that owns the pool and blocks on it, so it must be called from
//! plain threads (the scheduler's main thread, consumer worker threads), never
//! from inside an async task.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use campaigner_core::{
    Campaign, CampaignId, CampaignSchedule, CampaignStatus, ScheduleId, Segment, SegmentId,
    SendLog, SesKeys, Subscriber, SubscriberCursor, SubscriberId, Template, TemplateId, User,
    UserId,
};

use super::{CampaignStore, StoreError, SubscriberQuery};

/// Postgres-backed [`CampaignStore`].
#[derive(Debug, Clone)]
pub struct PostgresCampaignStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresCampaignStore {
    /// Wrap a pool owned by the runtime behind `handle`.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignSchedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                cs.id, cs.campaign_id, cs.user_id, cs.scheduled_at, cs.from_name,
                cs.source, cs.segment_ids, cs.default_template_data,
                cs.created_at, cs.updated_at
            FROM campaign_schedules cs
            JOIN campaigns c ON c.id = cs.campaign_id
            WHERE cs.scheduled_at <= $1
              AND c.status IN ('draft', 'scheduled')
            ORDER BY cs.scheduled_at ASC, cs.campaign_id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_scheduled_campaigns", e))?;

        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn fetch_user(&self, user_id: UserId) -> Result<User, StoreError> {
        let row = sqlx::query("SELECT id, uuid, username, active FROM users WHERE id = $1")
            .bind(user_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?
            .ok_or_else(|| StoreError::not_found(format!("user {user_id}")))?;

        Ok(User {
            id: UserId::new(get(&row, "id")?),
            uuid: get(&row, "uuid")?,
            username: get(&row, "username")?,
            active: get(&row, "active")?,
        })
    }

    pub async fn fetch_campaign(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> Result<Campaign, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, name, status, template_id,
                   started_at, completed_at, created_at, updated_at
            FROM campaigns
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(campaign_id.get())
        .bind(user_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_campaign", e))?
        .ok_or_else(|| StoreError::not_found(format!("campaign {campaign_id}")))?;

        campaign_from_row(&row)
    }

    pub async fn fetch_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Template, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, name, subject_part, html_part, text_part
            FROM templates
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(template_id.get())
        .bind(user_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_template", e))?
        .ok_or_else(|| StoreError::not_found(format!("template {template_id}")))?;

        Ok(Template {
            id: TemplateId::new(get(&row, "id")?),
            user_id: UserId::new(get(&row, "user_id")?),
            name: get(&row, "name")?,
            subject_part: get(&row, "subject_part")?,
            html_part: get(&row, "html_part")?,
            text_part: get(&row, "text_part")?,
        })
    }

    pub async fn fetch_ses_keys(&self, user_id: UserId) -> Result<SesKeys, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, access_key, secret_key, region FROM ses_keys WHERE user_id = $1",
        )
        .bind(user_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_ses_keys", e))?
        .ok_or_else(|| StoreError::not_found(format!("ses keys for user {user_id}")))?;

        Ok(SesKeys {
            user_id: UserId::new(get(&row, "user_id")?),
            access_key: get(&row, "access_key")?,
            secret_key: get(&row, "secret_key")?,
            region: get(&row, "region")?,
        })
    }

    pub async fn fetch_segments(
        &self,
        user_id: UserId,
        segment_ids: &[SegmentId],
    ) -> Result<Vec<Segment>, StoreError> {
        let ids: Vec<i64> = segment_ids.iter().map(|s| s.get()).collect();
        let rows = sqlx::query(
            "SELECT id, user_id, name FROM segments WHERE user_id = $1 AND id = ANY($2) ORDER BY id",
        )
        .bind(user_id.get())
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_segments_by_ids", e))?;

        rows.iter()
            .map(|row| {
                Ok(Segment {
                    id: SegmentId::new(get(row, "id")?),
                    user_id: UserId::new(get(row, "user_id")?),
                    name: get(row, "name")?,
                })
            })
            .collect()
    }

    /// Keyset-paginated distinct subscriber scan.
    #[instrument(
        skip(self, query),
        fields(
            user_id = %query.user_id,
            segments = query.segment_ids.len(),
            rows = tracing::field::Empty
        ),
        err
    )]
    pub async fn subscriber_page(
        &self,
        query: &SubscriberQuery,
        after: Option<SubscriberCursor>,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let segment_ids: Vec<i64> = query.segment_ids.iter().map(|s| s.get()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // EXISTS keeps each subscriber once however many of the segments it is in.
        let rows = sqlx::query(
            r#"
            SELECT
                s.id, s.user_id, s.name, s.email, s.metadata,
                s.blacklisted, s.active, s.created_at, s.updated_at,
                ARRAY(
                    SELECT m.segment_id FROM subscribers_segments m
                    WHERE m.subscriber_id = s.id
                    ORDER BY m.segment_id
                ) AS segment_ids
            FROM subscribers s
            WHERE s.user_id = $1
              AND EXISTS (
                  SELECT 1 FROM subscribers_segments ss
                  WHERE ss.subscriber_id = s.id AND ss.segment_id = ANY($2)
              )
              AND ($3 = FALSE OR s.active)
              AND ($4 = FALSE OR NOT s.blacklisted)
              AND ($5::timestamptz IS NULL OR (s.created_at, s.id) > ($5, $6))
            ORDER BY s.created_at ASC, s.id ASC
            LIMIT $7
            "#,
        )
        .bind(query.user_id.get())
        .bind(&segment_ids)
        .bind(query.exclude_unsubscribed)
        .bind(query.exclude_blacklisted)
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id.get()).unwrap_or(0))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_distinct_subscribers_by_segment_ids", e))?;

        Span::current().record("rows", rows.len());
        rows.iter().map(subscriber_from_row).collect()
    }

    pub async fn write_campaign(
        &self,
        campaign: &Campaign,
        expected: Option<CampaignStatus>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $1, started_at = $2, completed_at = $3, updated_at = $4
            WHERE id = $5 AND user_id = $6
              AND ($7::text IS NULL OR status = $7)
            "#,
        )
        .bind(campaign.status.as_str())
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .bind(campaign.updated_at)
        .bind(campaign.id.get())
        .bind(campaign.user_id.get())
        .bind(expected.map(|s| s.as_str()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_campaign", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing matched: either the campaign is gone or its status moved on.
        let current = self.fetch_campaign(campaign.id, campaign.user_id).await?;
        match expected {
            Some(expected) => Err(StoreError::Conflict {
                expected,
                found: current.status,
            }),
            None => Err(StoreError::Storage(format!(
                "campaign {} was not updated",
                campaign.id
            ))),
        }
    }

    pub async fn insert_send_log(&self, log: &SendLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO send_logs
                (uuid, user_id, subscriber_id, campaign_id, status, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.uuid)
        .bind(log.user_id.get())
        .bind(log.subscriber_id.get())
        .bind(log.campaign_id.get())
        .bind(log.status.as_str())
        .bind(&log.description)
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_send_log", e))?;
        Ok(())
    }

    pub async fn upsert_schedule(&self, schedule: &CampaignSchedule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO campaign_schedules
                (id, campaign_id, user_id, scheduled_at, from_name, source,
                 segment_ids, default_template_data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (campaign_id) DO UPDATE SET
                scheduled_at = EXCLUDED.scheduled_at,
                from_name = EXCLUDED.from_name,
                source = EXCLUDED.source,
                segment_ids = EXCLUDED.segment_ids,
                default_template_data = EXCLUDED.default_template_data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.campaign_id.get())
        .bind(schedule.user_id.get())
        .bind(schedule.scheduled_at)
        .bind(&schedule.from_name)
        .bind(&schedule.source)
        .bind(&schedule.segment_ids_json)
        .bind(&schedule.default_template_data_json)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_campaign_schedule", e))?;
        Ok(())
    }

    pub async fn remove_schedule(&self, campaign_id: CampaignId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM campaign_schedules WHERE campaign_id = $1")
            .bind(campaign_id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_campaign_schedule", e))?;
        Ok(())
    }

    pub async fn fetch_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, campaign_id, user_id, scheduled_at, from_name, source,
                   segment_ids, default_template_data, created_at, updated_at
            FROM campaign_schedules
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_campaign_schedule", e))?;

        row.as_ref().map(schedule_from_row).transpose()
    }
}

impl CampaignStore for PostgresCampaignStore {
    fn get_scheduled_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignSchedule>, StoreError> {
        self.handle.block_on(self.due_schedules(now))
    }

    fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        self.handle.block_on(self.fetch_user(user_id))
    }

    fn get_campaign(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> Result<Campaign, StoreError> {
        self.handle.block_on(self.fetch_campaign(campaign_id, user_id))
    }

    fn get_template(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Template, StoreError> {
        self.handle.block_on(self.fetch_template(template_id, user_id))
    }

    fn get_ses_keys(&self, user_id: UserId) -> Result<SesKeys, StoreError> {
        self.handle.block_on(self.fetch_ses_keys(user_id))
    }

    fn get_segments_by_ids(
        &self,
        user_id: UserId,
        segment_ids: &[SegmentId],
    ) -> Result<Vec<Segment>, StoreError> {
        self.handle.block_on(self.fetch_segments(user_id, segment_ids))
    }

    fn get_distinct_subscribers_by_segment_ids(
        &self,
        query: &SubscriberQuery,
        after: Option<SubscriberCursor>,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        self.handle.block_on(self.subscriber_page(query, after, limit))
    }

    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.handle.block_on(self.write_campaign(campaign, None))
    }

    fn compare_and_set_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.handle
            .block_on(self.write_campaign(campaign, Some(expected)))
    }

    fn create_send_log(&self, log: &SendLog) -> Result<(), StoreError> {
        self.handle.block_on(self.insert_send_log(log))
    }

    fn create_campaign_schedule(&self, schedule: &CampaignSchedule) -> Result<(), StoreError> {
        self.handle.block_on(self.upsert_schedule(schedule))
    }

    fn delete_campaign_schedule(&self, campaign_id: CampaignId) -> Result<(), StoreError> {
        self.handle.block_on(self.remove_schedule(campaign_id))
    }

    fn get_campaign_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, StoreError> {
        self.handle.block_on(self.fetch_schedule(campaign_id))
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("failed to read {column}: {e}")))
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    let status: String = get(row, "status")?;
    let status: CampaignStatus = status
        .parse()
        .map_err(|e| StoreError::Storage(format!("invalid campaign status: {e}")))?;

    Ok(Campaign {
        id: CampaignId::new(get(row, "id")?),
        user_id: UserId::new(get(row, "user_id")?),
        name: get(row, "name")?,
        status,
        template_id: TemplateId::new(get(row, "template_id")?),
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber, StoreError> {
    let metadata: Option<Json<BTreeMap<String, String>>> = get(row, "metadata")?;
    let segment_ids: Vec<i64> = get(row, "segment_ids")?;

    Ok(Subscriber {
        id: SubscriberId::new(get(row, "id")?),
        user_id: UserId::new(get(row, "user_id")?),
        name: get(row, "name")?,
        email: get(row, "email")?,
        metadata: metadata.map(|m| m.0).unwrap_or_default(),
        segment_ids: segment_ids.into_iter().map(SegmentId::new).collect(),
        blacklisted: get(row, "blacklisted")?,
        active: get(row, "active")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<CampaignSchedule, StoreError> {
    Ok(CampaignSchedule {
        id: ScheduleId::from_uuid(get(row, "id")?),
        campaign_id: CampaignId::new(get(row, "campaign_id")?),
        user_id: UserId::new(get(row, "user_id")?),
        scheduled_at: get(row, "scheduled_at")?,
        from_name: get(row, "from_name")?,
        source: get(row, "source")?,
        segment_ids_json: get(row, "segment_ids")?,
        default_template_data_json: get(row, "default_template_data")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => StoreError::not_found(operation.to_string()),
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
