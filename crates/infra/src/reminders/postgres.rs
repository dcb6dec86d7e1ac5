//! Postgres-backed reminder store.
//!
//! Owns `reminder_rules`, `reminder_delivery_logs` and `in_app_notifications`.
//! `tasks` and `users` belong to the CRUD layer and are only read here.
//!
//! Due selection pushes the offset arithmetic into SQL so the scheduler
//! only sees rules whose reminder time has passed:
//!
//! ```sql
//! t.due_date - make_interval(mins => r.offset_value * <minutes per unit>) <= now
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use taskpulse_core::{DeliveryLogId, RuleId, TaskId, UserId};
use taskpulse_reminders::{
    Channel, DeliveryLog, DeliveryStatus, InAppNotification, OffsetUnit, ReminderDefaults, ReminderRule,
    TaskSnapshot, UserSnapshot,
};

use super::store::{DueCandidate, ReminderStore, ReminderStoreError};

const RULE_COLUMNS: &str =
    "r.id, r.user_id, r.task_id, r.channel, r.offset_value, r.unit, r.enabled, r.last_sent_at, r.created_at, r.updated_at";
const LOG_COLUMNS: &str =
    "id, rule_id, task_id, user_id, channel, status, sent_at, error_message, metadata, read_at, created_at";

const DUE_CANDIDATES_SQL: &str = r#"
    SELECT r.id, r.user_id, r.task_id, r.channel, r.offset_value, r.unit, r.enabled,
           r.last_sent_at, r.created_at, r.updated_at,
           t.title AS task_title, t.due_date AS task_due_date, t.user_id AS task_user_id
    FROM reminder_rules r
    JOIN tasks t ON t.id = r.task_id
    JOIN users u ON u.id = r.user_id
    WHERE r.enabled
      AND t.due_date IS NOT NULL
      AND t.due_date - make_interval(mins => (r.offset_value * CASE r.unit
              WHEN 'minutes' THEN 1
              WHEN 'hours' THEN 60
              ELSE 1440
          END)::int) <= $1
      AND (r.last_sent_at IS NULL OR r.last_sent_at <= $2)
      AND NOT EXISTS (
          SELECT 1 FROM reminder_delivery_logs l
          WHERE l.rule_id = r.id AND l.status = 'sent' AND l.sent_at > $2
      )
    ORDER BY r.id
"#;

#[derive(Debug, Clone)]
pub struct PostgresReminderStore {
    pool: Arc<PgPool>,
}

impl PostgresReminderStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_rules(&self, operation: &str, sql: &str, id: Uuid) -> Result<Vec<ReminderRule>, ReminderStoreError> {
        let rows = sqlx::query(sql)
            .bind(id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|row| -> Result<ReminderRule, ReminderStoreError> {
                RuleRow::from_row(row)
                    .map_err(|e| map_sqlx_error(operation, e))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait]
impl ReminderStore for PostgresReminderStore {
    async fn task(&self, id: TaskId) -> Result<Option<TaskSnapshot>, ReminderStoreError> {
        let row = sqlx::query("SELECT id, user_id, title, due_date FROM tasks WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn user(&self, id: UserId) -> Result<Option<UserSnapshot>, ReminderStoreError> {
        let row = sqlx::query("SELECT id, email, name, reminder_defaults FROM users WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let defaults: Option<JsonValue> = row.try_get("reminder_defaults").map_err(|e| map_sqlx_error("get_user", e))?;
        let reminder_defaults = match defaults {
            Some(value) => serde_json::from_value::<ReminderDefaults>(value)
                .map_err(|e| ReminderStoreError::Storage(format!("bad reminder defaults for user {id}: {e}")))?,
            None => ReminderDefaults::default(),
        };
        Ok(Some(UserSnapshot {
            id: UserId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error("get_user", e))?),
            email: row.try_get("email").map_err(|e| map_sqlx_error("get_user", e))?,
            name: row.try_get("name").map_err(|e| map_sqlx_error("get_user", e))?,
            reminder_defaults,
        }))
    }

    async fn count_tasks_with_due_date(&self) -> Result<u64, ReminderStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE due_date IS NOT NULL")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_tasks", e))?;
        Ok(count.max(0) as u64)
    }

    async fn tasks_with_due_date(&self, offset: u64, limit: usize) -> Result<Vec<TaskSnapshot>, ReminderStoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, due_date FROM tasks WHERE due_date IS NOT NULL ORDER BY id OFFSET $1 LIMIT $2",
        )
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("page_tasks", e))?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id), err)]
    async fn insert_rule(&self, rule: &ReminderRule) -> Result<(), ReminderStoreError> {
        sqlx::query(
            r#"
            INSERT INTO reminder_rules
                (id, user_id, task_id, channel, offset_value, unit, enabled, last_sent_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(rule.user_id.as_uuid())
        .bind(rule.task_id.as_uuid())
        .bind(rule.channel.as_str())
        .bind(rule.offset)
        .bind(rule.unit.as_str())
        .bind(rule.enabled)
        .bind(rule.last_sent_at)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_rule", e))?;
        Ok(())
    }

    async fn update_rule(&self, rule: &ReminderRule) -> Result<(), ReminderStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reminder_rules
            SET channel = $2, offset_value = $3, unit = $4, enabled = $5, last_sent_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(rule.channel.as_str())
        .bind(rule.offset)
        .bind(rule.unit.as_str())
        .bind(rule.enabled)
        .bind(rule.last_sent_at)
        .bind(rule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_rule", e))?;
        if result.rows_affected() == 0 {
            return Err(ReminderStoreError::NotFound("reminder rule"));
        }
        Ok(())
    }

    async fn delete_rule(&self, id: RuleId) -> Result<bool, ReminderStoreError> {
        let result = sqlx::query("DELETE FROM reminder_rules WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_rule", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_rules_for_task(&self, task_id: TaskId) -> Result<u64, ReminderStoreError> {
        let result = sqlx::query("DELETE FROM reminder_rules WHERE task_id = $1")
            .bind(task_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_task_rules", e))?;
        Ok(result.rows_affected())
    }

    async fn rule(&self, id: RuleId) -> Result<Option<ReminderRule>, ReminderStoreError> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM reminder_rules r WHERE r.id = $1");
        Ok(self.fetch_rules("get_rule", &sql, *id.as_uuid()).await?.into_iter().next())
    }

    async fn rules_for_task(&self, task_id: TaskId) -> Result<Vec<ReminderRule>, ReminderStoreError> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM reminder_rules r WHERE r.task_id = $1 ORDER BY r.id");
        self.fetch_rules("rules_for_task", &sql, *task_id.as_uuid()).await
    }

    #[instrument(skip(self), err)]
    async fn due_candidates(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<DueCandidate>, ReminderStoreError> {
        let rows = sqlx::query(DUE_CANDIDATES_SQL)
            .bind(now)
            .bind(now - window)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("due_candidates", e))?;
        rows.iter()
            .map(|row| -> Result<DueCandidate, ReminderStoreError> {
                let rule: ReminderRule = RuleRow::from_row(row)
                    .map_err(|e| map_sqlx_error("due_candidates", e))?
                    .try_into()?;
                let task = TaskSnapshot {
                    id: rule.task_id,
                    user_id: UserId::from_uuid(row.try_get("task_user_id").map_err(|e| map_sqlx_error("due_candidates", e))?),
                    title: row.try_get("task_title").map_err(|e| map_sqlx_error("due_candidates", e))?,
                    due_date: row.try_get("task_due_date").map_err(|e| map_sqlx_error("due_candidates", e))?,
                };
                Ok(DueCandidate { rule, task })
            })
            .collect()
    }

    async fn set_last_sent_at(&self, id: RuleId, at: DateTime<Utc>) -> Result<(), ReminderStoreError> {
        let result = sqlx::query("UPDATE reminder_rules SET last_sent_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_last_sent_at", e))?;
        if result.rows_affected() == 0 {
            return Err(ReminderStoreError::NotFound("reminder rule"));
        }
        Ok(())
    }

    async fn insert_log(&self, log: &DeliveryLog) -> Result<(), ReminderStoreError> {
        sqlx::query(&format!(
            "INSERT INTO reminder_delivery_logs ({LOG_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(log.id.as_uuid())
        .bind(log.rule_id.as_uuid())
        .bind(log.task_id.as_uuid())
        .bind(log.user_id.as_uuid())
        .bind(log.channel.as_str())
        .bind(log.status.as_str())
        .bind(log.sent_at)
        .bind(&log.error_message)
        .bind(&log.metadata)
        .bind(log.read_at)
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_log", e))?;
        Ok(())
    }

    async fn update_log(&self, log: &DeliveryLog) -> Result<(), ReminderStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reminder_delivery_logs
            SET status = $2, sent_at = $3, error_message = $4, metadata = $5, read_at = $6
            WHERE id = $1
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.status.as_str())
        .bind(log.sent_at)
        .bind(&log.error_message)
        .bind(&log.metadata)
        .bind(log.read_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_log", e))?;
        if result.rows_affected() == 0 {
            return Err(ReminderStoreError::NotFound("delivery log"));
        }
        Ok(())
    }

    async fn log(&self, id: DeliveryLogId) -> Result<Option<DeliveryLog>, ReminderStoreError> {
        let row = sqlx::query(&format!("SELECT {LOG_COLUMNS} FROM reminder_delivery_logs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_log", e))?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn logs_for_rule(&self, rule_id: RuleId) -> Result<Vec<DeliveryLog>, ReminderStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM reminder_delivery_logs WHERE rule_id = $1 ORDER BY created_at, id"
        ))
        .bind(rule_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs_for_rule", e))?;
        rows.iter().map(log_from_row).collect()
    }

    async fn has_sent_log_since(&self, rule_id: RuleId, since: DateTime<Utc>) -> Result<bool, ReminderStoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM reminder_delivery_logs WHERE rule_id = $1 AND status = 'sent' AND sent_at > $2)",
        )
        .bind(rule_id.as_uuid())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_sent_log_since", e))
    }

    async fn insert_in_app(&self, notification: &InAppNotification) -> Result<(), ReminderStoreError> {
        sqlx::query(
            r#"
            INSERT INTO in_app_notifications (id, user_id, task_id, rule_id, title, body, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id.as_uuid())
        .bind(notification.task_id.as_uuid())
        .bind(notification.rule_id.as_uuid())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.created_at)
        .bind(notification.read_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_in_app", e))?;
        Ok(())
    }

    async fn in_app_for_user(&self, user_id: UserId) -> Result<Vec<InAppNotification>, ReminderStoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, task_id, rule_id, title, body, created_at, read_at \
             FROM in_app_notifications WHERE user_id = $1 ORDER BY created_at, id",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("in_app_for_user", e))?;
        rows.iter()
            .map(|row| -> Result<InAppNotification, ReminderStoreError> {
                let decode = |e| map_sqlx_error("in_app_for_user", e);
                Ok(InAppNotification {
                    id: row.try_get("id").map_err(decode)?,
                    user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(decode)?),
                    rule_id: RuleId::from_uuid(row.try_get("rule_id").map_err(decode)?),
                    title: row.try_get("title").map_err(decode)?,
                    body: row.try_get("body").map_err(decode)?,
                    created_at: row.try_get("created_at").map_err(decode)?,
                    read_at: row.try_get("read_at").map_err(decode)?,
                })
            })
            .collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ReminderStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            ReminderStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => ReminderStoreError::Storage(format!("connection pool closed in {}", operation)),
        other => ReminderStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

fn task_from_row(row: &PgRow) -> Result<TaskSnapshot, ReminderStoreError> {
    let decode = |e| map_sqlx_error("decode_task", e);
    Ok(TaskSnapshot {
        id: TaskId::from_uuid(row.try_get("id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
        title: row.try_get("title").map_err(decode)?,
        due_date: row.try_get("due_date").map_err(decode)?,
    })
}

fn log_from_row(row: &PgRow) -> Result<DeliveryLog, ReminderStoreError> {
    let decode = |e| map_sqlx_error("decode_log", e);
    let channel: String = row.try_get("channel").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(DeliveryLog {
        id: DeliveryLogId::from_uuid(row.try_get("id").map_err(decode)?),
        rule_id: RuleId::from_uuid(row.try_get("rule_id").map_err(decode)?),
        task_id: TaskId::from_uuid(row.try_get("task_id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
        channel: channel.parse::<Channel>()?,
        status: status.parse::<DeliveryStatus>()?,
        sent_at: row.try_get("sent_at").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        metadata: row.try_get("metadata").map_err(decode)?,
        read_at: row.try_get("read_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

// SQLx row types

#[derive(Debug)]
struct RuleRow {
    id: Uuid,
    user_id: Uuid,
    task_id: Uuid,
    channel: String,
    offset_value: i64,
    unit: String,
    enabled: bool,
    last_sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for RuleRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RuleRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            task_id: row.try_get("task_id")?,
            channel: row.try_get("channel")?,
            offset_value: row.try_get("offset_value")?,
            unit: row.try_get("unit")?,
            enabled: row.try_get("enabled")?,
            last_sent_at: row.try_get("last_sent_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RuleRow> for ReminderRule {
    type Error = ReminderStoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(ReminderRule {
            id: RuleId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            task_id: TaskId::from_uuid(row.task_id),
            channel: row.channel.parse::<Channel>()?,
            offset: row.offset_value,
            unit: row.unit.parse::<OffsetUnit>()?,
            enabled: row.enabled,
            last_sent_at: row.last_sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
