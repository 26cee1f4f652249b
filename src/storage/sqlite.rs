//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Shared between scheduler, workers and quota gate
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds, ids as text and monitor
//! regions as a JSON array.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::backend::{IncidentStore, MonitorStore, RecipientStore, ResultStore};
use super::error::{StorageError, StorageResult};
use crate::model::{
    AlertRecipient, Incident, IncidentId, Monitor, MonitorId, MonitorLogEntry, MonitorStatus,
    Plan, ProbeOutcome, UptimeStats,
};

const MONITOR_COLUMNS: &str = "id, user_id, url, method, expected_status, interval_minutes, \
     timeout_secs, regions, is_paused, is_deleted, status, last_checked_at";

const INCIDENT_COLUMNS: &str =
    "id, monitor_id, opened_at, resolved_at, status, summary, last_notified_at";

/// SQLite storage backend
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database file and run migrations
    ///
    /// ```no_run
    /// # use uptime_engine::storage::sqlite::SqliteStore;
    /// # async fn example() -> anyhow::Result<()> {
    /// let store = SqliteStore::new("./uptime.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        info!("closing SQLite store");
        self.pool.close().await;
    }
}

fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

fn parse_uuid(value: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| StorageError::SerializationError(format!("invalid id {value}: {e}")))
}

/// Narrow an INTEGER column, rejecting values the field cannot hold
fn narrow<T: TryFrom<i64>>(column: &str, value: i64) -> StorageResult<T> {
    T::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("{column} out of range: {value}")))
}

fn monitor_from_row(row: &SqliteRow) -> StorageResult<Monitor> {
    let id: String = row.try_get("id")?;
    let method: String = row.try_get("method")?;
    let regions: String = row.try_get("regions")?;
    let status: String = row.try_get("status")?;
    let expected_status: i64 = row.try_get("expected_status")?;
    let interval_minutes: i64 = row.try_get("interval_minutes")?;
    let timeout_secs: i64 = row.try_get("timeout_secs")?;

    Ok(Monitor {
        id: parse_uuid(&id)?,
        user_id: row.try_get("user_id")?,
        url: row.try_get("url")?,
        method: method.parse()?,
        expected_status: narrow("expected_status", expected_status)?,
        interval_minutes: narrow("interval_minutes", interval_minutes)?,
        timeout_secs: narrow("timeout_secs", timeout_secs)?,
        regions: serde_json::from_str(&regions)?,
        is_paused: row.try_get("is_paused")?,
        is_deleted: row.try_get("is_deleted")?,
        status: status.parse()?,
        last_checked_at: row
            .try_get::<Option<i64>, _>("last_checked_at")?
            .map(from_millis),
    })
}

fn incident_from_row(row: &SqliteRow) -> StorageResult<Incident> {
    let id: String = row.try_get("id")?;
    let monitor_id: String = row.try_get("monitor_id")?;
    let status: String = row.try_get("status")?;

    Ok(Incident {
        id: parse_uuid(&id)?,
        monitor_id: parse_uuid(&monitor_id)?,
        opened_at: from_millis(row.try_get("opened_at")?),
        resolved_at: row.try_get::<Option<i64>, _>("resolved_at")?.map(from_millis),
        status: status.parse()?,
        summary: row.try_get("summary")?,
        last_notified_at: row
            .try_get::<Option<i64>, _>("last_notified_at")?
            .map(from_millis),
    })
}

fn outcome_from_row(row: &SqliteRow) -> StorageResult<ProbeOutcome> {
    let monitor_id: String = row.try_get("monitor_id")?;
    let response_time_ms: i64 = row.try_get("response_time_ms")?;

    Ok(ProbeOutcome {
        monitor_id: parse_uuid(&monitor_id)?,
        region: row.try_get("region")?,
        checked_at: from_millis(row.try_get("checked_at")?),
        up: row.try_get("is_up")?,
        status_code: row
            .try_get::<Option<i64>, _>("status_code")?
            .map(|code| narrow("status_code", code))
            .transpose()?,
        response_time_ms: narrow("response_time_ms", response_time_ms)?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl MonitorStore for SqliteStore {
    #[instrument(skip(self))]
    async fn list_active_monitors(&self) -> StorageResult<Vec<Monitor>> {
        let sql = format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors WHERE is_paused = 0 AND is_deleted = 0"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(monitor_from_row).collect()
    }

    async fn get_monitor(&self, id: MonitorId) -> StorageResult<Option<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(monitor_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: MonitorId,
        status: MonitorStatus,
        last_checked_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitors SET status = ?, last_checked_at = ?
            WHERE id = ? AND is_paused = 0 AND is_deleted = 0
            "#,
        )
        .bind(status.as_str())
        .bind(to_millis(&last_checked_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_monitor(id).await?.is_none() {
            return Err(StorageError::NotFound(format!("monitor {id}")));
        }

        Ok(())
    }

    async fn count_active_by_user(&self, user_id: &str) -> StorageResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM monitors WHERE user_id = ? AND is_deleted = 0")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    #[instrument(skip(self, monitor), fields(monitor_id = %monitor.id))]
    async fn insert_monitor(&self, monitor: Monitor) -> StorageResult<()> {
        let regions = serde_json::to_string(&monitor.regions)?;

        sqlx::query(
            r#"
            INSERT INTO monitors (
                id, user_id, url, method, expected_status, interval_minutes,
                timeout_secs, regions, is_paused, is_deleted, status, last_checked_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                url = excluded.url,
                method = excluded.method,
                expected_status = excluded.expected_status,
                interval_minutes = excluded.interval_minutes,
                timeout_secs = excluded.timeout_secs,
                regions = excluded.regions,
                is_paused = excluded.is_paused,
                is_deleted = excluded.is_deleted
            "#,
        )
        .bind(monitor.id.to_string())
        .bind(&monitor.user_id)
        .bind(&monitor.url)
        .bind(monitor.method.as_str())
        .bind(i64::from(monitor.expected_status))
        .bind(i64::from(monitor.interval_minutes))
        .bind(i64::from(monitor.timeout_secs))
        .bind(regions)
        .bind(monitor.is_paused)
        .bind(monitor.is_deleted)
        .bind(monitor.status.as_str())
        .bind(monitor.last_checked_at.as_ref().map(to_millis))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_paused(&self, id: MonitorId, paused: bool) -> StorageResult<()> {
        let status = if paused {
            MonitorStatus::Paused
        } else {
            MonitorStatus::Up
        };

        let result = sqlx::query("UPDATE monitors SET is_paused = ?, status = ? WHERE id = ?")
            .bind(paused)
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("monitor {id}")));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: MonitorId) -> StorageResult<()> {
        let result = sqlx::query("UPDATE monitors SET is_deleted = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("monitor {id}")));
        }
        Ok(())
    }

    async fn user_plan(&self, user_id: &str) -> StorageResult<Plan> {
        let plan: Option<(String,)> = sqlx::query_as("SELECT plan FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match plan {
            Some((plan,)) => Ok(plan.parse()?),
            None => Ok(Plan::Basic),
        }
    }

    async fn set_user_plan(&self, user_id: &str, plan: Plan) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO users (id, plan) VALUES (?, ?) ON CONFLICT (id) DO UPDATE SET plan = excluded.plan",
        )
        .bind(user_id)
        .bind(plan.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn append_result(&self, outcome: &ProbeOutcome) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO monitor_results (
                monitor_id, region, checked_at, is_up, status_code, response_time_ms, error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.monitor_id.to_string())
        .bind(&outcome.region)
        .bind(to_millis(&outcome.checked_at))
        .bind(outcome.up)
        .bind(outcome.status_code.map(i64::from))
        .bind(outcome.response_time_ms as i64)
        .bind(&outcome.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_results(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<ProbeOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT monitor_id, region, checked_at, is_up, status_code, response_time_ms, error_message
            FROM monitor_results
            WHERE monitor_id = ?
            ORDER BY checked_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(monitor_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut results = rows
            .iter()
            .map(outcome_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        // Reverse to get chronological order (oldest first)
        results.reverse();
        Ok(results)
    }

    async fn uptime(&self, monitor_id: MonitorId, since: DateTime<Utc>) -> StorageResult<UptimeStats> {
        let (total, up, avg): (i64, Option<i64>, Option<f64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(is_up), AVG(response_time_ms)
            FROM monitor_results
            WHERE monitor_id = ? AND checked_at >= ?
            "#,
        )
        .bind(monitor_id.to_string())
        .bind(to_millis(&since))
        .fetch_one(&self.pool)
        .await?;

        Ok(UptimeStats::from_counts(
            total as u64,
            up.unwrap_or(0) as u64,
            avg,
        ))
    }

    async fn append_log(&self, entry: MonitorLogEntry) -> StorageResult<()> {
        let meta = entry.meta.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO monitor_logs (monitor_id, region, level, message, meta, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.monitor_id.to_string())
        .bind(&entry.region)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(meta)
        .bind(to_millis(&entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, monitor_id: MonitorId) -> StorageResult<Vec<MonitorLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT region, level, message, meta, created_at
            FROM monitor_logs
            WHERE monitor_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(monitor_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level")?;
                let meta: Option<String> = row.try_get("meta")?;
                Ok(MonitorLogEntry {
                    monitor_id,
                    region: row.try_get("region")?,
                    level: level.parse()?,
                    message: row.try_get("message")?,
                    meta: meta.map(|m| serde_json::from_str(&m)).transpose()?,
                    created_at: from_millis(row.try_get("created_at")?),
                })
            })
            .collect()
    }
}

#[async_trait]
impl IncidentStore for SqliteStore {
    async fn find_open_incident(&self, monitor_id: MonitorId) -> StorageResult<Option<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE monitor_id = ? AND status != 'RESOLVED' \
             ORDER BY opened_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(monitor_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    #[instrument(skip(self, incident), fields(incident_id = %incident.id))]
    async fn create_incident(&self, incident: Incident) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO incidents (id, monitor_id, opened_at, resolved_at, status, summary, last_notified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(incident.id.to_string())
        .bind(incident.monitor_id.to_string())
        .bind(to_millis(&incident.opened_at))
        .bind(incident.resolved_at.as_ref().map(to_millis))
        .bind(incident.status.as_str())
        .bind(&incident.summary)
        .bind(incident.last_notified_at.as_ref().map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_incident(&self, incident: &Incident) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE incidents
            SET resolved_at = ?, status = ?, summary = ?, last_notified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(incident.resolved_at.as_ref().map(to_millis))
        .bind(incident.status.as_str())
        .bind(&incident.summary)
        .bind(incident.last_notified_at.as_ref().map(to_millis))
        .bind(incident.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("incident {}", incident.id)));
        }
        Ok(())
    }

    async fn list_incidents(&self, monitor_id: MonitorId) -> StorageResult<Vec<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE monitor_id = ? ORDER BY opened_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(monitor_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(incident_from_row).collect()
    }
}

#[async_trait]
impl RecipientStore for SqliteStore {
    async fn list_recipients(&self, monitor_id: MonitorId) -> StorageResult<Vec<AlertRecipient>> {
        let rows = sqlx::query("SELECT id, email FROM alert_recipients WHERE monitor_id = ?")
            .bind(monitor_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok(AlertRecipient {
                    id: parse_uuid(&id)?,
                    monitor_id,
                    email: row.try_get("email")?,
                })
            })
            .collect()
    }

    async fn count_recipients_by_user(&self, user_id: &str) -> StorageResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM alert_recipients r
            JOIN monitors m ON r.monitor_id = m.id
            WHERE m.user_id = ? AND m.is_deleted = 0
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn insert_recipient(&self, recipient: AlertRecipient) -> StorageResult<()> {
        sqlx::query("INSERT INTO alert_recipients (id, monitor_id, email) VALUES (?, ?, ?)")
            .bind(recipient.id.to_string())
            .bind(recipient.monitor_id.to_string())
            .bind(&recipient.email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
