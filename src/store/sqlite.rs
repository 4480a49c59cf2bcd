//! SQLite-backed relational store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::{CronError, Result};
use crate::scheduler::job::{JobKind, JobStatus};
use crate::store::{JobLog, JobRecord, RelationalStore, StatusUpdate};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        command TEXT NOT NULL,
        cron_expr TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 0,
        next_time TEXT,
        typ INTEGER NOT NULL DEFAULT 0,
        num INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER,
        job_name TEXT NOT NULL,
        command TEXT NOT NULL,
        output TEXT NOT NULL,
        err TEXT NOT NULL,
        plan_time TEXT NOT NULL,
        schedule_time TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        result INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logs_job_name ON logs (job_name)",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CronError::Internal(format!("invalid timestamp {value:?}: {e}")))
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let typ: i64 = row.try_get("typ")?;
    let kind = u8::try_from(typ)
        .map_err(|e| e.to_string())
        .and_then(JobKind::try_from)
        .map_err(CronError::Internal)?;
    let status_code: i64 = row.try_get("status")?;
    let status = JobStatus::from_code(status_code)
        .ok_or_else(|| CronError::Internal(format!("unknown status code {status_code}")))?;
    let next_time = row
        .try_get::<Option<String>, _>("next_time")?
        .map(|t| parse_time(&t))
        .transpose()?;

    Ok(JobRecord {
        name: row.try_get("name")?,
        command: row.try_get("command")?,
        cron_expr: row.try_get("cron_expr")?,
        kind,
        status,
        next_time,
        executions: row.try_get("num")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<JobLog> {
    Ok(JobLog {
        job_name: row.try_get("job_name")?,
        command: row.try_get("command")?,
        output: row.try_get("output")?,
        err: row.try_get("err")?,
        plan_time: parse_time(row.try_get("plan_time")?)?,
        schedule_time: parse_time(row.try_get("schedule_time")?)?,
        start_time: parse_time(row.try_get("start_time")?)?,
        end_time: parse_time(row.try_get("end_time")?)?,
        success: row.try_get::<i64, _>("result")? == 1,
    })
}

#[async_trait]
impl RelationalStore for SqliteStore {
    #[tracing::instrument(skip(self, update), fields(job = %update.job_name, status = %update.status))]
    async fn update_job_status(&self, update: &StatusUpdate) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, next_time = ?, num = num + ? WHERE name = ?")
            .bind(update.status.code())
            .bind(update.next_time.to_rfc3339())
            .bind(i64::from(update.increment))
            .bind(&update.job_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, logs), fields(count = logs.len()))]
    async fn insert_logs(&self, logs: &[JobLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO logs (job_id, job_name, command, output, err, plan_time, \
             schedule_time, start_time, end_time, result) ",
        );
        builder.push_values(logs, |mut row, log| {
            row.push("(SELECT id FROM jobs WHERE name = ")
                .push_bind_unseparated(log.job_name.clone())
                .push_unseparated(")")
                .push_bind(log.job_name.clone())
                .push_bind(log.command.clone())
                .push_bind(log.output.clone())
                .push_bind(log.err.clone())
                .push_bind(log.plan_time.to_rfc3339())
                .push_bind(log.schedule_time.to_rfc3339())
                .push_bind(log.start_time.to_rfc3339())
                .push_bind(log.end_time.to_rfc3339())
                .push_bind(i64::from(log.success));
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_logs(&self, job_name: &str, limit: u32) -> Result<Vec<JobLog>> {
        let rows = sqlx::query(
            r#"
            SELECT job_name, command, output, err, plan_time, schedule_time,
                   start_time, end_time, result
            FROM logs
            WHERE job_name = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(job_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT name, command, cron_expr, typ, status, next_time, num FROM jobs WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn upsert_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (name, command, cron_expr, typ, status, next_time, num)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                command = excluded.command,
                cron_expr = excluded.cron_expr,
                typ = excluded.typ,
                status = excluded.status,
                next_time = excluded.next_time,
                num = excluded.num
            "#,
        )
        .bind(&job.name)
        .bind(&job.command)
        .bind(&job.cron_expr)
        .bind(i64::from(u8::from(job.kind)))
        .bind(job.status.code())
        .bind(job.next_time.map(|t| t.to_rfc3339()))
        .bind(job.executions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
