use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use jobflow_core::models::{
    BackgroundJobServerStatus, Job, JobDescriptor, JobState, JobStats, PageRequest, RecurringJob,
    SortOrder, StateName,
};
use jobflow_core::traits::{JobStorage, RecurringJobStorage, ServerStorage};
use jobflow_errors::{JobflowError, JobflowResult};

use super::dialect::SqliteDialect;
use super::statement::{PreparedSql, Sql, SqlValue};

/// 基于sqlx/SQLite的持久化存储实现
///
/// 版本谓词通过语句构建器的previousVersion保留参数下推到UPDATE，
/// rows_affected不等于1即视为乐观并发冲突。
pub struct SqliteStorageProvider {
    pool: SqlitePool,
    dialect: SqliteDialect,
}

impl SqliteStorageProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            dialect: SqliteDialect,
        }
    }

    /// 连接数据库并初始化表结构
    ///
    /// 对`sqlite::memory:`连接池必须收敛到单连接，否则每个连接
    /// 各自持有独立的内存数据库。
    pub async fn connect(url: &str) -> JobflowResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(if url.contains(":memory:") { 1 } else { 5 })
            .connect(url)
            .await?;
        let provider = Self::new(pool);
        provider.create_tables().await?;
        Ok(provider)
    }

    /// 建表，幂等
    pub async fn create_tables(&self) -> JobflowResult<()> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS jobflow_jobs (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                scheduled_at TEXT,
                descriptor TEXT NOT NULL,
                state_history TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_jobflow_jobs_state_updated_at
                ON jobflow_jobs(state, updated_at)",
            "CREATE TABLE IF NOT EXISTS jobflow_recurring_jobs (
                id TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                zone_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS jobflow_servers (
                id TEXT PRIMARY KEY,
                worker_pool_size INTEGER NOT NULL,
                poll_interval_seconds INTEGER NOT NULL,
                first_heartbeat TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                is_running INTEGER NOT NULL
            )",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn job_sql(job: &Job) -> JobflowResult<Sql> {
        let state = job.state_name().ok_or_else(|| {
            JobflowError::validation_error(format!("任务 {} 的状态历史为空", job.id))
        })?;
        Ok(Sql::new()
            .with("id", job.id)
            .with("version", job.version)
            .with("state", state.to_string())
            .with("scheduledAt", job.scheduled_at())
            .with("descriptor", serde_json::to_string(&job.descriptor)?)
            .with("stateHistory", serde_json::to_string(&job.state_history)?)
            .with("metadata", serde_json::to_string(&job.metadata)?)
            .with("createdAt", job.created_at)
            .with("updatedAt", job.updated_at))
    }

    fn insert_job_statement(job: &Job) -> JobflowResult<PreparedSql> {
        Self::job_sql(job)?.insert(
            "into jobflow_jobs (id, version, state, scheduled_at, descriptor, state_history, metadata, created_at, updated_at) \
             values (:id, :version, :state, :scheduledAt, :descriptor, :stateHistory, :metadata, :createdAt, :updatedAt)",
        )
    }

    fn update_job_statement(job: &Job, previous_version: i32) -> JobflowResult<PreparedSql> {
        Self::job_sql(job)?
            .with_previous_version(previous_version)
            .update(
                "jobflow_jobs set version = :version, state = :state, scheduled_at = :scheduledAt, \
                 state_history = :stateHistory, metadata = :metadata, updated_at = :updatedAt \
                 where id = :id and version = :previousVersion",
            )
    }

    async fn execute(&self, prepared: &PreparedSql) -> JobflowResult<u64> {
        Ok(bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn fetch_jobs(&self, prepared: &PreparedSql) -> JobflowResult<Vec<Job>> {
        let rows = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    fn order_clause(order: SortOrder) -> &'static str {
        match order {
            SortOrder::UpdatedAtAsc => "order by updated_at asc",
            SortOrder::UpdatedAtDesc => "order by updated_at desc",
        }
    }
}

#[async_trait]
impl JobStorage for SqliteStorageProvider {
    async fn save(&self, mut job: Job) -> JobflowResult<Job> {
        job.validate()?;
        let previous = job.increase_version();
        if previous == 0 {
            let prepared = Self::insert_job_statement(&job)?;
            match bind_values(sqlx::query(&prepared.sql), &prepared.values)
                .execute(&self.pool)
                .await
            {
                Ok(_) => Ok(job),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(JobflowError::concurrent_modification(job.id))
                }
                Err(e) => Err(e.into()),
            }
        } else {
            let prepared = Self::update_job_statement(&job, previous)?;
            if self.execute(&prepared).await? != 1 {
                return Err(JobflowError::concurrent_modification(job.id));
            }
            Ok(job)
        }
    }

    async fn save_all(&self, jobs: Vec<Job>) -> JobflowResult<Vec<Job>> {
        // 单事务批量写入，任一行未命中版本谓词则整体回滚
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.validate()?;
            let previous = job.increase_version();
            let prepared = if previous == 0 {
                Self::insert_job_statement(&job)?
            } else {
                Self::update_job_statement(&job, previous)?
            };
            let affected = match bind_values(sqlx::query(&prepared.sql), &prepared.values)
                .execute(&mut *tx)
                .await
            {
                Ok(result) => result.rows_affected(),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tx.rollback().await?;
                    return Err(JobflowError::concurrent_modification(job.id));
                }
                Err(e) => return Err(e.into()),
            };
            if affected != 1 {
                tx.rollback().await?;
                return Err(JobflowError::concurrent_modification(job.id));
            }
            saved.push(job);
        }
        tx.commit().await?;
        Ok(saved)
    }

    async fn get_job_by_id(&self, id: Uuid) -> JobflowResult<Job> {
        let prepared = Sql::new()
            .with("id", id)
            .select("* from jobflow_jobs where id = :id")?;
        self.fetch_jobs(&prepared)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JobflowError::job_not_found(id))
    }

    async fn get_jobs(&self, state: StateName, page: PageRequest) -> JobflowResult<Vec<Job>> {
        let prepared = Sql::new()
            .with("state", state.to_string())
            .with_limit_and_offset(&self.dialect, page.limit as i64, page.offset as i64)
            .select(&format!(
                "* from jobflow_jobs where state = :state {}",
                Self::order_clause(page.order)
            ))?;
        self.fetch_jobs(&prepared).await
    }

    async fn count_jobs(&self, state: StateName) -> JobflowResult<u64> {
        let prepared = Sql::new()
            .with("state", state.to_string())
            .select_count("from jobflow_jobs where state = :state")?;
        let row = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    async fn get_job_stats(&self) -> JobflowResult<JobStats> {
        let prepared = Sql::new()
            .select("state, count(*) as cnt from jobflow_jobs group by state")?;
        let rows = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count = row.try_get::<i64, _>("cnt")? as u64;
            match state.parse::<StateName>()? {
                StateName::Scheduled => stats.scheduled = count,
                StateName::Enqueued => stats.enqueued = count,
                StateName::Processing => stats.processing = count,
                StateName::Succeeded => stats.succeeded = count,
                StateName::Failed => stats.failed = count,
                StateName::Deleted => stats.deleted = count,
            }
        }
        Ok(stats)
    }

    async fn delete_permanently(&self, id: Uuid) -> JobflowResult<bool> {
        let prepared = Sql::new()
            .with("id", id)
            .delete("from jobflow_jobs where id = :id")?;
        Ok(self.execute(&prepared).await? > 0)
    }

    async fn get_jobs_to_process(
        &self,
        server_id: &str,
        limit: usize,
    ) -> JobflowResult<Vec<Job>> {
        // 读出候选后逐个以版本谓词认领，输掉竞争的行留给对端服务器
        let candidates = self
            .get_jobs(StateName::Enqueued, PageRequest::asc(0, limit as u32))
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            job.transition_to(JobState::processing(server_id))?;
            match self.save(job).await {
                Ok(job) => claimed.push(job),
                Err(e) if e.is_concurrency_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        if !claimed.is_empty() {
            debug!("服务器 {} 认领了 {} 个任务", server_id, claimed.len());
        }
        Ok(claimed)
    }

    async fn get_scheduled_jobs(
        &self,
        before: DateTime<Utc>,
        page: PageRequest,
    ) -> JobflowResult<Vec<Job>> {
        let prepared = Sql::new()
            .with("state", StateName::Scheduled.to_string())
            .with("before", before)
            .with_limit_and_offset(&self.dialect, page.limit as i64, page.offset as i64)
            .select(&format!(
                "* from jobflow_jobs where state = :state and scheduled_at <= :before {}",
                Self::order_clause(page.order)
            ))?;
        self.fetch_jobs(&prepared).await
    }

    async fn recurring_job_instance_exists(
        &self,
        descriptor: &JobDescriptor,
        fire_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        states: &[StateName],
    ) -> JobflowResult<bool> {
        let prepared = Sql::new()
            .with("descriptor", serde_json::to_string(descriptor)?)
            .select("* from jobflow_jobs where descriptor = :descriptor")?;
        let jobs = self.fetch_jobs(&prepared).await?;
        Ok(jobs.into_iter().any(|job| {
            matches!(job.state_name(), Some(state) if states.contains(&state))
                && (job.has_scheduled_fire_at(fire_at) || job.created_at >= window_start)
        }))
    }
}

#[async_trait]
impl RecurringJobStorage for SqliteStorageProvider {
    async fn save_recurring_job(&self, recurring_job: RecurringJob) -> JobflowResult<()> {
        let prepared = Sql::new()
            .with("id", recurring_job.id.clone())
            .with("descriptor", serde_json::to_string(&recurring_job.descriptor)?)
            .with("cronExpression", recurring_job.cron_expression.clone())
            .with("zoneId", recurring_job.zone_id.clone())
            .with("createdAt", recurring_job.created_at)
            .insert(
                "or replace into jobflow_recurring_jobs (id, descriptor, cron_expression, zone_id, created_at) \
                 values (:id, :descriptor, :cronExpression, :zoneId, :createdAt)",
            )?;
        self.execute(&prepared).await?;
        Ok(())
    }

    async fn get_recurring_jobs(&self) -> JobflowResult<Vec<RecurringJob>> {
        let prepared = Sql::new().select("* from jobflow_recurring_jobs")?;
        let rows = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_recurring_job).collect()
    }

    async fn delete_recurring_job(&self, id: &str) -> JobflowResult<()> {
        let prepared = Sql::new()
            .with("id", id)
            .delete("from jobflow_recurring_jobs where id = :id")?;
        if self.execute(&prepared).await? == 0 {
            return Err(JobflowError::recurring_job_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerStorage for SqliteStorageProvider {
    async fn announce(&self, status: BackgroundJobServerStatus) -> JobflowResult<()> {
        let prepared = Sql::new()
            .with("id", status.id.clone())
            .with("workerPoolSize", status.worker_pool_size as i64)
            .with("pollIntervalSeconds", status.poll_interval_seconds as i64)
            .with("firstHeartbeat", status.first_heartbeat)
            .with("lastHeartbeat", status.last_heartbeat)
            .with("isRunning", status.is_running)
            .insert(
                "or replace into jobflow_servers (id, worker_pool_size, poll_interval_seconds, first_heartbeat, last_heartbeat, is_running) \
                 values (:id, :workerPoolSize, :pollIntervalSeconds, :firstHeartbeat, :lastHeartbeat, :isRunning)",
            )?;
        self.execute(&prepared).await?;
        Ok(())
    }

    async fn signal_alive(&self, server_id: &str, now: DateTime<Utc>) -> JobflowResult<()> {
        let prepared = Sql::new()
            .with("id", server_id)
            .with("lastHeartbeat", now)
            .update("jobflow_servers set last_heartbeat = :lastHeartbeat where id = :id")?;
        if self.execute(&prepared).await? == 0 {
            return Err(JobflowError::storage_error(format!(
                "server {server_id} has not announced itself"
            )));
        }
        Ok(())
    }

    async fn get_servers(&self) -> JobflowResult<Vec<BackgroundJobServerStatus>> {
        let prepared = Sql::new().select("* from jobflow_servers")?;
        let rows = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_server_status).collect()
    }

    async fn get_longest_running_server_id(&self) -> JobflowResult<Option<String>> {
        let prepared = Sql::new()
            .with_limit_and_offset(&self.dialect, 1, 0)
            .select("* from jobflow_servers order by first_heartbeat asc, id asc")?;
        let rows = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .first()
            .map(|row| row.try_get::<String, _>("id"))
            .transpose()?)
    }

    async fn get_servers_that_timed_out(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> JobflowResult<Vec<BackgroundJobServerStatus>> {
        let prepared = Sql::new()
            .with("threshold", heartbeat_older_than)
            .select("* from jobflow_servers where last_heartbeat < :threshold")?;
        let rows = bind_values(sqlx::query(&prepared.sql), &prepared.values)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_server_status).collect()
    }

    async fn remove_timed_out_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> JobflowResult<u64> {
        let prepared = Sql::new()
            .with("threshold", heartbeat_older_than)
            .delete("from jobflow_servers where last_heartbeat < :threshold")?;
        self.execute(&prepared).await
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_values<'q>(mut query: SqliteQuery<'q>, values: &'q [SqlValue]) -> SqliteQuery<'q> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Timestamp(v) => query.bind(format_timestamp(*v)),
            SqlValue::Boolean(v) => query.bind(*v),
        };
    }
    query
}

/// 定宽RFC3339（微秒、Z后缀），保证TEXT列上的字典序即时间序
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> JobflowResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| JobflowError::storage_error(format!("invalid timestamp {text}: {e}")))
}

fn row_to_job(row: &SqliteRow) -> JobflowResult<Job> {
    let id: String = row.try_get("id")?;
    let descriptor: JobDescriptor = serde_json::from_str(&row.try_get::<String, _>("descriptor")?)?;
    let state_history: Vec<JobState> =
        serde_json::from_str(&row.try_get::<String, _>("state_history")?)?;
    let metadata = serde_json::from_str(&row.try_get::<String, _>("metadata")?)?;

    Ok(Job {
        id: id
            .parse()
            .map_err(|e| JobflowError::storage_error(format!("invalid job id {id}: {e}")))?,
        version: row.try_get::<i64, _>("version")? as i32,
        descriptor,
        state_history,
        metadata,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_recurring_job(row: &SqliteRow) -> JobflowResult<RecurringJob> {
    Ok(RecurringJob {
        id: row.try_get("id")?,
        descriptor: serde_json::from_str(&row.try_get::<String, _>("descriptor")?)?,
        cron_expression: row.try_get("cron_expression")?,
        zone_id: row.try_get("zone_id")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_server_status(row: &SqliteRow) -> JobflowResult<BackgroundJobServerStatus> {
    Ok(BackgroundJobServerStatus {
        id: row.try_get("id")?,
        worker_pool_size: row.try_get::<i64, _>("worker_pool_size")? as usize,
        poll_interval_seconds: row.try_get::<i64, _>("poll_interval_seconds")? as u64,
        first_heartbeat: parse_timestamp(&row.try_get::<String, _>("first_heartbeat")?)?,
        last_heartbeat: parse_timestamp(&row.try_get::<String, _>("last_heartbeat")?)?,
        is_running: row.try_get("is_running")?,
    })
}
