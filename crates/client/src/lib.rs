//! 任务提交门面：enqueue / schedule / scheduleRecurringly / delete。

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use jobflow_core::models::{Job, JobDescriptor, JobState, RecurringJob};
use jobflow_core::traits::{JobStorage, RecurringJobStorage, StorageProvider};
use jobflow_errors::{JobflowError, JobflowResult};

/// 流式入队的默认批量上限，约束大输入的内存占用
pub const DEFAULT_ENQUEUE_BATCH_SIZE: usize = 5000;

/// 计划执行时间，接受多种时间表示并统一归一化为UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleAt(DateTime<Utc>);

impl ScheduleAt {
    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for ScheduleAt {
    fn from(at: DateTime<Utc>) -> Self {
        Self(at)
    }
}

impl From<DateTime<Local>> for ScheduleAt {
    fn from(at: DateTime<Local>) -> Self {
        Self(at.with_timezone(&Utc))
    }
}

impl From<DateTime<FixedOffset>> for ScheduleAt {
    fn from(at: DateTime<FixedOffset>) -> Self {
        Self(at.with_timezone(&Utc))
    }
}

impl From<NaiveDateTime> for ScheduleAt {
    fn from(at: NaiveDateTime) -> Self {
        // 裸时间戳按本地时区解释；夏令时空洞取后一个有效时刻
        let local = Local
            .from_local_datetime(&at)
            .earliest()
            .unwrap_or_else(|| Local.from_utc_datetime(&at));
        Self(local.with_timezone(&Utc))
    }
}

/// 任务调度器，客户端从任意进程向存储提交任务
pub struct JobScheduler {
    storage: Arc<dyn StorageProvider>,
    batch_size: usize,
}

impl JobScheduler {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            batch_size: DEFAULT_ENQUEUE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// 立即入队，初始状态ENQUEUED
    pub async fn enqueue(&self, descriptor: JobDescriptor) -> JobflowResult<Uuid> {
        let job = self.storage.save(Job::new_enqueued(descriptor)).await?;
        debug!("任务 {} 已入队", job.id);
        Ok(job.id)
    }

    /// 流式批量入队
    ///
    /// 迭代器按批消费，每批经save_all一次落盘，大输入不会整体物化
    /// 在内存里。
    pub async fn enqueue_all<I>(&self, descriptors: I) -> JobflowResult<Vec<Uuid>>
    where
        I: IntoIterator<Item = JobDescriptor>,
    {
        let mut ids = Vec::new();
        let mut batch = Vec::with_capacity(self.batch_size.min(1024));
        for descriptor in descriptors {
            batch.push(Job::new_enqueued(descriptor));
            if batch.len() >= self.batch_size {
                let saved = self.storage.save_all(std::mem::take(&mut batch)).await?;
                ids.extend(saved.into_iter().map(|job| job.id));
            }
        }
        if !batch.is_empty() {
            let saved = self.storage.save_all(batch).await?;
            ids.extend(saved.into_iter().map(|job| job.id));
        }
        info!("批量入队 {} 个任务", ids.len());
        Ok(ids)
    }

    /// 定时执行，初始状态SCHEDULED(when)
    pub async fn schedule(
        &self,
        descriptor: JobDescriptor,
        when: impl Into<ScheduleAt>,
    ) -> JobflowResult<Uuid> {
        let at = when.into().instant();
        let job = self.storage.save(Job::new_scheduled(descriptor, at)).await?;
        debug!("任务 {} 已计划在 {} 执行", job.id, at);
        Ok(job.id)
    }

    /// 注册周期任务定义，相同id覆盖旧定义，返回定义id
    ///
    /// id缺省为描述符与CRON表达式的稳定摘要；时区缺省UTC。CRON与时区
    /// 在注册时严格校验，非法输入不会进入存储。
    pub async fn schedule_recurringly(
        &self,
        id: Option<String>,
        descriptor: JobDescriptor,
        cron_expression: &str,
        zone_id: Option<&str>,
    ) -> JobflowResult<String> {
        let recurring_job = RecurringJob::new(
            id,
            descriptor,
            cron_expression,
            zone_id.unwrap_or("UTC"),
        )?;
        let recurring_id = recurring_job.id.clone();
        self.storage.save_recurring_job(recurring_job).await?;
        info!("周期任务 {} 已注册: {}", recurring_id, cron_expression);
        Ok(recurring_id)
    }

    /// 删除周期任务定义；已物化的任务不受影响，自行执行或删除
    pub async fn delete_recurringly(&self, id: &str) -> JobflowResult<()> {
        self.storage.delete_recurring_job(id).await?;
        info!("周期任务定义 {} 已删除", id);
        Ok(())
    }

    /// 标记任务为DELETED；在途的PROCESSING任务体允许跑完，
    /// 其最终写入会输掉版本竞争而被丢弃
    pub async fn delete(&self, job_id: Uuid) -> JobflowResult<()> {
        // 与执行器心跳的版本竞争通过重读重试消解
        for _ in 0..3 {
            let mut job = self.storage.get_job_by_id(job_id).await?;
            job.transition_to(JobState::deleted("deleted by user request"))?;
            match self.storage.save(job).await {
                Ok(_) => {
                    info!("任务 {} 已标记删除", job_id);
                    return Ok(());
                }
                Err(e) if e.is_concurrency_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(JobflowError::concurrent_modification(job_id))
    }
}
