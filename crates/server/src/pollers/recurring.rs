use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use jobflow_core::models::{Job, RecurringJob, StateName};
use jobflow_core::traits::{JobStorage, RecurringJobStorage, StorageProvider};
use jobflow_errors::JobflowResult;

/// 去重探测覆盖的状态集合
const MATERIALIZED_STATES: [StateName; 4] = [
    StateName::Scheduled,
    StateName::Enqueued,
    StateName::Processing,
    StateName::Succeeded,
];

/// 周期任务轮询器（仅主节点运行）：把CRON定义物化成具体任务
///
/// 每个tick从上个tick的窗口起点求下一次触发时刻：太远的跳过，窗口内
/// 的先做去重探测再落盘；触发时刻已过的直接以ENQUEUED创建，省掉一个
/// tick的延迟。删除定义不会追溯删除已物化的任务。
pub struct RecurringJobsPoller {
    storage: Arc<dyn StorageProvider>,
    poll_interval: Duration,
}

impl RecurringJobsPoller {
    pub fn new(storage: Arc<dyn StorageProvider>, poll_interval: Duration) -> Self {
        Self {
            storage,
            poll_interval,
        }
    }

    pub async fn tick(&self) {
        let recurring_jobs = match self.storage.get_recurring_jobs().await {
            Ok(recurring_jobs) => recurring_jobs,
            Err(e) => {
                error!("读取周期任务定义失败: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for recurring_job in recurring_jobs {
            if let Err(e) = self.materialize(&recurring_job, now).await {
                error!("物化周期任务 {} 失败: {}", recurring_job.id, e);
            }
        }
    }

    async fn materialize(
        &self,
        recurring_job: &RecurringJob,
        now: DateTime<Utc>,
    ) -> JobflowResult<()> {
        let poll_interval = chrono::Duration::from_std(self.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(15));

        // 从上个tick的起点求触发时刻，刚刚错过的触发点仍然会被物化
        let Some(fire_at) = recurring_job.next_run(now - poll_interval)? else {
            debug!("周期任务 {} 没有下一次触发时刻", recurring_job.id);
            return Ok(());
        };

        if fire_at > now + poll_interval * 2 {
            return Ok(());
        }

        let window_start = fire_at - poll_interval * 2;
        let exists = self
            .storage
            .recurring_job_instance_exists(
                &recurring_job.descriptor,
                fire_at,
                window_start,
                &MATERIALIZED_STATES,
            )
            .await?;
        if exists {
            debug!(
                "周期任务 {} 在触发时刻 {} 已有实例，跳过",
                recurring_job.id, fire_at
            );
            return Ok(());
        }

        let job = if fire_at <= now {
            Job::new_enqueued(recurring_job.descriptor.clone())
        } else {
            Job::new_scheduled(recurring_job.descriptor.clone(), fire_at)
        };
        let job = self.storage.save(job).await?;
        info!(
            "周期任务 {} 物化为任务 {}，触发时刻 {}",
            recurring_job.id, job.id, fire_at
        );
        Ok(())
    }
}
