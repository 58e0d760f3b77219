use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use jobflow_core::models::{JobState, PageRequest};
use jobflow_core::traits::{JobStorage, StorageProvider};

/// SCHEDULED轮询器（仅主节点运行）：把到期任务翻转为ENQUEUED
///
/// 逐页处理直到没有到期任务或达到本tick的批量上限，剩余的留给
/// 下一个tick继续。翻转是带版本谓词的更新，冲突即跳过。
pub struct ScheduledJobsPoller {
    storage: Arc<dyn StorageProvider>,
    batch_size: u32,
}

impl ScheduledJobsPoller {
    pub fn new(storage: Arc<dyn StorageProvider>, batch_size: u32) -> Self {
        Self {
            storage,
            batch_size,
        }
    }

    pub async fn tick(&self) {
        let now = Utc::now();
        let mut processed: u32 = 0;

        while processed < self.batch_size {
            let limit = (self.batch_size - processed).min(100);
            // 翻转成功的任务会离开SCHEDULED结果集，始终从偏移0读取
            let page = PageRequest::asc(0, limit);
            let jobs = match self.storage.get_scheduled_jobs(now, page).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("查询到期的SCHEDULED任务失败: {}", e);
                    return;
                }
            };
            if jobs.is_empty() {
                return;
            }

            let fetched = jobs.len();
            let mut advanced = 0usize;
            for mut job in jobs {
                if job.transition_to(JobState::enqueued()).is_err() {
                    continue;
                }
                match self.storage.save(job).await {
                    Ok(job) => {
                        advanced += 1;
                        processed += 1;
                        debug!("到期任务 {} 已进入队列", job.id);
                    }
                    Err(e) if e.is_concurrency_conflict() => continue,
                    Err(e) => {
                        error!("翻转SCHEDULED任务失败: {}", e);
                        return;
                    }
                }
            }

            // 整页都没翻转成功说明全部输掉竞争或已被处理，避免空转
            if advanced == 0 && fetched > 0 {
                return;
            }
        }
    }
}
