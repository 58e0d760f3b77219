use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use jobflow_core::models::{JobState, PageRequest, StateName};
use jobflow_core::traits::{JobStorage, StorageProvider};
use jobflow_errors::JobflowResult;

use crate::filters::JobFilterChain;

/// 任务保洁（仅主节点运行）
///
/// 超过保留期的SUCCEEDED任务转入DELETED，DELETED再过保留期后
/// 永久删除记录。
pub struct JobJanitor {
    storage: Arc<dyn StorageProvider>,
    filters: Arc<JobFilterChain>,
    delete_succeeded_jobs_after: Duration,
    permanently_delete_deleted_jobs_after: Duration,
}

impl JobJanitor {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        filters: Arc<JobFilterChain>,
        delete_succeeded_jobs_after: Duration,
        permanently_delete_deleted_jobs_after: Duration,
    ) -> Self {
        Self {
            storage,
            filters,
            delete_succeeded_jobs_after,
            permanently_delete_deleted_jobs_after,
        }
    }

    pub async fn tick(&self) {
        if let Err(e) = self.delete_expired_succeeded_jobs().await {
            error!("清理过期SUCCEEDED任务失败: {}", e);
        }
        if let Err(e) = self.permanently_delete_expired_jobs().await {
            error!("永久删除过期DELETED任务失败: {}", e);
        }
    }

    fn cutoff(retention: Duration) -> DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(36))
    }

    async fn delete_expired_succeeded_jobs(&self) -> JobflowResult<()> {
        let cutoff = Self::cutoff(self.delete_succeeded_jobs_after);
        let mut deleted = 0u64;
        loop {
            // 升序翻页，碰到保留期内的任务即可停止
            let jobs = self
                .storage
                .get_jobs(StateName::Succeeded, PageRequest::asc(0, 100))
                .await?;
            let expired: Vec<_> = jobs
                .into_iter()
                .take_while(|job| job.updated_at < cutoff)
                .collect();
            if expired.is_empty() {
                break;
            }
            for job in expired {
                match self
                    .filters
                    .commit(
                        self.storage.as_ref(),
                        job,
                        JobState::deleted("succeeded job retention expired"),
                    )
                    .await
                {
                    Ok(_) => deleted += 1,
                    Err(e) if e.is_concurrency_conflict() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        if deleted > 0 {
            info!("{} 个过期的SUCCEEDED任务已转入DELETED", deleted);
        }
        Ok(())
    }

    async fn permanently_delete_expired_jobs(&self) -> JobflowResult<()> {
        let cutoff = Self::cutoff(self.permanently_delete_deleted_jobs_after);
        let mut removed = 0u64;
        loop {
            let jobs = self
                .storage
                .get_jobs(StateName::Deleted, PageRequest::asc(0, 100))
                .await?;
            let expired: Vec<_> = jobs
                .into_iter()
                .take_while(|job| job.updated_at < cutoff)
                .collect();
            if expired.is_empty() {
                break;
            }
            for job in expired {
                if self.storage.delete_permanently(job.id).await? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("{} 个过期的DELETED任务已永久删除", removed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use jobflow_core::models::{Job, JobDescriptor};
    use jobflow_core::traits::JobStorage;
    use jobflow_storage::InMemoryStorageProvider;

    async fn a_succeeded_job(storage: &InMemoryStorageProvider, age: ChronoDuration) -> Job {
        let mut job = Job::new_enqueued(JobDescriptor::new("com.example.TestService", "do_work"));
        job.transition_to(JobState::processing("server-1")).unwrap();
        job.transition_to(JobState::succeeded(5, 10)).unwrap();
        job.updated_at = Utc::now() - age;
        storage.save(job).await.unwrap()
    }

    #[tokio::test]
    async fn test_expired_succeeded_jobs_are_deleted_then_purged() {
        let storage = Arc::new(InMemoryStorageProvider::new());
        let janitor = JobJanitor::new(
            Arc::clone(&storage) as Arc<dyn StorageProvider>,
            Arc::new(JobFilterChain::new()),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        );

        let expired = a_succeeded_job(&storage, ChronoDuration::hours(2)).await;
        let fresh = a_succeeded_job(&storage, ChronoDuration::zero()).await;

        janitor.tick().await;

        let expired_job = storage.get_job_by_id(expired.id).await.unwrap();
        assert_eq!(expired_job.state_name(), Some(StateName::Deleted));
        let fresh_job = storage.get_job_by_id(fresh.id).await.unwrap();
        assert_eq!(fresh_job.state_name(), Some(StateName::Succeeded));

        // 再把DELETED拨过保留期，下一个tick永久清除
        let mut expired_job = expired_job;
        expired_job.updated_at = Utc::now() - ChronoDuration::hours(3);
        storage.save(expired_job.clone()).await.unwrap();

        janitor.tick().await;
        assert!(storage.get_job_by_id(expired_job.id).await.is_err());
    }
}
