use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use jobflow_core::models::{Job, JobState, PageRequest, StateName};
use jobflow_core::traits::{JobStorage, ServerStorage, StorageProvider};
use jobflow_errors::JobflowResult;

use crate::filters::JobFilterChain;

/// 孤儿任务检测器（仅主节点运行）
///
/// PROCESSING任务的归属服务器不在存活集合里，或updated_at早于服务器
/// 超时阈值，即视为孤儿：代亡机写入FAILED("server timed out")，再经
/// 重试过滤器通常会重新回到SCHEDULED。同时清除超时的服务器公告。
pub struct OrphanJobDetector {
    storage: Arc<dyn StorageProvider>,
    filters: Arc<JobFilterChain>,
    server_timeout: Duration,
}

impl OrphanJobDetector {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        filters: Arc<JobFilterChain>,
        server_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            filters,
            server_timeout,
        }
    }

    pub async fn tick(&self) {
        if let Err(e) = self.detect_and_reclaim().await {
            error!("孤儿任务检测失败: {}", e);
        }
    }

    async fn detect_and_reclaim(&self) -> JobflowResult<()> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.server_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let threshold = now - timeout;

        let live_servers: HashSet<String> = self
            .storage
            .get_servers()
            .await?
            .into_iter()
            .filter(|s| !s.timed_out(threshold))
            .map(|s| s.id)
            .collect();

        let processing = self.collect_processing_jobs().await?;
        for job in processing {
            let orphaned_by_server = job
                .processing_server()
                .map(|server_id| !live_servers.contains(server_id))
                .unwrap_or(false);
            let orphaned_by_staleness = job.updated_at < threshold;
            if !orphaned_by_server && !orphaned_by_staleness {
                continue;
            }

            warn!(
                "任务 {} 的服务器 {} 已失联，代写FAILED并交还重试管线",
                job.id,
                job.processing_server().unwrap_or("<unknown>")
            );
            let failed = JobState::failed("server timed out", "ServerTimedOut");
            match self.filters.commit(self.storage.as_ref(), job, failed).await {
                Ok(_) => {}
                Err(e) if e.is_concurrency_conflict() => {
                    // 归属服务器恰好又写入了，放过这个任务
                    continue;
                }
                Err(e) => error!("回收孤儿任务失败: {}", e),
            }
        }

        let removed = self.storage.remove_timed_out_servers(threshold).await?;
        if removed > 0 {
            info!("清除了 {} 个超时的服务器公告", removed);
        }
        Ok(())
    }

    async fn collect_processing_jobs(&self) -> JobflowResult<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut page = PageRequest::asc(0, 100);
        loop {
            let batch = self.storage.get_jobs(StateName::Processing, page).await?;
            let fetched = batch.len();
            jobs.extend(batch);
            if fetched < page.limit as usize {
                return Ok(jobs);
            }
            page = page.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use jobflow_core::models::{BackgroundJobServerStatus, JobDescriptor};
    use jobflow_core::traits::{JobStorage, ServerStorage};
    use jobflow_storage::InMemoryStorageProvider;

    async fn a_processing_job(
        storage: &InMemoryStorageProvider,
        server_id: &str,
        updated_ago: ChronoDuration,
    ) -> Job {
        let job = Job::new_enqueued(JobDescriptor::new("com.example.TestService", "do_work"));
        storage.save(job).await.unwrap();
        let mut job = storage
            .get_jobs_to_process(server_id, 1)
            .await
            .unwrap()
            .pop()
            .unwrap();
        // 把updated_at拨回过去，模拟心跳停摆
        job.updated_at = Utc::now() - updated_ago;
        storage.save(job).await.unwrap()
    }

    #[tokio::test]
    async fn test_job_of_dead_server_is_failed_then_rescheduled() {
        let storage = Arc::new(InMemoryStorageProvider::new());
        let detector = OrphanJobDetector::new(
            Arc::clone(&storage) as Arc<dyn StorageProvider>,
            Arc::new(JobFilterChain::new()),
            Duration::from_secs(60),
        );

        // 存活的服务器和它的新鲜任务
        storage
            .announce(BackgroundJobServerStatus::new("alive-server", 8, 15))
            .await
            .unwrap();
        let fresh = a_processing_job(&storage, "alive-server", ChronoDuration::zero()).await;

        // 死亡服务器的陈旧任务
        let stale = a_processing_job(&storage, "dead-server", ChronoDuration::minutes(2)).await;

        detector.tick().await;

        let fresh = storage.get_job_by_id(fresh.id).await.unwrap();
        assert_eq!(fresh.state_name(), Some(StateName::Processing));

        let stale = storage.get_job_by_id(stale.id).await.unwrap();
        assert_eq!(
            stale.state_names(),
            vec![
                StateName::Enqueued,
                StateName::Processing,
                StateName::Failed,
                StateName::Scheduled
            ]
        );
    }

    #[tokio::test]
    async fn test_timed_out_server_announcements_are_removed() {
        let storage = Arc::new(InMemoryStorageProvider::new());
        let detector = OrphanJobDetector::new(
            Arc::clone(&storage) as Arc<dyn StorageProvider>,
            Arc::new(JobFilterChain::new()),
            Duration::from_secs(60),
        );

        let mut dead = BackgroundJobServerStatus::new("dead-server", 8, 15);
        dead.last_heartbeat = Utc::now() - ChronoDuration::minutes(5);
        storage.announce(dead).await.unwrap();
        storage
            .announce(BackgroundJobServerStatus::new("alive-server", 8, 15))
            .await
            .unwrap();

        detector.tick().await;

        let servers = storage.get_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "alive-server");
    }
}
