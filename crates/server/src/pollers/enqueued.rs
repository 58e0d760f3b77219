use std::sync::Arc;

use tracing::{debug, error};

use jobflow_core::traits::{JobStorage, StorageProvider};

use crate::executor::JobExecutor;
use crate::worker_pool::WorkerPool;

/// ENQUEUED轮询器：把队列里的任务认领到本机并交给工作池
///
/// 每个tick最多认领 工作池大小 - 在途数量 个任务，认领竞争输掉的
/// 任务由对端服务器在它的下一个tick接手。
pub struct EnqueuedJobsPoller {
    server_id: String,
    storage: Arc<dyn StorageProvider>,
    worker_pool: Arc<WorkerPool>,
    executor: Arc<JobExecutor>,
}

impl EnqueuedJobsPoller {
    pub fn new(
        server_id: String,
        storage: Arc<dyn StorageProvider>,
        worker_pool: Arc<WorkerPool>,
        executor: Arc<JobExecutor>,
    ) -> Self {
        Self {
            server_id,
            storage,
            worker_pool,
            executor,
        }
    }

    pub async fn tick(&self) {
        let slots = self.worker_pool.available_slots().await;
        if slots == 0 {
            debug!("工作池无空闲槽位，本tick不认领任务");
            return;
        }

        match self.storage.get_jobs_to_process(&self.server_id, slots).await {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    debug!("本tick认领了 {} 个任务", jobs.len());
                }
                for job in jobs {
                    self.worker_pool
                        .submit(job, Arc::clone(&self.executor))
                        .await;
                }
            }
            Err(e) => {
                error!("认领ENQUEUED任务失败: {}", e);
            }
        }
    }
}
