use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobflow_core::models::Job;

use crate::executor::JobExecutor;

/// 固定大小的工作池
///
/// 认领端通过available_slots感知背压，每个tick最多取走空闲数量的任务。
/// 停止信号经广播通道下发，执行器负责协作取消；宽限期后仍未了结的
/// 任务体被放弃，由其他服务器按孤儿回收。
pub struct WorkerPool {
    size: usize,
    running: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(size: usize, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            size,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前空闲工作槽数量
    pub async fn available_slots(&self) -> usize {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        self.size.saturating_sub(running.len())
    }

    /// 当前在途任务数
    pub async fn in_flight(&self) -> usize {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        running.len()
    }

    /// 提交一个已认领的任务，池满时拒绝
    pub async fn submit(&self, job: Job, executor: Arc<JobExecutor>) -> bool {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.len() >= self.size {
            warn!("工作池已满，拒绝任务 {}", job.id);
            return false;
        }

        let job_id = job.id;
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            executor.perform(job, shutdown_rx).await;
        });
        running.insert(job_id, handle);
        debug!("任务 {} 已提交到工作池", job_id);
        true
    }

    /// 等待在途任务了结，宽限期外的任务被放弃
    ///
    /// 停止信号由服务器通过广播通道先行下发，这里只负责收尾。
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace + Duration::from_secs(2);
        loop {
            let remaining = self.in_flight().await;
            if remaining == 0 {
                info!("工作池已排空");
                return;
            }
            if Instant::now() >= deadline {
                let mut running = self.running.lock().await;
                warn!("宽限期结束，放弃 {} 个在途任务", running.len());
                for (_, handle) in running.drain() {
                    handle.abort();
                }
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}
