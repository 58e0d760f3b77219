use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use jobflow_core::config::BackgroundJobServerConfig;
use jobflow_core::models::BackgroundJobServerStatus;
use jobflow_core::traits::{JobActivator, SimpleJobActivator, StorageProvider};
use jobflow_errors::{JobflowError, JobflowResult};

use crate::executor::JobExecutor;
use crate::filters::{ApplyStateFilter, ElectStateFilter, JobFilterChain};
use crate::janitor::JobJanitor;
use crate::orphan::OrphanJobDetector;
use crate::pollers::{EnqueuedJobsPoller, RecurringJobsPoller, ScheduledJobsPoller};
use crate::registry::ServerRegistry;
use crate::worker_pool::WorkerPool;

/// 后台任务服务器
///
/// 每台服务器拥有：一个驱动各轮询器的定时循环、W个工作槽、一个心跳
/// 循环。集群级职责（SCHEDULED翻转、周期任务物化、孤儿回收、保洁）
/// 只在本机当选主节点时执行。
pub struct BackgroundJobServer {
    server_id: String,
    config: BackgroundJobServerConfig,
    storage: Arc<dyn StorageProvider>,
    activator: Arc<dyn JobActivator>,
    filters: Arc<JobFilterChain>,
    registry: Arc<ServerRegistry>,
    running: RwLock<Option<RunningState>>,
}

struct RunningState {
    shutdown_tx: broadcast::Sender<()>,
    worker_pool: Arc<WorkerPool>,
    tasks: Vec<JoinHandle<()>>,
}

/// 服务器构建器
pub struct BackgroundJobServerBuilder {
    storage: Arc<dyn StorageProvider>,
    activator: Arc<dyn JobActivator>,
    config: BackgroundJobServerConfig,
    filters: JobFilterChain,
}

impl BackgroundJobServerBuilder {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            activator: Arc::new(SimpleJobActivator::new()),
            config: BackgroundJobServerConfig::default(),
            filters: JobFilterChain::new(),
        }
    }

    pub fn activator(mut self, activator: Arc<dyn JobActivator>) -> Self {
        self.activator = activator;
        self
    }

    pub fn config(mut self, config: BackgroundJobServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_elect_filter(mut self, filter: Arc<dyn ElectStateFilter>) -> Self {
        self.filters = self.filters.with_elect_filter(filter);
        self
    }

    pub fn with_apply_filter(mut self, filter: Arc<dyn ApplyStateFilter>) -> Self {
        self.filters = self.filters.with_apply_filter(filter);
        self
    }

    pub fn build(self) -> BackgroundJobServer {
        let server_id = generate_server_id();
        let status = BackgroundJobServerStatus::new(
            server_id.clone(),
            self.config.worker_pool_size,
            self.config.poll_interval.as_secs(),
        );
        let registry = Arc::new(ServerRegistry::new(Arc::clone(&self.storage), status));
        BackgroundJobServer {
            server_id,
            config: self.config,
            storage: self.storage,
            activator: self.activator,
            filters: Arc::new(self.filters),
            registry,
            running: RwLock::new(None),
        }
    }
}

impl BackgroundJobServer {
    pub fn builder(storage: Arc<dyn StorageProvider>) -> BackgroundJobServerBuilder {
        BackgroundJobServerBuilder::new(storage)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn is_running(&self) -> bool {
        self.running.read().await.is_some()
    }

    /// 启动服务器：公告存活、拉起轮询循环与心跳循环
    pub async fn start(&self) -> JobflowResult<()> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(JobflowError::config_error("服务器已在运行"));
        }
        if let Err(e) = self.config.validate() {
            // 嵌入与测试场景允许更激进的间隔，生产装配层应先行校验
            warn!("服务器 {} 配置未通过生产校验: {}", self.server_id, e);
        }

        self.registry.announce().await?;
        info!(
            "服务器 {} 启动，工作池 {}，轮询间隔 {:?}",
            self.server_id, self.config.worker_pool_size, self.config.poll_interval
        );

        let (shutdown_tx, _) = broadcast::channel(16);
        let worker_pool = Arc::new(WorkerPool::new(
            self.config.worker_pool_size,
            shutdown_tx.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(
            self.server_id.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.activator),
            Arc::clone(&self.filters),
            &self.config,
        ));

        let poll_task = self.spawn_poll_loop(
            Arc::clone(&worker_pool),
            executor,
            shutdown_tx.subscribe(),
        );
        let heartbeat_task = self.spawn_heartbeat_loop(shutdown_tx.subscribe());

        *running = Some(RunningState {
            shutdown_tx,
            worker_pool,
            tasks: vec![poll_task, heartbeat_task],
        });
        Ok(())
    }

    /// 优雅停机：不再认领新任务，协作取消在途任务体
    ///
    /// 在宽限期内自行了结的任务体正常提交；未了结的被放弃，经
    /// FAILED与重试过滤器回到SCHEDULED，由其他服务器接手。
    pub async fn stop(&self) -> JobflowResult<()> {
        let state = self.running.write().await.take();
        let Some(state) = state else {
            return Ok(());
        };

        info!("服务器 {} 开始优雅停机", self.server_id);
        let _ = state.shutdown_tx.send(());
        state.worker_pool.drain(self.config.stop_grace_period).await;
        for task in state.tasks {
            let _ = task.await;
        }
        self.registry.mark_stopped().await;
        info!("服务器 {} 已停止", self.server_id);
        Ok(())
    }

    fn spawn_poll_loop(
        &self,
        worker_pool: Arc<WorkerPool>,
        executor: Arc<JobExecutor>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let enqueued_poller = EnqueuedJobsPoller::new(
            self.server_id.clone(),
            Arc::clone(&self.storage),
            worker_pool,
            executor,
        );
        let scheduled_poller = ScheduledJobsPoller::new(
            Arc::clone(&self.storage),
            self.config.scheduled_jobs_batch_size,
        );
        let recurring_poller =
            RecurringJobsPoller::new(Arc::clone(&self.storage), self.config.poll_interval);
        let orphan_detector = OrphanJobDetector::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.filters),
            self.config.server_timeout(),
        );
        let janitor = JobJanitor::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.filters),
            self.config.delete_succeeded_jobs_after,
            self.config.permanently_delete_deleted_jobs_after,
        );
        let registry = Arc::clone(&self.registry);
        let poll_interval = self.config.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        enqueued_poller.tick().await;
                        if registry.is_master().await {
                            scheduled_poller.tick().await;
                            recurring_poller.tick().await;
                            orphan_detector.tick().await;
                            janitor.tick().await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("轮询循环收到停止信号");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let heartbeat_interval = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.signal_alive().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

impl Drop for BackgroundJobServer {
    fn drop(&mut self) {
        // 进程退出前尽力下发停止信号，在途任务由孤儿检测兜底
        if let Ok(running) = self.running.try_read() {
            if let Some(state) = running.as_ref() {
                let _ = state.shutdown_tx.send(());
            }
        }
    }
}

fn generate_server_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}
