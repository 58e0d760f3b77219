use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use jobflow_core::config::BackgroundJobServerConfig;
use jobflow_core::context::JobContext;
use jobflow_core::models::{Job, JobParameter, JobState};
use jobflow_core::traits::{JobActivator, JobStorage, StorageProvider};
use jobflow_errors::{JobflowError, JobflowResult};

use crate::filters::JobFilterChain;

/// 单个已认领任务的执行器
///
/// 任务体跑在独立的tokio任务里以隔离panic；执行期间按心跳间隔刷新
/// updated_at，任何退出路径都会经过滤器管线提交最终状态。
pub struct JobExecutor {
    server_id: String,
    storage: Arc<dyn StorageProvider>,
    activator: Arc<dyn JobActivator>,
    filters: Arc<JobFilterChain>,
    heartbeat_interval: Duration,
    stop_grace_period: Duration,
}

impl JobExecutor {
    pub fn new(
        server_id: String,
        storage: Arc<dyn StorageProvider>,
        activator: Arc<dyn JobActivator>,
        filters: Arc<JobFilterChain>,
        config: &BackgroundJobServerConfig,
    ) -> Self {
        Self {
            server_id,
            storage,
            activator,
            filters,
            heartbeat_interval: config.heartbeat_interval(),
            stop_grace_period: config.stop_grace_period,
        }
    }

    /// 执行任务，内部消化所有错误，工作线程绝不因任务体而死亡
    pub async fn perform(&self, job: Job, shutdown: broadcast::Receiver<()>) {
        let job_id = job.id;
        if let Err(e) = self.perform_inner(job, shutdown).await {
            if e.is_concurrency_conflict() {
                // 任务在执行期间被外部改写（例如显式删除），丢弃本地结果
                debug!("任务 {} 的最终状态写入输掉版本竞争，已丢弃", job_id);
            } else {
                error!("任务 {} 执行收尾失败: {}", job_id, e);
            }
        }
    }

    async fn perform_inner(
        &self,
        mut job: Job,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JobflowResult<()> {
        let ctx = JobContext::new(job.id, job.descriptor.readable_name());
        info!("开始执行任务 {}: {}", job.id, ctx.job_name());

        let Some(handler) = self.activator.activate(&job.descriptor.class_name) else {
            warn!(
                "激活器无法供给类型 {}，任务 {} 失败且不再重试",
                job.descriptor.class_name, job.id
            );
            let failed = JobState::failed_without_retry(
                format!("no handler for type {}", job.descriptor.class_name),
                "JobActivationFailed",
            );
            self.commit_final_state(job, &ctx, failed).await?;
            return Ok(());
        };

        let enqueued_at = job.last_enqueued_at();
        let started_at = job.processing_started_at().unwrap_or_else(Utc::now);

        // 任务体独立成任务，panic被JoinError捕获
        let method_name = job.descriptor.method_name.clone();
        let parameters: Vec<JobParameter> = job
            .descriptor
            .parameters
            .iter()
            .filter(|p| !p.is_job_context())
            .cloned()
            .collect();
        let body_ctx = ctx.clone();
        let mut body = tokio::spawn(async move {
            handler.call(&method_name, &parameters, body_ctx).await
        });

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                result = &mut body => break result,
                _ = heartbeat.tick() => {
                    job = self.heartbeat(job, &ctx).await;
                    if ctx.is_cancelled() {
                        debug!("任务 {} 已被外部取消，等待任务体了结", job.id);
                    }
                }
                _ = shutdown.recv() => {
                    info!("任务 {} 收到停止信号，进入协作取消", job.id);
                    ctx.cancel();
                    break tokio::select! {
                        result = &mut body => result,
                        _ = sleep(self.stop_grace_period) => {
                            warn!("任务 {} 未在宽限期内了结，放弃任务体", job.id);
                            body.abort();
                            (&mut body).await
                        }
                    };
                }
            }
        };

        let result: JobflowResult<()> = match outcome {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(JobflowError::JobExecutionFailed {
                message: "job body panicked".to_string(),
            }),
            Err(_) => Err(JobflowError::JobExecutionFailed {
                message: "job processing was stopped".to_string(),
            }),
        };

        let now = Utc::now();
        let final_state = match result {
            Ok(()) => {
                let latency_ms = enqueued_at
                    .map(|at| (started_at - at).num_milliseconds().max(0))
                    .unwrap_or(0);
                let duration_ms = (now - started_at).num_milliseconds().max(0);
                JobState::succeeded(latency_ms, duration_ms)
            }
            Err(e) => {
                let message = e.to_string();
                let error_type = error_type_of(&e);
                if e.should_not_retry_job() {
                    JobState::failed_without_retry(message, error_type)
                } else {
                    JobState::Failed {
                        created_at: now,
                        message,
                        error_type: error_type.to_string(),
                        error_details: Some(format!("{e:?}")),
                        do_not_retry: false,
                    }
                }
            }
        };

        self.commit_final_state(job, &ctx, final_state).await?;
        Ok(())
    }

    /// 心跳刷新：合并上下文元数据并保存，状态保持PROCESSING
    async fn heartbeat(&self, mut job: Job, ctx: &JobContext) -> Job {
        merge_metadata(&mut job, ctx);
        job.touch();
        match self.storage.save(job.clone()).await {
            Ok(saved) => saved,
            Err(e) if e.is_concurrency_conflict() => {
                // 外部写入抢先，读回最新版本；归属不再是本机时取消任务体
                match self.storage.get_job_by_id(job.id).await {
                    Ok(current) => {
                        if current.processing_server() != Some(self.server_id.as_str()) {
                            warn!(
                                "任务 {} 在执行期间被外部改写为 {:?}，取消本地执行",
                                job.id,
                                current.state_name()
                            );
                            ctx.cancel();
                        }
                        current
                    }
                    Err(e) => {
                        warn!("任务 {} 心跳后读回失败: {}", job.id, e);
                        job
                    }
                }
            }
            Err(e) => {
                warn!("任务 {} 心跳刷新失败: {}", job.id, e);
                job
            }
        }
    }

    async fn commit_final_state(
        &self,
        mut job: Job,
        ctx: &JobContext,
        final_state: JobState,
    ) -> JobflowResult<()> {
        merge_metadata(&mut job, ctx);
        let state_name = final_state.name();
        match self
            .filters
            .commit(self.storage.as_ref(), job, final_state)
            .await
        {
            Ok(job) => {
                if let Some(state) = job.state_name() {
                    info!("任务 {} 最终状态 {}", job.id, state);
                }
                Ok(())
            }
            Err(JobflowError::IllegalJobStateChange { from, to }) => {
                // 任务已被外部推进（例如删除后的终态），本地结果不再适用
                debug!("任务的最终转换 {from} -> {to} 不再合法（目标 {state_name}），已丢弃");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn merge_metadata(job: &mut Job, ctx: &JobContext) {
    for (key, value) in ctx.metadata_snapshot() {
        job.metadata.insert(key, value);
    }
}

fn error_type_of(e: &JobflowError) -> &'static str {
    match e {
        JobflowError::JobExecutionFailed { .. } => "JobExecutionFailed",
        JobflowError::JobActivationFailed { .. } => "JobActivationFailed",
        JobflowError::Storage(_) | JobflowError::Database(_) => "StorageException",
        JobflowError::Serialization(_) => "SerializationError",
        _ => "JobflowError",
    }
}
