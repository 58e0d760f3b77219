use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobflow_errors::JobflowResult;

use crate::models::{
    BackgroundJobServerStatus, Job, JobDescriptor, JobStats, PageRequest, RecurringJob, StateName,
};

/// 任务存储接口
///
/// 所有写操作都是单记录事务；save在version为0时创建记录，否则要求存储中的
/// 版本等于传入任务自增前的版本，不满足即报ConcurrentJobModification。
/// 内存实现与持久化实现必须表现出完全一致的并发语义。
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// 保存任务，内部完成版本自增与乐观并发校验，返回保存后的任务
    async fn save(&self, job: Job) -> JobflowResult<Job>;

    /// 批量保存，允许为吞吐分批执行，但遇到首个版本冲突必须整体失败
    async fn save_all(&self, jobs: Vec<Job>) -> JobflowResult<Vec<Job>>;

    /// 根据ID获取任务，不存在时报JobNotFound
    async fn get_job_by_id(&self, id: Uuid) -> JobflowResult<Job>;

    /// 按状态分页查询，按updated_at排序
    async fn get_jobs(&self, state: StateName, page: PageRequest) -> JobflowResult<Vec<Job>>;

    /// 统计指定状态的任务数量
    async fn count_jobs(&self, state: StateName) -> JobflowResult<u64>;

    /// 各状态任务数量统计
    async fn get_job_stats(&self) -> JobflowResult<JobStats>;

    /// 永久删除任务记录，返回是否存在
    async fn delete_permanently(&self, id: Uuid) -> JobflowResult<bool>;

    /// 原子地认领至多limit个ENQUEUED任务并转为PROCESSING(server_id)
    ///
    /// 不同服务器并发调用时，同一个任务绝不允许被两方同时认领。
    async fn get_jobs_to_process(&self, server_id: &str, limit: usize)
        -> JobflowResult<Vec<Job>>;

    /// 查询scheduled_at不晚于before的SCHEDULED任务
    async fn get_scheduled_jobs(
        &self,
        before: DateTime<Utc>,
        page: PageRequest,
    ) -> JobflowResult<Vec<Job>>;

    /// 周期任务去重探测：同一描述符是否已有命中该触发时刻的任务
    ///
    /// 命中条件：历史中存在scheduled_at等于fire_at的SCHEDULED记录，或任务
    /// 创建时间落在回看窗口（window_start之后）内；且当前状态属于states。
    async fn recurring_job_instance_exists(
        &self,
        descriptor: &JobDescriptor,
        fire_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        states: &[StateName],
    ) -> JobflowResult<bool>;
}

/// 周期任务定义存储接口
#[async_trait]
pub trait RecurringJobStorage: Send + Sync {
    /// 保存定义，相同id覆盖旧定义
    async fn save_recurring_job(&self, recurring_job: RecurringJob) -> JobflowResult<()>;

    /// 获取全部定义
    async fn get_recurring_jobs(&self) -> JobflowResult<Vec<RecurringJob>>;

    /// 删除定义，不存在时报RecurringJobNotFound
    async fn delete_recurring_job(&self, id: &str) -> JobflowResult<()>;
}

/// 服务器注册表存储接口
#[async_trait]
pub trait ServerStorage: Send + Sync {
    /// 写入或覆盖服务器公告
    async fn announce(&self, status: BackgroundJobServerStatus) -> JobflowResult<()>;

    /// 刷新服务器心跳，未知服务器报错，调用方应重新公告
    async fn signal_alive(&self, server_id: &str, now: DateTime<Utc>) -> JobflowResult<()>;

    /// 获取全部服务器公告
    async fn get_servers(&self) -> JobflowResult<Vec<BackgroundJobServerStatus>>;

    /// 运行最久的服务器id：first_heartbeat最小者，相同时按id取小
    ///
    /// 该id的持有者即主节点，负责集群级的定时职责。
    async fn get_longest_running_server_id(&self) -> JobflowResult<Option<String>>;

    /// 心跳早于阈值的服务器
    async fn get_servers_that_timed_out(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> JobflowResult<Vec<BackgroundJobServerStatus>>;

    /// 移除心跳早于阈值的服务器公告，返回移除数量
    async fn remove_timed_out_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> JobflowResult<u64>;
}

/// 完整存储能力，三组实体接口的聚合
pub trait StorageProvider: JobStorage + RecurringJobStorage + ServerStorage {}

impl<T: JobStorage + RecurringJobStorage + ServerStorage> StorageProvider for T {}
