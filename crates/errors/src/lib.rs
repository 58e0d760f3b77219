use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobflowError {
    #[error("任务的乐观并发写入冲突: {job_id}")]
    ConcurrentJobModification { job_id: Uuid },
    #[error("任务未找到: {id}")]
    JobNotFound { id: Uuid },
    #[error("周期任务定义未找到: {id}")]
    RecurringJobNotFound { id: String },
    #[error("存储后端错误: {0}")]
    Storage(String),
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务执行失败: {message}")]
    JobExecutionFailed { message: String },
    #[error("无法激活任务目标类型: {type_name}")]
    JobActivationFailed { type_name: String },
    #[error("非法的任务状态转换: {from} -> {to}")]
    IllegalJobStateChange { from: String, to: String },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("无效的时区: {zone}")]
    InvalidTimeZone { zone: String },
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type JobflowResult<T> = Result<T, JobflowError>;

impl JobflowError {
    pub fn concurrent_modification(job_id: Uuid) -> Self {
        Self::ConcurrentJobModification { job_id }
    }
    pub fn job_not_found(id: Uuid) -> Self {
        Self::JobNotFound { id }
    }
    pub fn recurring_job_not_found<S: Into<String>>(id: S) -> Self {
        Self::RecurringJobNotFound { id: id.into() }
    }
    pub fn storage_error<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 是否为乐观并发冲突，调用方可据此决定重试或放弃本次写入
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, JobflowError::ConcurrentJobModification { .. })
    }

    /// 该错误导致的任务失败是否不应再被重试过滤器调度
    pub fn should_not_retry_job(&self) -> bool {
        matches!(
            self,
            JobflowError::JobActivationFailed { .. } | JobflowError::Serialization(_)
        )
    }
}
