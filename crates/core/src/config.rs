use std::thread;
use std::time::Duration;

use jobflow_errors::{JobflowError, JobflowResult};

/// 轮询间隔下限（秒），生产配置校验时强制执行
pub const MIN_POLL_INTERVAL_SECONDS: u64 = 5;

/// 后台任务服务器配置
#[derive(Debug, Clone)]
pub struct BackgroundJobServerConfig {
    /// 工作池大小，默认与CPU核数挂钩
    pub worker_pool_size: usize,
    /// 轮询间隔，默认15秒，校验下限5秒
    pub poll_interval: Duration,
    /// 服务器超时为轮询间隔的倍数，默认4
    pub server_timeout_poll_interval_multiplicand: u32,
    /// SUCCEEDED任务的保留时长，过期转入DELETED
    pub delete_succeeded_jobs_after: Duration,
    /// DELETED任务的保留时长，过期永久删除
    pub permanently_delete_deleted_jobs_after: Duration,
    /// 调度轮询每个tick处理的批量上限
    pub scheduled_jobs_batch_size: u32,
    /// 优雅停机时等待在途任务的宽限期
    pub stop_grace_period: Duration,
}

impl Default for BackgroundJobServerConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            worker_pool_size: cpus * 8,
            poll_interval: Duration::from_secs(15),
            server_timeout_poll_interval_multiplicand: 4,
            delete_succeeded_jobs_after: Duration::from_secs(36 * 60 * 60),
            permanently_delete_deleted_jobs_after: Duration::from_secs(72 * 60 * 60),
            scheduled_jobs_batch_size: 1000,
            stop_grace_period: Duration::from_secs(10),
        }
    }
}

impl BackgroundJobServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置工作池大小
    pub fn worker_pool_size(mut self, worker_pool_size: usize) -> Self {
        self.worker_pool_size = worker_pool_size;
        self
    }

    /// 设置轮询间隔（秒）
    pub fn poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    /// 设置服务器超时倍数
    pub fn server_timeout_poll_interval_multiplicand(mut self, multiplicand: u32) -> Self {
        self.server_timeout_poll_interval_multiplicand = multiplicand;
        self
    }

    /// 设置SUCCEEDED任务保留时长
    pub fn delete_succeeded_jobs_after(mut self, after: Duration) -> Self {
        self.delete_succeeded_jobs_after = after;
        self
    }

    /// 设置DELETED任务保留时长
    pub fn permanently_delete_deleted_jobs_after(mut self, after: Duration) -> Self {
        self.permanently_delete_deleted_jobs_after = after;
        self
    }

    /// 服务器超时：超过该时长没有心跳即视为死亡
    pub fn server_timeout(&self) -> Duration {
        self.poll_interval * self.server_timeout_poll_interval_multiplicand
    }

    /// 任务心跳间隔：服务器超时的一半，下限1秒
    pub fn heartbeat_interval(&self) -> Duration {
        let half = self.server_timeout() / 2;
        half.max(Duration::from_secs(1))
    }

    /// 生产环境的配置校验，装配层在启动服务器前调用
    pub fn validate(&self) -> JobflowResult<()> {
        if self.worker_pool_size == 0 {
            return Err(JobflowError::config_error("worker_pool_size 必须大于0"));
        }
        if self.poll_interval < Duration::from_secs(MIN_POLL_INTERVAL_SECONDS) {
            return Err(JobflowError::config_error(format!(
                "poll_interval 不能小于 {MIN_POLL_INTERVAL_SECONDS} 秒"
            )));
        }
        if self.server_timeout_poll_interval_multiplicand == 0 {
            return Err(JobflowError::config_error(
                "server_timeout_poll_interval_multiplicand 必须大于0",
            ));
        }
        if self.scheduled_jobs_batch_size == 0 {
            return Err(JobflowError::config_error(
                "scheduled_jobs_batch_size 必须大于0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BackgroundJobServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_pool_size >= 8);
        assert_eq!(config.poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_derived_timeouts() {
        let config = BackgroundJobServerConfig::new().poll_interval_seconds(15);
        assert_eq!(config.server_timeout(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));

        // 极小的轮询间隔下心跳间隔被钳制在1秒
        let mut config = BackgroundJobServerConfig::default();
        config.poll_interval = Duration::from_millis(200);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_short_poll_interval() {
        let config = BackgroundJobServerConfig::new().poll_interval_seconds(2);
        let err = config.validate().expect_err("must reject");
        assert!(matches!(err, JobflowError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_empty_worker_pool() {
        let config = BackgroundJobServerConfig::new().worker_pool_size(0);
        assert!(config.validate().is_err());
    }
}
