use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 服务器在存储中的存活公告，主节点选举与孤儿检测的依据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJobServerStatus {
    pub id: String,
    pub worker_pool_size: usize,
    pub poll_interval_seconds: u64,
    pub first_heartbeat: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub is_running: bool,
}

impl BackgroundJobServerStatus {
    pub fn new(id: impl Into<String>, worker_pool_size: usize, poll_interval_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            worker_pool_size,
            poll_interval_seconds,
            first_heartbeat: now,
            last_heartbeat: now,
            is_running: true,
        }
    }

    /// 最近一次心跳是否早于给定阈值
    pub fn timed_out(&self, heartbeat_older_than: DateTime<Utc>) -> bool {
        self.last_heartbeat < heartbeat_older_than
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timed_out() {
        let mut status = BackgroundJobServerStatus::new("server-1", 8, 15);
        status.last_heartbeat = Utc::now() - Duration::seconds(120);
        assert!(status.timed_out(Utc::now() - Duration::seconds(60)));
        assert!(!status.timed_out(Utc::now() - Duration::seconds(300)));
    }
}
