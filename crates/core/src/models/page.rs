use serde::{Deserialize, Serialize};

/// 分页排序方向，任务查询固定按updated_at排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    UpdatedAtAsc,
    UpdatedAtDesc,
}

/// 分页请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u32,
    pub order: SortOrder,
}

impl PageRequest {
    pub fn asc(offset: u64, limit: u32) -> Self {
        Self {
            offset,
            limit,
            order: SortOrder::UpdatedAtAsc,
        }
    }

    pub fn desc(offset: u64, limit: u32) -> Self {
        Self {
            offset,
            limit,
            order: SortOrder::UpdatedAtDesc,
        }
    }

    /// 下一页请求
    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit as u64,
            limit: self.limit,
            order: self.order,
        }
    }
}

/// 各状态任务数量统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub scheduled: u64,
    pub enqueued: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.scheduled + self.enqueued + self.processing + self.succeeded + self.failed
            + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_next() {
        let page = PageRequest::asc(0, 100);
        let next = page.next();
        assert_eq!(next.offset, 100);
        assert_eq!(next.limit, 100);
        assert_eq!(next.order, SortOrder::UpdatedAtAsc);
    }

    #[test]
    fn test_job_stats_total() {
        let stats = JobStats {
            scheduled: 1,
            enqueued: 2,
            processing: 3,
            succeeded: 4,
            failed: 5,
            deleted: 6,
        };
        assert_eq!(stats.total(), 21);
    }
}
