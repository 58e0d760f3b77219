use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// 任务运行上下文，注入到任务体的JobContext参数槽
///
/// 进度与元数据写入由执行器在心跳与最终落盘时合并进任务记录；
/// 取消信号是协作式的，任务体应在合适的位置主动检查。
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    job_name: String,
    cancelled: Arc<AtomicBool>,
    metadata: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl JobContext {
    pub fn new(job_id: Uuid, job_name: impl Into<String>) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// 协作式取消信号，任务体应在检查点之间轮询
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 写入任务元数据，例如进度备注
    pub fn save_metadata<T: Serialize>(&self, key: impl Into<String>, value: &T) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.metadata
                    .lock()
                    .expect("job context metadata lock poisoned")
                    .insert(key, value);
            }
            Err(e) => {
                warn!("任务 {} 的元数据 {} 序列化失败: {}", self.job_id, key, e);
            }
        }
    }

    /// 报告执行进度（0-100）
    pub fn report_progress(&self, percentage: u8) {
        self.save_metadata("progress", &percentage.min(100));
    }

    /// 执行器在落盘前取走的元数据快照
    pub fn metadata_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.metadata
            .lock()
            .expect("job context metadata lock poisoned")
            .clone()
    }
}
