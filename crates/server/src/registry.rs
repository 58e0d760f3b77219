use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use jobflow_core::models::BackgroundJobServerStatus;
use jobflow_core::traits::{ServerStorage, StorageProvider};
use jobflow_errors::JobflowResult;

/// 服务器注册表
///
/// 周期性公告存活；主节点无须协调即可选出：存活服务器中
/// first_heartbeat最早者当选，相同时按id取小。非主节点只是在
/// 下一轮选举发现自己当选前跳过集群级职责。
pub struct ServerRegistry {
    storage: Arc<dyn StorageProvider>,
    status: RwLock<BackgroundJobServerStatus>,
}

impl ServerRegistry {
    pub fn new(storage: Arc<dyn StorageProvider>, status: BackgroundJobServerStatus) -> Self {
        Self {
            storage,
            status: RwLock::new(status),
        }
    }

    pub async fn server_id(&self) -> String {
        self.status.read().await.id.clone()
    }

    /// 启动时公告，重启会重置first_heartbeat重新排队
    pub async fn announce(&self) -> JobflowResult<()> {
        let mut status = self.status.write().await;
        let now = Utc::now();
        status.first_heartbeat = now;
        status.last_heartbeat = now;
        status.is_running = true;
        self.storage.announce(status.clone()).await
    }

    /// 刷新心跳；公告被清除过的服务器自动重新公告
    pub async fn signal_alive(&self) {
        let now = Utc::now();
        let server_id = {
            let mut status = self.status.write().await;
            status.last_heartbeat = now;
            status.id.clone()
        };

        if let Err(e) = self.storage.signal_alive(&server_id, now).await {
            warn!("服务器 {} 心跳失败({})，重新公告", server_id, e);
            if let Err(e) = self.storage.announce(self.status.read().await.clone()).await {
                error!("服务器 {} 重新公告失败: {}", server_id, e);
            }
        }
    }

    /// 本机是否为主节点
    pub async fn is_master(&self) -> bool {
        let server_id = self.server_id().await;
        match self.storage.get_longest_running_server_id().await {
            Ok(Some(master_id)) => {
                let is_master = master_id == server_id;
                debug!("当前主节点为 {}，本机{}", master_id, if is_master { "当选" } else { "待命" });
                is_master
            }
            Ok(None) => false,
            Err(e) => {
                error!("主节点选举查询失败: {}", e);
                false
            }
        }
    }

    /// 停机时把公告标记为未运行
    pub async fn mark_stopped(&self) {
        let status = {
            let mut status = self.status.write().await;
            status.is_running = false;
            status.last_heartbeat = Utc::now();
            status.clone()
        };
        if let Err(e) = self.storage.announce(status).await {
            error!("停机公告失败: {}", e);
        }
    }
}
