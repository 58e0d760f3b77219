use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use jobflow_errors::JobflowResult;

use crate::context::JobContext;
use crate::models::JobParameter;

/// 任务目标类型的执行入口
///
/// 描述符里的方法名与参数在这里落地成真正的调用；JobContext参数槽
/// 不出现在parameters里，由执行器单独注入。
#[async_trait]
pub trait BackgroundJobHandler: Send + Sync {
    /// 目标类型的全限定名，与描述符的class_name对应
    fn type_name(&self) -> &str;

    /// 调用目标方法
    async fn call(
        &self,
        method_name: &str,
        parameters: &[JobParameter],
        ctx: JobContext,
    ) -> JobflowResult<()>;
}

/// 宿主提供的激活能力：按类型名供给目标实例
pub trait JobActivator: Send + Sync {
    fn activate(&self, type_name: &str) -> Option<Arc<dyn BackgroundJobHandler>>;
}

/// 基于注册表的默认激活器，相当于无参构造回退
#[derive(Default)]
pub struct SimpleJobActivator {
    handlers: HashMap<String, Arc<dyn BackgroundJobHandler>>,
}

impl SimpleJobActivator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个处理器，相同类型名覆盖旧注册
    pub fn register(mut self, handler: Arc<dyn BackgroundJobHandler>) -> Self {
        self.handlers
            .insert(handler.type_name().to_string(), handler);
        self
    }
}

impl JobActivator for SimpleJobActivator {
    fn activate(&self, type_name: &str) -> Option<Arc<dyn BackgroundJobHandler>> {
        self.handlers.get(type_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl BackgroundJobHandler for NoopHandler {
        fn type_name(&self) -> &str {
            "com.example.Noop"
        }

        async fn call(
            &self,
            _method_name: &str,
            _parameters: &[JobParameter],
            _ctx: JobContext,
        ) -> JobflowResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_activator_resolves_registered_types_only() {
        let activator = SimpleJobActivator::new().register(Arc::new(NoopHandler));
        assert!(activator.activate("com.example.Noop").is_some());
        assert!(activator.activate("com.example.Missing").is_none());
    }
}
