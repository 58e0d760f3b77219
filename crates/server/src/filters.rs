use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, warn};

use jobflow_core::models::{Job, JobState};
use jobflow_core::traits::{JobStorage, StorageProvider};
use jobflow_errors::JobflowResult;

/// 状态提交前的选举过滤器
///
/// elected为将要提交的状态：置None取消本次转换，替换则改写提交内容。
/// 提交完成后follow_up可给出需要追加的后续转换，典型如失败后的重试调度。
pub trait ElectStateFilter: Send + Sync {
    fn on_state_election(&self, job: &Job, elected: &mut Option<JobState>);

    fn follow_up(&self, _job: &Job) -> Option<JobState> {
        None
    }
}

/// 状态提交后的观察过滤器
pub trait ApplyStateFilter: Send + Sync {
    fn on_state_applied(&self, job: &Job);
}

/// 重试过滤器的默认最大重试次数
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// 内置重试过滤器
///
/// PROCESSING转入FAILED后，只要失败次数未超限且未禁止重试，就追加一条
/// SCHEDULED(now + 3^(n+1)秒 + [0,30)秒抖动)，n为此前FAILED记录数。
pub struct RetryFilter {
    max_retries: usize,
}

impl RetryFilter {
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }

    fn backoff_seconds(prior_failures: usize) -> i64 {
        let exponential = 3_i64.saturating_pow(prior_failures as u32 + 1);
        let jitter = rand::thread_rng().gen_range(0..30);
        exponential + jitter
    }
}

impl Default for RetryFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl ElectStateFilter for RetryFilter {
    fn on_state_election(&self, _job: &Job, _elected: &mut Option<JobState>) {}

    fn follow_up(&self, job: &Job) -> Option<JobState> {
        match job.current_state() {
            Some(JobState::Failed {
                do_not_retry: false,
                ..
            }) => {
                let failures = job.failure_count();
                if failures > self.max_retries {
                    warn!("任务 {} 已失败 {} 次，重试次数耗尽", job.id, failures);
                    return None;
                }
                let backoff = Self::backoff_seconds(failures.saturating_sub(1));
                let scheduled_at = Utc::now() + chrono::Duration::seconds(backoff);
                debug!(
                    "任务 {} 第 {} 次失败，{}秒后重试",
                    job.id, failures, backoff
                );
                Some(JobState::scheduled(scheduled_at))
            }
            _ => None,
        }
    }
}

/// 过滤器管线
///
/// 用户过滤器抛出的panic被捕获后记录并跳过，绝不拖垮工作线程。
pub struct JobFilterChain {
    elect_filters: Vec<Arc<dyn ElectStateFilter>>,
    apply_filters: Vec<Arc<dyn ApplyStateFilter>>,
}

impl Default for JobFilterChain {
    fn default() -> Self {
        Self {
            elect_filters: vec![Arc::new(RetryFilter::default())],
            apply_filters: Vec::new(),
        }
    }
}

impl JobFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 不带内置重试过滤器的空管线
    pub fn empty() -> Self {
        Self {
            elect_filters: Vec::new(),
            apply_filters: Vec::new(),
        }
    }

    pub fn with_elect_filter(mut self, filter: Arc<dyn ElectStateFilter>) -> Self {
        self.elect_filters.push(filter);
        self
    }

    pub fn with_apply_filter(mut self, filter: Arc<dyn ApplyStateFilter>) -> Self {
        self.apply_filters.push(filter);
        self
    }

    /// 经过管线提交一次状态转换，并处理过滤器追加的后续转换
    ///
    /// 每次转换单独落盘，版本号与状态历史一一对应。
    pub async fn commit(
        &self,
        storage: &dyn StorageProvider,
        mut job: Job,
        next: JobState,
    ) -> JobflowResult<Job> {
        let mut pending = Some(next);
        while let Some(state) = pending.take() {
            let mut elected = Some(state);
            for filter in &self.elect_filters {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    filter.on_state_election(&job, &mut elected)
                }));
                if outcome.is_err() {
                    error!("任务 {} 的状态选举过滤器panic，已跳过", job.id);
                }
            }
            let Some(state) = elected else {
                debug!("任务 {} 的状态转换被过滤器取消", job.id);
                break;
            };

            job.transition_to(state)?;
            job = storage.save(job).await?;

            for filter in &self.apply_filters {
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| filter.on_state_applied(&job)));
                if outcome.is_err() {
                    error!("任务 {} 的状态应用过滤器panic，已跳过", job.id);
                }
            }

            for filter in &self.elect_filters {
                if pending.is_none() {
                    pending = filter.follow_up(&job);
                }
            }
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::models::{JobDescriptor, StateName};
    use jobflow_storage::InMemoryStorageProvider;

    fn processing_job() -> Job {
        let mut job = Job::new_enqueued(JobDescriptor::new("com.example.TestService", "do_work"));
        job.transition_to(JobState::processing("server-1")).unwrap();
        job
    }

    #[test]
    fn test_backoff_is_exponential_with_bounded_jitter() {
        for prior_failures in 0..4 {
            let base = 3_i64.pow(prior_failures as u32 + 1);
            for _ in 0..50 {
                let backoff = RetryFilter::backoff_seconds(prior_failures);
                assert!(backoff >= base, "backoff {backoff} below base {base}");
                assert!(backoff < base + 30, "backoff {backoff} above jitter bound");
            }
        }
    }

    #[tokio::test]
    async fn test_failed_job_is_rescheduled_with_backoff() {
        let storage = InMemoryStorageProvider::new();
        let chain = JobFilterChain::new();

        let job = storage.save(processing_job()).await.unwrap();
        let before = Utc::now();
        let job = chain
            .commit(&storage, job, JobState::failed("boom", "TestError"))
            .await
            .unwrap();

        assert_eq!(
            job.state_names(),
            vec![
                StateName::Enqueued,
                StateName::Processing,
                StateName::Failed,
                StateName::Scheduled
            ]
        );
        let scheduled_at = job.scheduled_at().unwrap();
        assert!(scheduled_at >= before + chrono::Duration::seconds(3));
        assert!(scheduled_at <= before + chrono::Duration::seconds(3 + 30 + 1));
        // FAILED与SCHEDULED各自单独落盘
        assert_eq!(job.version as usize, job.state_history.len());
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_job_terminally_failed() {
        let storage = InMemoryStorageProvider::new();
        let chain = JobFilterChain {
            elect_filters: vec![Arc::new(RetryFilter::new(1))],
            apply_filters: Vec::new(),
        };

        // 第一次失败：重试
        let job = storage.save(processing_job()).await.unwrap();
        let job = chain
            .commit(&storage, job, JobState::failed("boom", "TestError"))
            .await
            .unwrap();
        assert_eq!(job.state_name(), Some(StateName::Scheduled));

        // 第二次失败：重试次数耗尽，停在FAILED
        let mut job = job;
        job.transition_to(JobState::enqueued()).unwrap();
        job.transition_to(JobState::processing("server-1")).unwrap();
        let job = storage.save(job).await.unwrap();
        let job = storage.save(job).await.unwrap(); // 心跳占位，版本继续前进
        let job = chain
            .commit(&storage, job, JobState::failed("boom", "TestError"))
            .await
            .unwrap();
        assert_eq!(job.state_name(), Some(StateName::Failed));
        assert_eq!(job.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_do_not_retry_is_respected() {
        let storage = InMemoryStorageProvider::new();
        let chain = JobFilterChain::new();

        let job = storage.save(processing_job()).await.unwrap();
        let job = chain
            .commit(
                &storage,
                job,
                JobState::failed_without_retry("no such type", "JobActivationFailed"),
            )
            .await
            .unwrap();
        assert_eq!(job.state_name(), Some(StateName::Failed));
    }

    #[tokio::test]
    async fn test_elect_filter_may_cancel_the_transition() {
        struct CancelEverything;
        impl ElectStateFilter for CancelEverything {
            fn on_state_election(&self, _job: &Job, elected: &mut Option<JobState>) {
                *elected = None;
            }
        }

        let storage = InMemoryStorageProvider::new();
        let chain = JobFilterChain::empty().with_elect_filter(Arc::new(CancelEverything));

        let job = storage.save(processing_job()).await.unwrap();
        let version = job.version;
        let job = chain
            .commit(&storage, job, JobState::succeeded(1, 1))
            .await
            .unwrap();
        assert_eq!(job.state_name(), Some(StateName::Processing));
        assert_eq!(job.version, version);
    }

    #[tokio::test]
    async fn test_panicking_filter_is_skipped() {
        struct Panicking;
        impl ElectStateFilter for Panicking {
            fn on_state_election(&self, _job: &Job, _elected: &mut Option<JobState>) {
                panic!("filter bug");
            }
        }
        struct Observed(std::sync::atomic::AtomicUsize);
        impl ApplyStateFilter for Observed {
            fn on_state_applied(&self, _job: &Job) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let storage = InMemoryStorageProvider::new();
        let observed = Arc::new(Observed(std::sync::atomic::AtomicUsize::new(0)));
        let chain = JobFilterChain::empty()
            .with_elect_filter(Arc::new(Panicking))
            .with_apply_filter(Arc::clone(&observed) as Arc<dyn ApplyStateFilter>);

        let job = storage.save(processing_job()).await.unwrap();
        let job = chain
            .commit(&storage, job, JobState::succeeded(1, 1))
            .await
            .unwrap();

        // panic的过滤器被跳过，转换照常提交并通知观察过滤器
        assert_eq!(job.state_name(), Some(StateName::Succeeded));
        assert_eq!(observed.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
