use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobflow_errors::{JobflowError, JobflowResult};

use super::descriptor::JobDescriptor;

/// 任务状态标签，用于存储查询与状态机校验
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateName {
    Scheduled,
    Enqueued,
    Processing,
    Succeeded,
    Failed,
    Deleted,
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateName::Scheduled => "SCHEDULED",
            StateName::Enqueued => "ENQUEUED",
            StateName::Processing => "PROCESSING",
            StateName::Succeeded => "SUCCEEDED",
            StateName::Failed => "FAILED",
            StateName::Deleted => "DELETED",
        };
        write!(f, "{name}")
    }
}

impl FromStr for StateName {
    type Err = JobflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(StateName::Scheduled),
            "ENQUEUED" => Ok(StateName::Enqueued),
            "PROCESSING" => Ok(StateName::Processing),
            "SUCCEEDED" => Ok(StateName::Succeeded),
            "FAILED" => Ok(StateName::Failed),
            "DELETED" => Ok(StateName::Deleted),
            other => Err(JobflowError::internal(format!("未知的任务状态: {other}"))),
        }
    }
}

/// 任务状态记录，每条记录都带有自身的创建时间与状态专属字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Scheduled {
        created_at: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
    },
    Enqueued {
        created_at: DateTime<Utc>,
    },
    Processing {
        created_at: DateTime<Utc>,
        server_id: String,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        created_at: DateTime<Utc>,
        latency_ms: i64,
        duration_ms: i64,
    },
    Failed {
        created_at: DateTime<Utc>,
        message: String,
        error_type: String,
        error_details: Option<String>,
        do_not_retry: bool,
    },
    Deleted {
        created_at: DateTime<Utc>,
        reason: String,
    },
}

impl JobState {
    pub fn scheduled(scheduled_at: DateTime<Utc>) -> Self {
        JobState::Scheduled {
            created_at: Utc::now(),
            scheduled_at,
        }
    }

    pub fn enqueued() -> Self {
        JobState::Enqueued {
            created_at: Utc::now(),
        }
    }

    pub fn processing(server_id: impl Into<String>) -> Self {
        let now = Utc::now();
        JobState::Processing {
            created_at: now,
            server_id: server_id.into(),
            started_at: now,
        }
    }

    pub fn succeeded(latency_ms: i64, duration_ms: i64) -> Self {
        JobState::Succeeded {
            created_at: Utc::now(),
            latency_ms,
            duration_ms,
        }
    }

    pub fn failed(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        JobState::Failed {
            created_at: Utc::now(),
            message: message.into(),
            error_type: error_type.into(),
            error_details: None,
            do_not_retry: false,
        }
    }

    pub fn failed_without_retry(
        message: impl Into<String>,
        error_type: impl Into<String>,
    ) -> Self {
        JobState::Failed {
            created_at: Utc::now(),
            message: message.into(),
            error_type: error_type.into(),
            error_details: None,
            do_not_retry: true,
        }
    }

    pub fn deleted(reason: impl Into<String>) -> Self {
        JobState::Deleted {
            created_at: Utc::now(),
            reason: reason.into(),
        }
    }

    /// 当前记录对应的状态标签
    pub fn name(&self) -> StateName {
        match self {
            JobState::Scheduled { .. } => StateName::Scheduled,
            JobState::Enqueued { .. } => StateName::Enqueued,
            JobState::Processing { .. } => StateName::Processing,
            JobState::Succeeded { .. } => StateName::Succeeded,
            JobState::Failed { .. } => StateName::Failed,
            JobState::Deleted { .. } => StateName::Deleted,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            JobState::Scheduled { created_at, .. }
            | JobState::Enqueued { created_at }
            | JobState::Processing { created_at, .. }
            | JobState::Succeeded { created_at, .. }
            | JobState::Failed { created_at, .. }
            | JobState::Deleted { created_at, .. } => *created_at,
        }
    }
}

/// 后台任务实体，状态历史仅允许追加，版本号用于乐观并发控制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub version: i32,
    pub descriptor: JobDescriptor,
    pub state_history: Vec<JobState>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// 创建初始状态为ENQUEUED的任务
    pub fn new_enqueued(descriptor: JobDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 0,
            descriptor,
            state_history: vec![JobState::Enqueued { created_at: now }],
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 创建初始状态为SCHEDULED的任务
    pub fn new_scheduled(descriptor: JobDescriptor, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 0,
            descriptor,
            state_history: vec![JobState::Scheduled {
                created_at: now,
                scheduled_at,
            }],
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 从给定的状态历史组装任务，历史必须非空且逐对合法
    ///
    /// 测试构建器等需要拼装任意历史的调用方从这里进入，
    /// 非法历史在组装时就被拒绝。
    pub fn from_history(
        descriptor: JobDescriptor,
        state_history: Vec<JobState>,
    ) -> JobflowResult<Self> {
        let now = Utc::now();
        let job = Self {
            id: Uuid::new_v4(),
            version: 0,
            descriptor,
            state_history,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        job.validate()?;
        Ok(job)
    }

    /// 校验状态历史：非空、首个状态为SCHEDULED或ENQUEUED、逐对合法
    ///
    /// 存储实现在保存前调用，拼装出来的非法任务进不了存储。
    pub fn validate(&self) -> JobflowResult<()> {
        let mut names = self.state_history.iter().map(JobState::name);
        let Some(first) = names.next() else {
            return Err(JobflowError::validation_error(format!(
                "任务 {} 的状态历史为空",
                self.id
            )));
        };
        if !matches!(first, StateName::Scheduled | StateName::Enqueued) {
            return Err(JobflowError::validation_error(format!(
                "任务 {} 的首个状态必须是SCHEDULED或ENQUEUED，实际为 {first}",
                self.id
            )));
        }
        let mut from = first;
        for to in names {
            if !Self::is_legal_transition(from, to) {
                return Err(JobflowError::IllegalJobStateChange {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            from = to;
        }
        Ok(())
    }

    /// 当前状态记录；空历史的任务无法通过校验，这里仍不假设非空
    pub fn current_state(&self) -> Option<&JobState> {
        self.state_history.last()
    }

    pub fn state_name(&self) -> Option<StateName> {
        self.current_state().map(JobState::name)
    }

    pub fn has_state(&self, state: StateName) -> bool {
        self.state_name() == Some(state)
    }

    /// 状态机合法转换表，是状态历史唯一允许的推进方式
    pub fn is_legal_transition(from: StateName, to: StateName) -> bool {
        use StateName::*;
        matches!(
            (from, to),
            (Scheduled, Enqueued)
                | (Enqueued, Processing)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Failed, Scheduled)
                | (Scheduled, Deleted)
                | (Enqueued, Deleted)
                | (Processing, Deleted)
                | (Failed, Deleted)
                | (Succeeded, Deleted)
        )
    }

    /// 追加一条状态记录，拒绝非法转换，从不改写历史
    ///
    /// 空历史只接受SCHEDULED或ENQUEUED作为首个状态。
    pub fn transition_to(&mut self, next: JobState) -> JobflowResult<()> {
        let to = next.name();
        let legal = match self.state_name() {
            Some(from) => Self::is_legal_transition(from, to),
            None => matches!(to, StateName::Scheduled | StateName::Enqueued),
        };
        if !legal {
            let from = self
                .state_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "NONE".to_string());
            return Err(JobflowError::IllegalJobStateChange {
                from,
                to: to.to_string(),
            });
        }
        self.state_history.push(next);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 心跳刷新，仅更新updated_at，状态保持不变
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 版本号加一并返回旧值，存储实现以旧值作为乐观并发谓词
    pub fn increase_version(&mut self) -> i32 {
        let previous = self.version;
        self.version += 1;
        previous
    }

    /// 历史中FAILED记录的数量，重试过滤器据此计算退避
    pub fn failure_count(&self) -> usize {
        self.state_history
            .iter()
            .filter(|s| matches!(s, JobState::Failed { .. }))
            .count()
    }

    /// 当前处于SCHEDULED状态时的计划执行时间
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self.current_state() {
            Some(JobState::Scheduled { scheduled_at, .. }) => Some(*scheduled_at),
            _ => None,
        }
    }

    /// 历史中任意SCHEDULED记录是否命中给定的触发时刻
    pub fn has_scheduled_fire_at(&self, fire_at: DateTime<Utc>) -> bool {
        self.state_history.iter().any(|s| {
            matches!(s, JobState::Scheduled { scheduled_at, .. } if *scheduled_at == fire_at)
        })
    }

    /// 当前持有该任务的服务器，仅PROCESSING状态有归属
    pub fn processing_server(&self) -> Option<&str> {
        match self.current_state() {
            Some(JobState::Processing { server_id, .. }) => Some(server_id.as_str()),
            _ => None,
        }
    }

    /// 最近一次进入ENQUEUED的时间，用于计算执行延迟
    pub fn last_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.state_history.iter().rev().find_map(|s| match s {
            JobState::Enqueued { created_at } => Some(*created_at),
            _ => None,
        })
    }

    /// 最近一次进入PROCESSING的时间
    pub fn processing_started_at(&self) -> Option<DateTime<Utc>> {
        self.state_history.iter().rev().find_map(|s| match s {
            JobState::Processing { started_at, .. } => Some(*started_at),
            _ => None,
        })
    }

    /// 当前FAILED记录是否禁止重试
    pub fn retry_forbidden(&self) -> bool {
        matches!(
            self.current_state(),
            Some(JobState::Failed {
                do_not_retry: true,
                ..
            })
        )
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    /// 状态历史的标签序列，测试断言用
    pub fn state_names(&self) -> Vec<StateName> {
        self.state_history.iter().map(JobState::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_descriptor() -> JobDescriptor {
        JobDescriptor::new("com.example.TestService", "do_work")
    }

    #[test]
    fn test_new_job_starts_with_single_state() {
        let job = Job::new_enqueued(a_descriptor());
        assert_eq!(job.version, 0);
        assert_eq!(job.state_names(), vec![StateName::Enqueued]);

        let at = Utc::now() + chrono::Duration::seconds(30);
        let job = Job::new_scheduled(a_descriptor(), at);
        assert_eq!(job.state_names(), vec![StateName::Scheduled]);
        assert_eq!(job.scheduled_at(), Some(at));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new_enqueued(a_descriptor());
        job.transition_to(JobState::processing("server-1")).unwrap();
        assert_eq!(job.processing_server(), Some("server-1"));

        job.transition_to(JobState::succeeded(10, 20)).unwrap();
        assert_eq!(
            job.state_names(),
            vec![
                StateName::Enqueued,
                StateName::Processing,
                StateName::Succeeded
            ]
        );
    }

    #[test]
    fn test_retry_path_appends_failed_then_scheduled() {
        let mut job = Job::new_enqueued(a_descriptor());
        job.transition_to(JobState::processing("server-1")).unwrap();
        job.transition_to(JobState::failed("boom", "TestError"))
            .unwrap();
        job.transition_to(JobState::scheduled(Utc::now())).unwrap();

        assert_eq!(job.failure_count(), 1);
        assert_eq!(
            job.state_names(),
            vec![
                StateName::Enqueued,
                StateName::Processing,
                StateName::Failed,
                StateName::Scheduled
            ]
        );
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut job = Job::new_enqueued(a_descriptor());
        // ENQUEUED不能直接成功
        let err = job
            .transition_to(JobState::succeeded(1, 1))
            .expect_err("must reject");
        assert!(matches!(err, JobflowError::IllegalJobStateChange { .. }));

        job.transition_to(JobState::processing("server-1")).unwrap();
        job.transition_to(JobState::succeeded(1, 1)).unwrap();
        // 终态SUCCEEDED只允许进入DELETED
        assert!(job.transition_to(JobState::enqueued()).is_err());
        assert!(job.transition_to(JobState::deleted("gc")).is_ok());
        assert!(job.transition_to(JobState::enqueued()).is_err());
    }

    #[test]
    fn test_any_non_terminal_state_can_be_deleted() {
        for build in [
            Job::new_enqueued(a_descriptor()),
            Job::new_scheduled(a_descriptor(), Utc::now()),
        ] {
            let mut job = build;
            assert!(job
                .transition_to(JobState::deleted("requested by user"))
                .is_ok());
        }

        let mut job = Job::new_enqueued(a_descriptor());
        job.transition_to(JobState::processing("server-1")).unwrap();
        assert!(job.transition_to(JobState::deleted("requested")).is_ok());
    }

    #[test]
    fn test_from_history_rejects_illegal_histories() {
        // 空历史
        let err = Job::from_history(a_descriptor(), vec![]).expect_err("must reject");
        assert!(matches!(err, JobflowError::Validation(_)));

        // 首个状态必须是SCHEDULED或ENQUEUED
        let err = Job::from_history(a_descriptor(), vec![JobState::processing("server-1")])
            .expect_err("must reject");
        assert!(matches!(err, JobflowError::Validation(_)));

        // 相邻状态逐对校验
        let err = Job::from_history(
            a_descriptor(),
            vec![JobState::enqueued(), JobState::succeeded(1, 1)],
        )
        .expect_err("must reject");
        assert!(matches!(err, JobflowError::IllegalJobStateChange { .. }));

        // 合法历史原样接受
        let job = Job::from_history(
            a_descriptor(),
            vec![JobState::enqueued(), JobState::processing("server-1")],
        )
        .unwrap();
        assert_eq!(job.version, 0);
        assert_eq!(
            job.state_names(),
            vec![StateName::Enqueued, StateName::Processing]
        );
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_empty_history_only_accepts_an_initial_state() {
        let mut job = Job::new_enqueued(a_descriptor());
        job.state_history.clear();
        assert!(job.current_state().is_none());
        assert_eq!(job.state_name(), None);
        assert!(job.validate().is_err());

        // 空历史不接受PROCESSING作为首个状态
        let err = job
            .transition_to(JobState::processing("server-1"))
            .expect_err("must reject");
        assert!(matches!(err, JobflowError::IllegalJobStateChange { .. }));

        job.transition_to(JobState::enqueued()).unwrap();
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_increase_version_returns_previous() {
        let mut job = Job::new_enqueued(a_descriptor());
        assert_eq!(job.increase_version(), 0);
        assert_eq!(job.version, 1);
        assert_eq!(job.increase_version(), 1);
        assert_eq!(job.version, 2);
    }

    #[test]
    fn test_state_name_round_trips_through_strings() {
        for state in [
            StateName::Scheduled,
            StateName::Enqueued,
            StateName::Processing,
            StateName::Succeeded,
            StateName::Failed,
            StateName::Deleted,
        ] {
            let parsed: StateName = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("RUNNING".parse::<StateName>().is_err());
    }

    #[test]
    fn test_state_history_serde_round_trip() {
        let mut job = Job::new_enqueued(a_descriptor());
        job.transition_to(JobState::processing("server-1")).unwrap();
        job.transition_to(JobState::failed("boom", "TestError"))
            .unwrap();
        job.set_metadata("progress", serde_json::json!(42));

        let serialized = serde_json::to_string(&job).unwrap();
        let deserialized: Job = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, job);
    }
}
