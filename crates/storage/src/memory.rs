use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobflow_core::models::{
    BackgroundJobServerStatus, Job, JobDescriptor, JobState, JobStats, PageRequest, RecurringJob,
    SortOrder, StateName,
};
use jobflow_core::traits::{JobStorage, RecurringJobStorage, ServerStorage};
use jobflow_errors::{JobflowError, JobflowResult};

/// 易失的内存存储实现，确定性强，测试首选
///
/// 任务表是id到独立锁条目的映射：认领与版本校验在条目锁内完成，
/// 列表查询先快照再过滤。并发语义与持久化实现保持一致。
#[derive(Default)]
pub struct InMemoryStorageProvider {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<Job>>>>,
    recurring_jobs: Mutex<HashMap<String, RecurringJob>>,
    servers: Mutex<HashMap<String, BackgroundJobServerStatus>>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Job> {
        let jobs = self.jobs.read().expect("in-memory job table lock poisoned");
        jobs.values()
            .map(|entry| entry.lock().expect("in-memory job entry lock poisoned").clone())
            .collect()
    }

    fn entry(&self, id: Uuid) -> Option<Arc<Mutex<Job>>> {
        let jobs = self.jobs.read().expect("in-memory job table lock poisoned");
        jobs.get(&id).cloned()
    }

    fn page(mut jobs: Vec<Job>, page: PageRequest) -> Vec<Job> {
        match page.order {
            SortOrder::UpdatedAtAsc => jobs.sort_by_key(|j| j.updated_at),
            SortOrder::UpdatedAtDesc => {
                jobs.sort_by_key(|j| std::cmp::Reverse(j.updated_at))
            }
        }
        jobs.into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect()
    }
}

#[async_trait]
impl JobStorage for InMemoryStorageProvider {
    async fn save(&self, mut job: Job) -> JobflowResult<Job> {
        job.validate()?;
        let previous = job.increase_version();
        if previous == 0 {
            let mut jobs = self.jobs.write().expect("in-memory job table lock poisoned");
            if jobs.contains_key(&job.id) {
                return Err(JobflowError::concurrent_modification(job.id));
            }
            jobs.insert(job.id, Arc::new(Mutex::new(job.clone())));
            return Ok(job);
        }

        let entry = self
            .entry(job.id)
            .ok_or_else(|| JobflowError::job_not_found(job.id))?;
        let mut stored = entry.lock().expect("in-memory job entry lock poisoned");
        if stored.version != previous {
            return Err(JobflowError::concurrent_modification(job.id));
        }
        *stored = job.clone();
        Ok(job)
    }

    async fn save_all(&self, jobs: Vec<Job>) -> JobflowResult<Vec<Job>> {
        // 两阶段：持表写锁先校验全部版本谓词，再统一落盘，保证批量原子性
        let mut table = self.jobs.write().expect("in-memory job table lock poisoned");
        let mut prepared = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.validate()?;
            let previous = job.increase_version();
            match table.get(&job.id) {
                None if previous == 0 => {}
                Some(entry) if previous > 0 => {
                    let stored = entry.lock().expect("in-memory job entry lock poisoned");
                    if stored.version != previous {
                        return Err(JobflowError::concurrent_modification(job.id));
                    }
                }
                _ => return Err(JobflowError::concurrent_modification(job.id)),
            }
            prepared.push(job);
        }

        for job in &prepared {
            match table.get(&job.id) {
                Some(entry) => {
                    *entry.lock().expect("in-memory job entry lock poisoned") = job.clone();
                }
                None => {
                    table.insert(job.id, Arc::new(Mutex::new(job.clone())));
                }
            }
        }
        Ok(prepared)
    }

    async fn get_job_by_id(&self, id: Uuid) -> JobflowResult<Job> {
        let entry = self.entry(id).ok_or_else(|| JobflowError::job_not_found(id))?;
        let job = entry.lock().expect("in-memory job entry lock poisoned").clone();
        Ok(job)
    }

    async fn get_jobs(&self, state: StateName, page: PageRequest) -> JobflowResult<Vec<Job>> {
        let jobs = self
            .snapshot()
            .into_iter()
            .filter(|j| j.has_state(state))
            .collect();
        Ok(Self::page(jobs, page))
    }

    async fn count_jobs(&self, state: StateName) -> JobflowResult<u64> {
        Ok(self
            .snapshot()
            .iter()
            .filter(|j| j.has_state(state))
            .count() as u64)
    }

    async fn get_job_stats(&self) -> JobflowResult<JobStats> {
        let mut stats = JobStats::default();
        for job in self.snapshot() {
            match job.state_name() {
                Some(StateName::Scheduled) => stats.scheduled += 1,
                Some(StateName::Enqueued) => stats.enqueued += 1,
                Some(StateName::Processing) => stats.processing += 1,
                Some(StateName::Succeeded) => stats.succeeded += 1,
                Some(StateName::Failed) => stats.failed += 1,
                Some(StateName::Deleted) => stats.deleted += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn delete_permanently(&self, id: Uuid) -> JobflowResult<bool> {
        let mut jobs = self.jobs.write().expect("in-memory job table lock poisoned");
        Ok(jobs.remove(&id).is_some())
    }

    async fn get_jobs_to_process(
        &self,
        server_id: &str,
        limit: usize,
    ) -> JobflowResult<Vec<Job>> {
        let mut candidates: Vec<(DateTime<Utc>, Arc<Mutex<Job>>)> = {
            let jobs = self.jobs.read().expect("in-memory job table lock poisoned");
            jobs.values()
                .filter_map(|entry| {
                    let job = entry.lock().expect("in-memory job entry lock poisoned");
                    if job.has_state(StateName::Enqueued) {
                        Some((job.updated_at, Arc::clone(entry)))
                    } else {
                        None
                    }
                })
                .collect()
        };
        candidates.sort_by_key(|(updated_at, _)| *updated_at);

        let mut claimed = Vec::new();
        for (_, entry) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let mut stored = entry.lock().expect("in-memory job entry lock poisoned");
            // 条目锁内复核状态，另一台服务器可能已经抢先认领
            if !stored.has_state(StateName::Enqueued) {
                continue;
            }
            let mut job = stored.clone();
            job.transition_to(JobState::processing(server_id))?;
            job.increase_version();
            *stored = job.clone();
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn get_scheduled_jobs(
        &self,
        before: DateTime<Utc>,
        page: PageRequest,
    ) -> JobflowResult<Vec<Job>> {
        let jobs = self
            .snapshot()
            .into_iter()
            .filter(|j| matches!(j.scheduled_at(), Some(at) if at <= before))
            .collect();
        Ok(Self::page(jobs, page))
    }

    async fn recurring_job_instance_exists(
        &self,
        descriptor: &JobDescriptor,
        fire_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        states: &[StateName],
    ) -> JobflowResult<bool> {
        Ok(self.snapshot().into_iter().any(|job| {
            job.descriptor == *descriptor
                && matches!(job.state_name(), Some(state) if states.contains(&state))
                && (job.has_scheduled_fire_at(fire_at) || job.created_at >= window_start)
        }))
    }
}

#[async_trait]
impl RecurringJobStorage for InMemoryStorageProvider {
    async fn save_recurring_job(&self, recurring_job: RecurringJob) -> JobflowResult<()> {
        self.recurring_jobs
            .lock()
            .expect("in-memory recurring table lock poisoned")
            .insert(recurring_job.id.clone(), recurring_job);
        Ok(())
    }

    async fn get_recurring_jobs(&self) -> JobflowResult<Vec<RecurringJob>> {
        Ok(self
            .recurring_jobs
            .lock()
            .expect("in-memory recurring table lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn delete_recurring_job(&self, id: &str) -> JobflowResult<()> {
        self.recurring_jobs
            .lock()
            .expect("in-memory recurring table lock poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| JobflowError::recurring_job_not_found(id))
    }
}

#[async_trait]
impl ServerStorage for InMemoryStorageProvider {
    async fn announce(&self, status: BackgroundJobServerStatus) -> JobflowResult<()> {
        self.servers
            .lock()
            .expect("in-memory server table lock poisoned")
            .insert(status.id.clone(), status);
        Ok(())
    }

    async fn signal_alive(&self, server_id: &str, now: DateTime<Utc>) -> JobflowResult<()> {
        let mut servers = self
            .servers
            .lock()
            .expect("in-memory server table lock poisoned");
        match servers.get_mut(server_id) {
            Some(status) => {
                status.last_heartbeat = now;
                Ok(())
            }
            None => Err(JobflowError::storage_error(format!(
                "server {server_id} has not announced itself"
            ))),
        }
    }

    async fn get_servers(&self) -> JobflowResult<Vec<BackgroundJobServerStatus>> {
        Ok(self
            .servers
            .lock()
            .expect("in-memory server table lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn get_longest_running_server_id(&self) -> JobflowResult<Option<String>> {
        let servers = self
            .servers
            .lock()
            .expect("in-memory server table lock poisoned");
        Ok(servers
            .values()
            .min_by(|a, b| {
                a.first_heartbeat
                    .cmp(&b.first_heartbeat)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|status| status.id.clone()))
    }

    async fn get_servers_that_timed_out(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> JobflowResult<Vec<BackgroundJobServerStatus>> {
        Ok(self
            .servers
            .lock()
            .expect("in-memory server table lock poisoned")
            .values()
            .filter(|s| s.timed_out(heartbeat_older_than))
            .cloned()
            .collect())
    }

    async fn remove_timed_out_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> JobflowResult<u64> {
        let mut servers = self
            .servers
            .lock()
            .expect("in-memory server table lock poisoned");
        let before = servers.len();
        servers.retain(|_, s| !s.timed_out(heartbeat_older_than));
        Ok((before - servers.len()) as u64)
    }
}
