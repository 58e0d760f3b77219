//! Builders for creating test jobs with sensible defaults and easy
//! customization of the state history.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use jobflow_core::models::{Job, JobDescriptor, JobState};

/// Builder for test [`Job`] entities.
///
/// States are written verbatim, so a test can assemble any history it
/// needs (including ones a live server would have produced over time).
pub struct JobBuilder {
    descriptor: JobDescriptor,
    states: Vec<JobState>,
    metadata: HashMap<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobBuilder {
    /// A job that was enqueued just now.
    pub fn an_enqueued_job() -> Self {
        let now = Utc::now();
        Self {
            descriptor: JobDescriptor::new("com.example.TestService", "do_work"),
            states: vec![JobState::Enqueued { created_at: now }],
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A job scheduled for the given instant.
    pub fn a_scheduled_job(scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            descriptor: JobDescriptor::new("com.example.TestService", "do_work"),
            states: vec![JobState::Scheduled {
                created_at: now,
                scheduled_at,
            }],
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A job claimed by the given server some time ago, as left behind by
    /// a crashed peer.
    pub fn a_job_abandoned_in_processing(server_id: &str, since: Duration) -> Self {
        let started_at = Utc::now() - since;
        Self::an_enqueued_job()
            .with_state(JobState::Processing {
                created_at: started_at,
                server_id: server_id.to_string(),
                started_at,
            })
            .with_updated_at(started_at)
    }

    pub fn with_descriptor(mut self, descriptor: JobDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Append a state record verbatim.
    pub fn with_state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Assemble the job through the validated entry point, so a test can
    /// never fabricate an empty or illegal state history.
    pub fn build(self) -> Job {
        let mut job = Job::from_history(self.descriptor, self.states)
            .expect("builder assembled an illegal state history");
        job.metadata = self.metadata;
        job.created_at = self.created_at;
        job.updated_at = self.updated_at;
        job
    }
}
