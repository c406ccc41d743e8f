// Scheduler: the public surface over the invocation queue and job registry

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::errors::ScheduleError;
use crate::job::{CompletionHandler, Job, JobBody};
use crate::queue::SchedulerCore;
use crate::schedule::Schedule;

/// Tunables for a scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often `graceful_shutdown` re-checks the running counters.
    pub shutdown_poll_interval: Duration,
    /// Capacity of each job's event channel.
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_poll_interval: Duration::from_millis(500),
            event_channel_capacity: 64,
        }
    }
}

/// Explicit options for scheduling a job, instead of positional overloads.
pub struct JobOptions {
    pub name: Option<String>,
    pub schedule: Schedule,
    pub on_complete: Option<CompletionHandler>,
}

impl JobOptions {
    pub fn new(schedule: impl Into<Schedule>) -> Self {
        Self {
            name: None,
            schedule: schedule.into(),
            on_complete: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_on_complete<F>(mut self, on_complete: F) -> Self
    where
        F: Fn(&anyhow::Result<Value>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(on_complete));
        self
    }
}

/// An in-process job scheduler.
///
/// Every scheduler owns its own invocation queue and named-job registry;
/// independent instances never share state. Cloning is cheap and clones share
/// the same engine. Must be created inside a tokio runtime; timer tasks hold
/// only weak references, so dropping the last clone winds the engine down.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            core: SchedulerCore::new(config, Handle::current()),
        }
    }

    /// Schedule an anonymous job. The job is registered under a generated
    /// name and runs `body` at every firing.
    pub fn schedule_job<F, Fut>(
        &self,
        schedule: impl Into<Schedule>,
        body: F,
    ) -> Result<Arc<Job>, ScheduleError>
    where
        F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.schedule_job_with(JobOptions::new(schedule), body)
    }

    /// Schedule a job under an explicit name. The name must be free.
    pub fn schedule_named_job<F, Fut>(
        &self,
        name: impl Into<String>,
        schedule: impl Into<Schedule>,
        body: F,
    ) -> Result<Arc<Job>, ScheduleError>
    where
        F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.schedule_job_with(JobOptions::new(schedule).with_name(name), body)
    }

    /// Schedule a job from explicit [`JobOptions`].
    ///
    /// On failure the job is still registered under its name, just without
    /// pending work; it stays in the registry until canceled, and
    /// [`Scheduler::reschedule_job_by_name`] can give it a working schedule
    /// later.
    pub fn schedule_job_with<F, Fut>(
        &self,
        options: JobOptions,
        body: F,
    ) -> Result<Arc<Job>, ScheduleError>
    where
        F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let body: JobBody = Arc::new(move |fire_date| body(fire_date).boxed());
        let (name, anonymous) = match options.name {
            Some(name) => (name, false),
            None => (self.generate_anonymous_name(), true),
        };
        let job = Job::new(name, anonymous, body, options.on_complete, &self.core);
        self.core.register_job(job.clone())?;
        match job.try_schedule(&options.schedule) {
            Ok(()) => {
                info!(job_name = %job.name(), "job scheduled");
                Ok(job)
            }
            Err(error) => {
                // The registry entry outlives the failure: only cancel
                // removes a name, so the job can be recovered by name later.
                debug!(job_name = %job.name(), error = %error, "scheduling failed");
                Err(error)
            }
        }
    }

    /// Cancel a job's pending invocations and replace its schedule. The
    /// trigger counter resets; on failure the previous invocations are
    /// restored.
    pub fn reschedule_job(
        &self,
        job: &Arc<Job>,
        schedule: impl Into<Schedule>,
    ) -> Result<Arc<Job>, ScheduleError> {
        job.try_reschedule(&schedule.into())?;
        Ok(job.clone())
    }

    /// [`Scheduler::reschedule_job`] by registry lookup. Works only for jobs
    /// scheduled under an explicit name; anonymous jobs must be rescheduled
    /// through their handle.
    pub fn reschedule_job_by_name(
        &self,
        name: &str,
        schedule: impl Into<Schedule>,
    ) -> Result<Arc<Job>, ScheduleError> {
        let job = self
            .core
            .job(name)
            .ok_or_else(|| ScheduleError::JobNotFound(name.to_string()))?;
        if job.is_anonymous() {
            return Err(ScheduleError::AnonymousJobName(name.to_string()));
        }
        job.try_reschedule(&schedule.into())?;
        Ok(job)
    }

    /// Cancel every pending invocation of `job` and deregister it. Once this
    /// returns the job can never fire again.
    pub fn cancel_job(&self, job: &Arc<Job>) -> bool {
        job.cancel(false)
    }

    /// [`Scheduler::cancel_job`] by registry lookup; false for unknown names.
    pub fn cancel_job_by_name(&self, name: &str) -> bool {
        match self.core.job(name) {
            Some(job) => job.cancel(false),
            None => false,
        }
    }

    /// Look up a registered job by name.
    pub fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.core.job(name)
    }

    /// Names of every registered job, anonymous ones included.
    pub fn job_names(&self) -> Vec<String> {
        self.core.job_names()
    }

    /// Cancel every registered job, then wait until no job body is still
    /// running. Resolves immediately when nothing is mid-execution;
    /// otherwise the running counters are polled on the configured interval.
    pub async fn graceful_shutdown(&self) {
        info!("scheduler shutting down");
        let jobs = self.core.registered_jobs();
        for job in &jobs {
            job.cancel(false);
        }
        let poll = self.core.config.shutdown_poll_interval;
        while self.core.running_body_count() > 0 {
            tokio::time::sleep(poll).await;
        }
        info!("scheduler shutdown complete");
    }

    fn generate_anonymous_name(&self) -> String {
        let sequence = self.core.anon_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "<Anonymous Job {} {}>",
            sequence,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}
