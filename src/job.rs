// Job lifecycle: scheduling, cancellation, invocation and typed events

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::ScheduleError;
use crate::queue::{sorted_insert, Invocation, SchedulerCore};
use crate::schedule::{resolve, Schedule};

/// Future returned by a job body: the value feeds the `Success` event, the
/// error feeds the `Error` event.
pub type JobFuture = BoxFuture<'static, anyhow::Result<Value>>;

pub(crate) type JobBody = Arc<dyn Fn(DateTime<Utc>) -> JobFuture + Send + Sync>;

/// Runs after every firing settles, with the body's outcome.
pub type CompletionHandler = Arc<dyn Fn(&anyhow::Result<Value>) + Send + Sync>;

/// Everything a job reports about itself, in per-job order.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// An invocation was queued for this fire date.
    Scheduled { fire_date: DateTime<Utc> },
    /// The body is about to run.
    Run,
    /// The body resolved with a value.
    Success { value: Value },
    /// The body returned an error or panicked.
    Error { error: Arc<anyhow::Error> },
    /// A pending invocation was canceled before it could fire.
    Canceled { fire_date: DateTime<Utc> },
}

/// A named or anonymous unit of scheduled work.
///
/// Jobs are created through [`crate::Scheduler`] and always live behind an
/// `Arc`. A job owns its sorted list of pending invocations (a view into the
/// scheduler-wide queue) and an event channel; the scheduler owns the timer.
pub struct Job {
    name: String,
    anonymous: bool,
    one_time: AtomicBool,
    body: JobBody,
    on_complete: Option<CompletionHandler>,
    running: AtomicU64,
    triggered_count: AtomicU64,
    pending: Mutex<Vec<Arc<Invocation>>>,
    events: broadcast::Sender<JobEvent>,
    core: Weak<SchedulerCore>,
}

impl Job {
    pub(crate) fn new(
        name: String,
        anonymous: bool,
        body: JobBody,
        on_complete: Option<CompletionHandler>,
        core: &Arc<SchedulerCore>,
    ) -> Arc<Job> {
        let (events, _) = broadcast::channel(core.config.event_channel_capacity);
        Arc::new(Job {
            name,
            anonymous,
            one_time: AtomicBool::new(false),
            body,
            on_complete,
            running: AtomicU64::new(0),
            triggered_count: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            events,
            core: Arc::downgrade(core),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Count of invocations whose body has started but not yet settled.
    /// Purely observational; overlapping firings are allowed and callers
    /// needing mutual exclusion must check this themselves.
    pub fn running(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }

    /// Lifetime count of firings, manual invocations included.
    pub fn triggered_count(&self) -> u64 {
        self.triggered_count.load(Ordering::Relaxed)
    }

    /// Subscribe to this job's events. Events emitted before the call are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Fire date of the earliest pending invocation, or `None` when nothing
    /// is queued.
    pub fn next_invocation(&self) -> Option<DateTime<Utc>> {
        self.lock_pending().first().map(|i| i.fire_date)
    }

    /// Queue this job per `schedule`. Returns whether an invocation was
    /// queued; an unusable schedule leaves the job without pending work but
    /// otherwise intact.
    pub fn schedule(self: &Arc<Self>, schedule: &Schedule) -> bool {
        self.try_schedule(schedule).is_ok()
    }

    pub(crate) fn try_schedule(self: &Arc<Self>, schedule: &Schedule) -> Result<(), ScheduleError> {
        let core = self.core.upgrade().ok_or(ScheduleError::SchedulerStopped)?;
        let resolved = resolve(schedule, Utc::now())?;
        self.one_time.store(resolved.one_time, Ordering::Relaxed);
        core.queue_invocation(self, resolved.first, resolved.recurrence, resolved.end);
        Ok(())
    }

    /// Cancel every pending invocation. With `reschedule` set, each
    /// recurring invocation is replaced by its next occurrence from now;
    /// otherwise the job is removed from the registry.
    pub fn cancel(self: &Arc<Self>, reschedule: bool) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let pending: Vec<Arc<Invocation>> = self.lock_pending().clone();
        let now = Utc::now();
        for invocation in &pending {
            core.cancel_invocation(invocation);
            if reschedule && invocation.recurrence.recurs() {
                if let Some(next_date) = invocation.recurrence.next_after(now) {
                    if invocation.end_date.map_or(true, |end| next_date <= end) {
                        core.queue_invocation(
                            self,
                            next_date,
                            invocation.recurrence.clone(),
                            invocation.end_date,
                        );
                    }
                }
            }
        }
        if !reschedule {
            core.deregister_job(&self.name);
            debug!(job_name = %self.name, "job canceled");
        }
        true
    }

    /// Cancel only the earliest pending invocation. With `reschedule` set
    /// its successor (relative to the canceled fire date) is queued instead.
    pub fn cancel_next(self: &Arc<Self>, reschedule: bool) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let Some(head) = self.lock_pending().first().cloned() else {
            return false;
        };
        core.cancel_invocation(&head);
        if reschedule && head.recurrence.recurs() {
            if let Some(next_date) = head.recurrence.next_after(head.fire_date) {
                if head.end_date.map_or(true, |end| next_date <= end) {
                    core.queue_invocation(self, next_date, head.recurrence.clone(), head.end_date);
                }
            }
        }
        true
    }

    /// Replace this job's schedule: cancel everything, reset the trigger
    /// counter, and queue per the new schedule. Returns whether the new
    /// schedule took.
    pub fn reschedule(self: &Arc<Self>, schedule: &Schedule) -> bool {
        self.try_reschedule(schedule).is_ok()
    }

    pub(crate) fn try_reschedule(
        self: &Arc<Self>,
        schedule: &Schedule,
    ) -> Result<(), ScheduleError> {
        let core = self.core.upgrade().ok_or(ScheduleError::SchedulerStopped)?;
        let previous: Vec<Arc<Invocation>> = self.lock_pending().clone();
        for invocation in &previous {
            core.cancel_invocation(invocation);
        }
        match self.try_schedule(schedule) {
            Ok(()) => {
                self.triggered_count.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(error) => {
                // Put the canceled invocations back at their original fire
                // dates so the job is not left unscheduled.
                for invocation in &previous {
                    core.queue_invocation(
                        self,
                        invocation.fire_date,
                        invocation.recurrence.clone(),
                        invocation.end_date,
                    );
                }
                Err(error)
            }
        }
    }

    /// Call the body with `fire_date`, bumping the lifetime trigger counter.
    /// The returned future is the raw body result; event emission and the
    /// running counter belong to the queue.
    pub fn invoke(&self, fire_date: DateTime<Utc>) -> JobFuture {
        self.triggered_count.fetch_add(1, Ordering::Relaxed);
        (self.body)(fire_date)
    }

    // ----- queue hooks -----

    fn lock_pending(&self) -> MutexGuard<'_, Vec<Arc<Invocation>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn track_invocation(&self, invocation: Arc<Invocation>) {
        let mut pending = self.lock_pending();
        sorted_insert(&mut pending, invocation, |i| i.fire_date);
    }

    pub(crate) fn untrack_invocation(&self, id: u64) {
        self.lock_pending().retain(|i| i.id != id);
    }

    pub(crate) fn is_one_time(&self) -> bool {
        self.one_time.load(Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn begin_run(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn complete_run(&self, result: anyhow::Result<Value>) {
        if let Some(on_complete) = &self.on_complete {
            on_complete(&result);
        }
        match result {
            Ok(value) => self.emit(JobEvent::Success { value }),
            Err(error) => {
                debug!(job_name = %self.name, error = %error, "job body failed");
                self.emit(JobEvent::Error {
                    error: Arc::new(error),
                });
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("anonymous", &self.anonymous)
            .field("running", &self.running())
            .field("triggered_count", &self.triggered_count())
            .field("next_invocation", &self.next_invocation())
            .finish()
    }
}
