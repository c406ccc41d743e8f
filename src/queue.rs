// Invocation queue: one armed timer multiplexing every pending firing
//
// All pending invocations from all jobs live in one list sorted ascending by
// fire date. Exactly one timer is armed at a time, always for the head. Every
// mutation of the queue or the registry happens under one lock; job bodies
// run in spawned tasks and never execute under it.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::errors::ScheduleError;
use crate::job::{Job, JobEvent};
use crate::schedule::Recurrence;
use crate::scheduler::SchedulerConfig;
use crate::timer::LongTimer;

/// One concrete future firing of a job, bound to a single fire date. A
/// recurrence's following occurrence is always a fresh invocation.
pub(crate) struct Invocation {
    pub(crate) id: u64,
    pub(crate) job: Weak<Job>,
    pub(crate) job_name: String,
    pub(crate) fire_date: DateTime<Utc>,
    pub(crate) recurrence: Recurrence,
    pub(crate) end_date: Option<DateTime<Utc>>,
}

/// Stable ordered insert: append, then bubble the new element left past
/// every strictly greater element. An existing element never moves for an
/// equal or greater newcomer, so equal keys keep their insertion order.
pub(crate) fn sorted_insert<T, K, F>(list: &mut Vec<T>, value: T, key: F)
where
    K: Ord,
    F: Fn(&T) -> K,
{
    list.push(value);
    let mut i = list.len() - 1;
    while i > 0 && key(&list[i - 1]) > key(&list[i]) {
        list.swap(i - 1, i);
        i -= 1;
    }
}

pub(crate) struct ArmedTimer {
    invocation_id: u64,
    timer: LongTimer,
}

pub(crate) struct CoreState {
    pub(crate) queue: Vec<Arc<Invocation>>,
    pub(crate) armed: Option<ArmedTimer>,
    pub(crate) jobs: HashMap<String, Arc<Job>>,
}

/// Shared engine behind a `Scheduler` and all of its jobs.
pub(crate) struct SchedulerCore {
    pub(crate) config: SchedulerConfig,
    pub(crate) runtime: Handle,
    state: Mutex<CoreState>,
    invocation_seq: AtomicU64,
    pub(crate) anon_seq: AtomicU64,
    /// Bodies started but not yet settled, across all jobs, including
    /// one-time jobs that already left the registry. Graceful shutdown
    /// waits on this.
    running_bodies: AtomicU64,
}

impl SchedulerCore {
    pub(crate) fn new(config: SchedulerConfig, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime,
            state: Mutex::new(CoreState {
                queue: Vec::new(),
                armed: None,
                jobs: HashMap::new(),
            }),
            invocation_seq: AtomicU64::new(0),
            anon_seq: AtomicU64::new(0),
            running_bodies: AtomicU64::new(0),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_invocation_id(&self) -> u64 {
        self.invocation_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn running_body_count(&self) -> u64 {
        self.running_bodies.load(Ordering::SeqCst)
    }

    // ----- registry -----

    pub(crate) fn register_job(&self, job: Arc<Job>) -> Result<(), ScheduleError> {
        let mut state = self.lock_state();
        if state.jobs.contains_key(job.name()) {
            return Err(ScheduleError::DuplicateJobName(job.name().to_string()));
        }
        state.jobs.insert(job.name().to_string(), job);
        Ok(())
    }

    pub(crate) fn deregister_job(&self, name: &str) -> bool {
        self.lock_state().jobs.remove(name).is_some()
    }

    pub(crate) fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.lock_state().jobs.get(name).cloned()
    }

    pub(crate) fn job_names(&self) -> Vec<String> {
        self.lock_state().jobs.keys().cloned().collect()
    }

    pub(crate) fn registered_jobs(&self) -> Vec<Arc<Job>> {
        self.lock_state().jobs.values().cloned().collect()
    }

    // ----- queue -----

    /// Queue a new invocation for `job` and re-evaluate the armed timer.
    pub(crate) fn queue_invocation(
        self: &Arc<Self>,
        job: &Arc<Job>,
        fire_date: DateTime<Utc>,
        recurrence: Recurrence,
        end_date: Option<DateTime<Utc>>,
    ) {
        let invocation = Arc::new(Invocation {
            id: self.next_invocation_id(),
            job: Arc::downgrade(job),
            job_name: job.name().to_string(),
            fire_date,
            recurrence,
            end_date,
        });
        let mut state = self.lock_state();
        self.insert_locked(&mut state, invocation);
    }

    fn insert_locked(self: &Arc<Self>, state: &mut CoreState, invocation: Arc<Invocation>) {
        sorted_insert(&mut state.queue, invocation.clone(), |i| i.fire_date);
        if let Some(job) = invocation.job.upgrade() {
            job.track_invocation(invocation.clone());
            job.emit(JobEvent::Scheduled {
                fire_date: invocation.fire_date,
            });
        }
        debug!(
            job_name = %invocation.job_name,
            fire_date = %invocation.fire_date,
            "invocation scheduled"
        );
        self.prepare_next(state);
    }

    /// Remove `invocation` from the queue; no-op when it is already gone.
    /// Synchronous: once this returns the invocation can never fire.
    pub(crate) fn cancel_invocation(self: &Arc<Self>, invocation: &Arc<Invocation>) -> bool {
        let mut state = self.lock_state();
        let Some(position) = state.queue.iter().position(|i| i.id == invocation.id) else {
            return false;
        };
        state.queue.remove(position);
        if state.armed.as_ref().map(|a| a.invocation_id) == Some(invocation.id) {
            if let Some(armed) = state.armed.take() {
                armed.timer.close();
            }
        }
        if let Some(job) = invocation.job.upgrade() {
            job.untrack_invocation(invocation.id);
            job.emit(JobEvent::Canceled {
                fire_date: invocation.fire_date,
            });
        }
        debug!(
            job_name = %invocation.job_name,
            fire_date = %invocation.fire_date,
            "invocation canceled"
        );
        self.prepare_next(&mut state);
        true
    }

    /// Make the armed timer match the queue head: close a stale timer and
    /// arm a fresh one for the head's remaining delay.
    fn prepare_next(self: &Arc<Self>, state: &mut CoreState) {
        let head_id = state.queue.first().map(|i| i.id);
        if state.armed.as_ref().map(|a| a.invocation_id) == head_id {
            return;
        }
        if let Some(armed) = state.armed.take() {
            armed.timer.close();
        }
        let Some(head) = state.queue.first().cloned() else {
            return;
        };
        let delay = (head.fire_date - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let core = Arc::downgrade(self);
        let id = head.id;
        let timer = LongTimer::once(&self.runtime, delay, move || {
            if let Some(core) = core.upgrade() {
                core.fire(id);
            }
        });
        trace!(
            job_name = %head.job_name,
            fire_date = %head.fire_date,
            delay_ms = delay.as_millis() as u64,
            "timer armed"
        );
        state.armed = Some(ArmedTimer {
            invocation_id: id,
            timer,
        });
    }

    /// Timer callback for the armed head. Pops it, re-arms immediately,
    /// queues the job's next occurrence, and only then runs the body in its
    /// own task.
    fn fire(self: &Arc<Self>, invocation_id: u64) {
        let mut state = self.lock_state();

        // A timer closed while it was already waking can still get here;
        // only the invocation that is both armed and at the head may fire.
        if state.armed.as_ref().map(|a| a.invocation_id) != Some(invocation_id) {
            return;
        }
        if state.queue.first().map(|i| i.id) != Some(invocation_id) {
            return;
        }
        state.armed = None;
        let invocation = state.queue.remove(0);
        self.prepare_next(&mut state);

        // Queue the next occurrence before the body runs, so a slow or
        // failing body can never drop a recurring job.
        if invocation.recurrence.recurs() {
            match invocation.recurrence.next_after(invocation.fire_date) {
                Some(next_date)
                    if invocation.end_date.map_or(true, |end| next_date <= end) =>
                {
                    let next = Arc::new(Invocation {
                        id: self.next_invocation_id(),
                        job: invocation.job.clone(),
                        job_name: invocation.job_name.clone(),
                        fire_date: next_date,
                        recurrence: invocation.recurrence.clone(),
                        end_date: invocation.end_date,
                    });
                    self.insert_locked(&mut state, next);
                }
                Some(_) => {
                    debug!(job_name = %invocation.job_name, "recurrence reached its end date");
                }
                None => {
                    debug!(job_name = %invocation.job_name, "recurrence exhausted");
                }
            }
        }

        let Some(job) = invocation.job.upgrade() else {
            return;
        };
        job.untrack_invocation(invocation.id);
        if job.is_one_time() {
            state.jobs.remove(job.name());
        }
        job.begin_run();
        self.running_bodies.fetch_add(1, Ordering::SeqCst);
        drop(state);

        debug!(
            job_name = %job.name(),
            fire_date = %invocation.fire_date,
            "invocation firing"
        );
        let fire_date = invocation.fire_date;
        let core = Arc::clone(self);
        self.runtime.spawn(async move {
            job.emit(JobEvent::Run);
            let result = AssertUnwindSafe(job.invoke(fire_date))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("job body panicked: {}", panic_message(panic)))
                });
            job.complete_run(result);
            core.running_bodies.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_insert_keeps_ascending_order() {
        let mut list = Vec::new();
        for value in [5, 1, 4, 2, 3] {
            sorted_insert(&mut list, value, |v| *v);
        }
        assert_eq!(list, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sorted_insert_is_stable_for_equal_keys() {
        let mut list: Vec<(i32, &str)> = Vec::new();
        sorted_insert(&mut list, (1, "first"), |v| v.0);
        sorted_insert(&mut list, (2, "third"), |v| v.0);
        sorted_insert(&mut list, (1, "second"), |v| v.0);
        sorted_insert(&mut list, (2, "fourth"), |v| v.0);
        assert_eq!(
            list,
            vec![(1, "first"), (1, "second"), (2, "third"), (2, "fourth")]
        );
    }

    #[test]
    fn test_sorted_insert_into_empty_list() {
        let mut list = Vec::new();
        sorted_insert(&mut list, 7, |v| *v);
        assert_eq!(list, vec![7]);
    }
}
