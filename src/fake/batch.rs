//! Job definitions and lazily executed jobs.
//!
//! A submitted job is `Pending` until its start delay has passed and every dependency has
//! succeeded; it then runs on the next access or clock sweep. What "running" means is decided by
//! a handler registered per job definition. Without one a job exits with code 0.
//!
//! Handlers run while the batch state is locked and must not call back into the batch engine.

use super::{Expire, IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs, duration_ms};
use crate::helpers::validate_resource_name;
use crate::testing::Resettable;
use crate::traits::{
    BatchIO, CloudError, CloudResult, Job, JobDefinition, JobRequest, JobStatus, ResourceId,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decides a job's exit code. `Err` fails the job with the error message as its reason.
pub type JobHandler = Arc<dyn Fn(&Job) -> CloudResult<i32> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    runnable_at: TimestampMs,
}

#[derive(Default)]
pub struct BatchState {
    definitions: BTreeMap<String, JobDefinition>,
    handlers: BTreeMap<String, JobHandler>,
    /// Keyed by id; ids sort in submission order.
    jobs: BTreeMap<String, StoredJob>,
    ids: IdSequence,
}

impl fmt::Debug for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchState")
            .field("definitions", &self.definitions)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

enum Readiness {
    Wait,
    Run(TimestampMs),
    Fail(String),
}

impl BatchState {
    fn readiness(&self, stored: &StoredJob, now: TimestampMs) -> Readiness {
        if now < stored.runnable_at {
            return Readiness::Wait;
        }
        let mut start = stored.runnable_at;
        for dependency in &stored.job.depends_on {
            let Some(dep) = self.jobs.get(dependency) else {
                return Readiness::Fail(format!("dependency {dependency} no longer exists"));
            };
            match dep.job.status {
                JobStatus::Pending => return Readiness::Wait,
                JobStatus::Succeeded => {
                    start = start.max(dep.job.stopped_at.unwrap_or(start));
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    return Readiness::Fail(format!("dependency {dependency} did not succeed"));
                }
            }
        }
        Readiness::Run(start)
    }

    fn run(&self, job: &mut Job, started_at: TimestampMs) {
        job.started_at = Some(started_at);
        job.stopped_at = Some(started_at);
        let outcome = match self.handlers.get(&job.definition) {
            Some(handler) => handler(job),
            None => Ok(0),
        };
        match outcome {
            Ok(0) => {
                job.status = JobStatus::Succeeded;
                job.exit_code = Some(0);
            }
            Ok(code) => {
                job.status = JobStatus::Failed;
                job.exit_code = Some(code);
                job.status_reason = Some(format!("exited with code {code}"));
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                job.status_reason = Some(err.message);
            }
        }
    }
}

impl Expire for BatchState {
    fn expire(&mut self, now: TimestampMs) {
        let pending: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, s)| s.job.status == JobStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        // Dependencies are always submitted first, so one pass in id order settles chains.
        for id in pending {
            let Some(stored) = self.jobs.get(&id) else {
                continue;
            };
            let mut job = stored.job.clone();
            match self.readiness(stored, now) {
                Readiness::Wait => continue,
                Readiness::Run(started_at) => self.run(&mut job, started_at),
                Readiness::Fail(reason) => {
                    job.status = JobStatus::Failed;
                    job.stopped_at = Some(stored.runnable_at);
                    job.status_reason = Some(reason);
                }
            }
            match job.status {
                JobStatus::Succeeded => debug!(job = %id, "job succeeded"),
                _ => warn!(job = %id, reason = job.status_reason.as_deref().unwrap_or_default(), "job failed"),
            }
            if let Some(stored) = self.jobs.get_mut(&id) {
                stored.job = job;
            }
        }
    }
}

fn job_resource(id: &str) -> ResourceId {
    ResourceId::new("job", id)
}

fn definition_id(name: &str) -> ResourceId {
    ResourceId::new("job_definition", name)
}

// ============================================================================
// FakeBatchIO
// ============================================================================

#[derive(Clone)]
pub struct FakeBatchIO {
    store: Store<BatchState>,
    env: SimEnv,
    start_delay: Duration,
}

impl FakeBatchIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<BatchState>, env: SimEnv) -> Self {
        store.register_sweeper(&env);
        Self {
            store,
            env,
            start_delay: Duration::ZERO,
        }
    }

    /// Time between submission and the earliest start of jobs submitted from now on.
    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    #[must_use]
    pub fn store(&self) -> Store<BatchState> {
        self.store.clone()
    }

    /// Decide the outcome of jobs that use `definition`.
    pub fn register_handler<F>(&self, definition: &str, handler: F)
    where
        F: Fn(&Job) -> CloudResult<i32> + Send + Sync + 'static,
    {
        self.store
            .lock()
            .handlers
            .insert(definition.to_string(), Arc::new(handler));
    }
}

impl Default for FakeBatchIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeBatchIO {
    fn reset(&self) {
        *self.store.lock() = BatchState::default();
    }
}

impl BatchIO for FakeBatchIO {
    fn register_job_definition(&self, definition: JobDefinition) -> CloudResult<JobDefinition> {
        validate_resource_name(&definition.name)?;
        if definition.image.is_empty() {
            return Err(CloudError::validation("job definition image is required"));
        }
        let now = self.env.enter("batch.register_job_definition")?;
        let mut state = self.store.lock_at(now);
        if state.definitions.contains_key(&definition.name) {
            return Err(CloudError::already_exists(definition_id(&definition.name)));
        }
        info!(definition = %definition.name, image = %definition.image, "job definition registered");
        state
            .definitions
            .insert(definition.name.clone(), definition.clone());
        Ok(definition)
    }

    fn list_job_definitions(&self) -> CloudResult<Vec<JobDefinition>> {
        let now = self.env.enter("batch.list_job_definitions")?;
        Ok(self.store.lock_at(now).definitions.values().cloned().collect())
    }

    fn submit_job(&self, request: JobRequest) -> CloudResult<Job> {
        validate_resource_name(&request.name)?;
        let now = self.env.enter("batch.submit_job")?;
        let mut state = self.store.lock_at(now);
        if !state.definitions.contains_key(&request.definition) {
            return Err(CloudError::not_found(definition_id(&request.definition)));
        }
        if let Some(missing) = request
            .depends_on
            .iter()
            .find(|dep| !state.jobs.contains_key(*dep))
        {
            return Err(CloudError::not_found(job_resource(missing)));
        }

        let job = Job {
            id: state.ids.next("job"),
            name: request.name,
            definition: request.definition,
            parameters: request.parameters,
            depends_on: request.depends_on,
            status: JobStatus::Pending,
            exit_code: None,
            status_reason: None,
            submitted_at: now,
            started_at: None,
            stopped_at: None,
        };
        state.jobs.insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                runnable_at: now + duration_ms(self.start_delay),
            },
        );
        info!(job = %job.id, name = %job.name, definition = %job.definition, "job submitted");
        Ok(job)
    }

    fn describe_job(&self, job_id: &str) -> CloudResult<Job> {
        let now = self.env.enter("batch.describe_job")?;
        self.store
            .lock_at(now)
            .jobs
            .get(job_id)
            .map(|s| s.job.clone())
            .ok_or_else(|| CloudError::not_found(job_resource(job_id)))
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> CloudResult<Vec<Job>> {
        let now = self.env.enter("batch.list_jobs")?;
        Ok(self
            .store
            .lock_at(now)
            .jobs
            .values()
            .filter(|s| status.is_none_or(|wanted| s.job.status == wanted))
            .map(|s| s.job.clone())
            .collect())
    }

    fn cancel_job(&self, id: &str, reason: &str) -> CloudResult<Job> {
        let now = self.env.enter("batch.cancel_job")?;
        let mut state = self.store.lock_at(now);
        let stored = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| CloudError::not_found(job_resource(id)))?;
        if stored.job.status.is_finished() {
            return Err(CloudError::conflict(format!(
                "job {id} already finished as {:?}",
                stored.job.status
            ))
            .with_resource(job_resource(id)));
        }
        stored.job.status = JobStatus::Cancelled;
        stored.job.status_reason = Some(reason.to_string());
        stored.job.stopped_at = Some(now);
        info!(job = id, reason, "job cancelled");
        Ok(stored.job.clone())
    }
}
