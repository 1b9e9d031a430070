//! Manages the state of long-running, asynchronous image jobs.
//!
//! This module is the single source of truth for job progress. Clients poll it
//! through `GET /api/jobs/{job_id}`, and dispatch workers feed it through an
//! MPSC channel drained by [`start_job_updater`].
//!
//! The main components are:
//! - `JobsState`: a clonable, thread-safe handle holding every live job. Each
//!   job sits behind its own async mutex, so updates to one job never wait on
//!   another. The id → job map is only locked for lookups, inserts and removals.
//! - `JobEvent`: one state change a worker (or backend callback) reports.
//! - `JobUpdate`: a `JobEvent` addressed to a job id, sent over the channel.
//! - `start_job_updater`: a long-running task applying `JobUpdate`s in arrival
//!   order and logging the ones the state machine rejects.
//!
//! New jobs and terminal transitions are written through to the `jobs` table
//! on the blocking pool before they become visible, so a restart can restore
//! recent jobs. Progress-only updates stay in memory; a job that was running
//! when the process died is restored as failed either way.

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use common::jobs::{JobKind, JobSnapshot, JobStatus};
use log::{debug, info, warn};
use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

const RESTART_ERROR: &str = "interrupted by server restart";

/// Server-side record of one job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub owner: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub result_uri: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A state change reported for a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Running { progress: u8, message: String },
    Completed { result_uri: String, message: String },
    Failed { error: String },
}

impl JobEvent {
    /// Status the job ends up in if the event is accepted.
    pub fn target(&self) -> JobStatus {
        match self {
            JobEvent::Running { .. } => JobStatus::Running,
            JobEvent::Completed { .. } => JobStatus::Completed,
            JobEvent::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// A `JobEvent` addressed to a specific job, as carried by `JobsState.tx`.
#[derive(Debug)]
pub struct JobUpdate {
    pub(crate) job_id: String,
    pub(crate) event: JobEvent,
}

impl JobUpdate {
    pub fn new(job_id: impl Into<String>, event: JobEvent) -> Self {
        Self {
            job_id: job_id.into(),
            event,
        }
    }
}

impl JobRecord {
    pub fn new(id: impl Into<String>, kind: JobKind, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            owner: owner.into(),
            status: JobStatus::Pending,
            progress: 0,
            message: "queued".to_string(),
            result_uri: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            result_uri: self.result_uri.clone(),
            error: self.error.clone(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.finished_at {
            Some(finished) => match chrono::Duration::from_std(retention) {
                Ok(window) => finished + window <= now,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Applies `event` following `pending → running → {completed | failed}`.
    ///
    /// A pending job only accepts `Running`; a running job accepts anything.
    /// The record is left untouched when the event is rejected.
    fn apply(&mut self, event: &JobEvent, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status.is_terminal() {
            return Err(CoreError::TerminalState(self.id.clone()));
        }
        let target = event.target();
        if self.status == JobStatus::Pending && target != JobStatus::Running {
            return Err(CoreError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status.as_str(),
                to: target.as_str(),
            });
        }

        match event {
            JobEvent::Running { progress, message } => {
                if *progress > 100 {
                    return Err(CoreError::Validation(format!(
                        "progress must be between 0 and 100, got {}",
                        progress
                    )));
                }
                if *progress < self.progress {
                    return Err(CoreError::ProgressRegression {
                        job_id: self.id.clone(),
                        current: self.progress,
                        requested: *progress,
                    });
                }
                self.status = JobStatus::Running;
                self.progress = *progress;
                self.message = message.clone();
            }
            JobEvent::Completed {
                result_uri,
                message,
            } => {
                if result_uri.trim().is_empty() {
                    return Err(CoreError::Validation(
                        "a completed job requires a result_uri".into(),
                    ));
                }
                self.status = JobStatus::Completed;
                self.progress = 100;
                self.message = message.clone();
                self.result_uri = Some(result_uri.clone());
                self.finished_at = Some(now);
            }
            JobEvent::Failed { error } => {
                if error.trim().is_empty() {
                    return Err(CoreError::Validation(
                        "a failed job requires an error".into(),
                    ));
                }
                self.status = JobStatus::Failed;
                self.message = "failed".to_string();
                self.error = Some(error.clone());
                self.finished_at = Some(now);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Fails a job whose worker is gone. Bypasses the state machine, since
    /// the job may never have left `pending`.
    fn interrupt(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.message = "failed".to_string();
        self.error = Some(RESTART_ERROR.to_string());
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

struct JobSlot {
    record: Mutex<JobRecord>,
    watch: watch::Sender<JobSnapshot>,
}

impl JobSlot {
    fn new(record: JobRecord) -> Arc<Self> {
        let (watch, _) = watch::channel(record.snapshot());
        Arc::new(Self {
            record: Mutex::new(record),
            watch,
        })
    }
}

/// Holds a place in an owner's active-job quota until the job is created.
///
/// Dropping it without passing it to [`JobsState::create`] gives the place back.
#[derive(Debug)]
pub struct ActiveReservation {
    active: Arc<StdMutex<HashMap<String, usize>>>,
    owner: String,
    committed: bool,
}

impl Drop for ActiveReservation {
    fn drop(&mut self) {
        if !self.committed {
            release_active(&self.active, &self.owner);
        }
    }
}

fn release_active(active: &StdMutex<HashMap<String, usize>>, owner: &str) {
    if let Ok(mut counts) = active.lock() {
        if let Some(count) = counts.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(owner);
            }
        }
    }
}

/// A thread-safe, shareable container for the state of all jobs.
///
/// Created once in `main.rs` and handed to the Actix application as
/// `web::Data`, to the submitter, and to the background updater and sweeper.
#[derive(Clone)]
pub struct JobsState {
    jobs: Arc<RwLock<HashMap<String, Arc<JobSlot>>>>,
    /// Count of non-terminal jobs per owner.
    active: Arc<StdMutex<HashMap<String, usize>>>,
    db: Database,
    retention: Duration,

    /// Sender side of the update channel.
    ///
    /// Dispatch workers push `JobUpdate`s here instead of writing to the
    /// map directly; `start_job_updater` applies them in order.
    pub tx: mpsc::Sender<JobUpdate>,
}

impl JobsState {
    pub fn new(db: Database, retention: Duration) -> (Self, mpsc::Receiver<JobUpdate>) {
        let (tx, rx) = mpsc::channel(100);
        let state = Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(StdMutex::new(HashMap::new())),
            db,
            retention,
            tx,
        };
        (state, rx)
    }

    /// Claims one of `owner`'s active-job places, failing when `limit` are taken.
    pub fn reserve(&self, owner: &str, limit: usize) -> CoreResult<ActiveReservation> {
        let mut counts = self
            .active
            .lock()
            .map_err(|_| CoreError::Storage("active job counter poisoned".into()))?;
        let count = counts.entry(owner.to_string()).or_insert(0);
        if *count >= limit {
            return Err(CoreError::TooManyActiveJobs { limit });
        }
        *count += 1;
        Ok(ActiveReservation {
            active: self.active.clone(),
            owner: owner.to_string(),
            committed: false,
        })
    }

    /// Registers a new pending job.
    pub async fn create(
        &self,
        record: JobRecord,
        mut reservation: ActiveReservation,
    ) -> CoreResult<JobSnapshot> {
        if record.owner != reservation.owner {
            return Err(CoreError::Validation(
                "reservation belongs to a different owner".into(),
            ));
        }
        if self.jobs.read().await.contains_key(&record.id) {
            return Err(CoreError::Validation(format!(
                "job {} already exists",
                record.id
            )));
        }
        persist(&self.db, &record).await?;

        let snapshot = record.snapshot();
        self.jobs
            .write()
            .await
            .insert(record.id.clone(), JobSlot::new(record));
        reservation.committed = true;
        debug!("Job {} registered as pending", snapshot.job_id);
        Ok(snapshot)
    }

    /// Number of jobs currently tracked, expired ones included until swept.
    pub async fn count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn get(&self, job_id: &str) -> CoreResult<JobSnapshot> {
        self.with_record(job_id, |record| Ok(record.snapshot()))
            .await
    }

    /// Applies `event` to the job, enforcing the status state machine.
    ///
    /// Terminal jobs reject every update. A rejected update leaves both the
    /// in-memory record and the stored row unchanged.
    pub async fn update(&self, job_id: &str, event: JobEvent) -> CoreResult<JobSnapshot> {
        let slot = self.slot(job_id).await?;
        let mut record = slot.record.lock().await;
        if record.is_expired(Utc::now(), self.retention) {
            return Err(CoreError::NotFound(job_id.to_string()));
        }

        let mut next = record.clone();
        next.apply(&event, Utc::now())?;
        let became_terminal = next.status.is_terminal();
        if became_terminal {
            persist(&self.db, &next).await?;
        }

        *record = next;
        let snapshot = record.snapshot();
        slot.watch.send_replace(snapshot.clone());

        if became_terminal {
            release_active(&self.active, &record.owner);
            info!(
                "Job {} finished as {}",
                record.id,
                record.status.as_str()
            );
        }
        Ok(snapshot)
    }

    /// Subscribes to snapshots of a job. The receiver sees every accepted update.
    pub async fn subscribe(&self, job_id: &str) -> CoreResult<watch::Receiver<JobSnapshot>> {
        let slot = self.slot(job_id).await?;
        Ok(slot.watch.subscribe())
    }

    /// Runs `f` while holding the job's lock, so no update interleaves with it.
    pub async fn with_record<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&JobRecord) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let slot = self.slot(job_id).await?;
        let record = slot.record.lock().await;
        if record.is_expired(Utc::now(), self.retention) {
            return Err(CoreError::NotFound(job_id.to_string()));
        }
        f(&record)
    }

    /// Removes terminal jobs whose retention window has passed.
    ///
    /// Returns the ids that were removed so callers can drop their artifacts.
    pub async fn sweep_expired(&self) -> CoreResult<Vec<String>> {
        let now = Utc::now();
        let candidates: Vec<(String, Arc<JobSlot>)> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, slot) in candidates {
            if slot.record.lock().await.is_expired(now, self.retention) {
                expired.push(id);
            }
        }
        if expired.is_empty() {
            return Ok(expired);
        }

        let mut jobs = self.jobs.write().await;
        for id in &expired {
            jobs.remove(id);
        }
        drop(jobs);

        let ids = expired.clone();
        self.db
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(expired)
    }

    /// Reloads jobs from the database after a restart.
    ///
    /// Expired rows are deleted. Jobs that were still pending or running lost
    /// their worker with the old process, so they are marked failed.
    pub async fn restore(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let rows = self.db.run_blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, owner, status, progress, message, result_uri, error, \
                 created_at, updated_at, finished_at FROM jobs",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StoredJob {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        owner: row.get(2)?,
                        status: row.get(3)?,
                        progress: row.get(4)?,
                        message: row.get(5)?,
                        result_uri: row.get(6)?,
                        error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                        finished_at: row.get(10)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

        let mut jobs = self.jobs.write().await;
        let mut restored = 0;
        for row in rows {
            let id = row.id.clone();
            let mut record = match row.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable job row {}: {}", id, e);
                    continue;
                }
            };
            if record.is_expired(now, self.retention) {
                self.db
                    .run_blocking(move |conn| {
                        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                        Ok(())
                    })
                    .await?;
                continue;
            }
            if !record.status.is_terminal() {
                record.interrupt(now);
                persist(&self.db, &record).await?;
            }
            jobs.insert(record.id.clone(), JobSlot::new(record));
            restored += 1;
        }
        Ok(restored)
    }

    async fn slot(&self, job_id: &str) -> CoreResult<Arc<JobSlot>> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(job_id.to_string()))
    }
}

struct StoredJob {
    id: String,
    kind: String,
    owner: String,
    status: String,
    progress: u8,
    message: String,
    result_uri: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl StoredJob {
    fn into_record(self) -> Result<JobRecord, String> {
        Ok(JobRecord {
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: self.id,
            owner: self.owner,
            progress: self.progress,
            message: self.message,
            result_uri: self.result_uri,
            error: self.error,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {:?}: {}", raw, e))
}

async fn persist(db: &Database, record: &JobRecord) -> CoreResult<()> {
    let record = record.clone();
    db.run_blocking(move |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO jobs (id, kind, owner, status, progress, message, \
             result_uri, error, created_at, updated_at, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.kind.as_str(),
                record.owner,
                record.status.as_str(),
                record.progress,
                record.message,
                record.result_uri,
                record.error,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
                record.finished_at.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Starts the central job state updater task.
///
/// Spawned once as a long-running background task. Updates for one job are
/// applied in the order the worker sent them. Rejected updates (duplicates,
/// late callbacks after a terminal state, regressions) are logged and dropped;
/// the tracker state is never changed by them.
pub async fn start_job_updater(state: JobsState, mut rx: mpsc::Receiver<JobUpdate>) {
    while let Some(update) = rx.recv().await {
        if let Err(e) = state.update(&update.job_id, update.event).await {
            warn!("Rejected update for job {}: {}", update.job_id, e);
        }
    }
}
