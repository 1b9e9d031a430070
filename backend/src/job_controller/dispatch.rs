//! # Dispatch worker
//!
//! One tokio task per job. It polls the engine that accepted the job,
//! translates what the engine reports into `JobUpdate`s for the tracker, and
//! stores the finished image before announcing completion.
//!
//! ## Workflow:
//!
//! 1.  Move the job to `running` at 0%, since the engine has accepted it.
//!     Then sleep `poll_interval` and `poll` the engine.
//! 2.  `Queued` changes nothing. `Running` updates the progress; when the
//!     engine gives no percentage, progress creeps towards 95 so clients
//!     still see movement. Progress never goes backwards.
//! 3.  `Done` fetches the bytes, normalises them to PNG on the blocking pool,
//!     writes the artifact and reports `Completed`.
//! 4.  `Failed` reports the engine's error text.
//! 5.  If the engine becomes unreachable and the kind has a local fallback,
//!     the job is resubmitted to the local engine and continues there.
//! 6.  If nothing terminal happens within `run_timeout`, the job fails with
//!     `"engine timeout"`.
//! 7.  A job that did not complete has its ticket released, so the engine
//!     can drop whatever it still holds for it.

use crate::config::Settings;
use crate::job_controller::state::{JobEvent, JobUpdate};
use crate::processing::backend::{
    DispatchRequest, ProcessingBackend, RemoteStatus, RemoteTicket,
};
use crate::processing::local;
use crate::storage::ArtifactStore;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ENGINE_TIMEOUT_ERROR: &str = "engine timeout";

/// Highest progress reported from an estimate rather than the engine.
const ESTIMATE_CEILING: u8 = 95;

/// Timing knobs shared by the submitter and the workers.
#[derive(Clone, Copy, Debug)]
pub struct DispatchPolicy {
    pub submit_timeout: Duration,
    pub run_timeout: Duration,
    pub poll_interval: Duration,
}

impl DispatchPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            submit_timeout: settings.submit_timeout,
            run_timeout: settings.backend_run_timeout,
            poll_interval: settings.backend_poll_interval,
        }
    }
}

/// Everything a worker needs besides the job itself.
#[derive(Clone)]
pub struct Worker {
    pub tx: mpsc::Sender<JobUpdate>,
    pub artifacts: ArtifactStore,
    pub policy: DispatchPolicy,
}

/// The engine currently responsible for a job.
pub struct ActiveDispatch {
    pub engine: Arc<dyn ProcessingBackend>,
    pub ticket: RemoteTicket,
    pub request: DispatchRequest,
    /// Engine to switch to if `engine` becomes unreachable mid-run.
    pub fallback: Option<Arc<dyn ProcessingBackend>>,
    pub used_fallback: bool,
}

impl Worker {
    /// Spawns the worker task for one job.
    pub fn spawn(&self, dispatch: ActiveDispatch) {
        let worker = self.clone();
        tokio::spawn(async move { worker.run(dispatch).await });
    }

    async fn run(self, mut dispatch: ActiveDispatch) {
        let job_id = dispatch.request.job_id.clone();
        self.send(
            &job_id,
            JobEvent::Running {
                progress: 0,
                message: "processing".to_string(),
            },
        )
        .await;

        let limit = self.policy.run_timeout;
        let event = match tokio::time::timeout(limit, self.drive(&mut dispatch)).await {
            Ok(Ok((result_uri, message))) => JobEvent::Completed {
                result_uri,
                message,
            },
            Ok(Err(error)) => {
                warn!("Job {} failed: {}", job_id, error);
                JobEvent::Failed { error }
            }
            Err(_) => {
                warn!(
                    "Job {} exceeded the {:?} engine limit",
                    job_id, self.policy.run_timeout
                );
                JobEvent::Failed {
                    error: ENGINE_TIMEOUT_ERROR.to_string(),
                }
            }
        };
        let completed = matches!(event, JobEvent::Completed { .. });
        self.send(&job_id, event).await;

        if !completed {
            let release = dispatch.engine.release(&dispatch.ticket);
            if tokio::time::timeout(self.policy.submit_timeout, release)
                .await
                .is_err()
            {
                debug!("{} did not release job {} in time", dispatch.engine.name(), job_id);
            }
        }
    }

    /// Polls until the engine finishes; returns `(result_uri, message)` or
    /// the error text to fail the job with.
    async fn drive(&self, dispatch: &mut ActiveDispatch) -> Result<(String, String), String> {
        let job_id = dispatch.request.job_id.clone();
        let mut progress = Progress::default();

        loop {
            tokio::time::sleep(self.policy.poll_interval).await;

            match dispatch.engine.poll(&dispatch.ticket).await {
                Ok(RemoteStatus::Queued { position }) => {
                    debug!(
                        "Job {} queued at {:?} on {}",
                        job_id,
                        position,
                        dispatch.engine.name()
                    );
                }
                Ok(RemoteStatus::Running { percent, message }) => {
                    if let Some(next) = progress.advance(percent) {
                        self.send(&job_id, JobEvent::Running { progress: next, message })
                            .await;
                    }
                }
                Ok(RemoteStatus::Done) => break,
                Ok(RemoteStatus::Failed(error)) => return Err(error),
                Err(e) if e.is_unavailable() && !dispatch.used_fallback => {
                    let Some(fallback) = dispatch.fallback.take() else {
                        return Err(e.to_string());
                    };
                    warn!(
                        "{} became unavailable for job {} ({}); continuing locally",
                        dispatch.engine.name(),
                        job_id,
                        e
                    );
                    dispatch.ticket = fallback
                        .submit(&dispatch.request)
                        .await
                        .map_err(|e| e.to_string())?;
                    dispatch.engine = fallback;
                    dispatch.used_fallback = true;
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        let bytes = dispatch
            .engine
            .fetch_result(&dispatch.ticket)
            .await
            .map_err(|e| e.to_string())?;
        let png = tokio::task::spawn_blocking(move || local::ensure_png(bytes))
            .await
            .map_err(|e| format!("task join error: {}", e))??;

        let result_uri = self.artifacts.save(&job_id, &png).await.map_err(|e| {
            error!("Cannot store artifact for job {}: {}", job_id, e);
            "failed to store result".to_string()
        })?;

        let message = if dispatch.used_fallback {
            "completed with local fallback".to_string()
        } else {
            "completed".to_string()
        };
        info!(
            "Job {} produced {} bytes via {}",
            job_id,
            png.len(),
            dispatch.engine.name()
        );
        Ok((result_uri, message))
    }

    async fn send(&self, job_id: &str, event: JobEvent) {
        if self.tx.send(JobUpdate::new(job_id, event)).await.is_err() {
            error!("Job updater has stopped; dropping update for {}", job_id);
        }
    }
}

/// Monotonic progress as reported by the worker.
#[derive(Default)]
struct Progress {
    last: Option<u8>,
}

impl Progress {
    /// Next value to report, or `None` if it would not change anything.
    fn advance(&mut self, percent: Option<u8>) -> Option<u8> {
        let current = self.last.unwrap_or(0);
        let candidate = match percent {
            Some(p) => p.min(99),
            None if current >= ESTIMATE_CEILING => current,
            None => current + ((ESTIMATE_CEILING - current) / 10).max(1),
        };
        let next = candidate.max(current);
        if self.last == Some(next) {
            return None;
        }
        self.last = Some(next);
        Some(next)
    }
}
