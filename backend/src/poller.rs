//! Consumer-side completion loop.
//!
//! [`await_completion`] asks a [`ProgressSource`] for a job's snapshot at a
//! fixed interval until the job is terminal or the attempt budget runs out.
//! Giving up never touches the job itself; dropping the future simply stops
//! polling.

use crate::error::{CoreError, CoreResult};
use crate::identity::USER_HEADER;
use crate::job_controller::state::JobsState;
use async_trait::async_trait;
use common::jobs::{JobSnapshot, JobStatus};
use log::debug;
use reqwest::StatusCode;
use std::time::Duration;

/// Anything that can report a job's current snapshot.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    /// `Transient` errors are retried by the poller; every other error ends
    /// the loop.
    async fn fetch(&self, job_id: &str) -> CoreResult<JobSnapshot>;
}

#[async_trait]
impl ProgressSource for JobsState {
    async fn fetch(&self, job_id: &str) -> CoreResult<JobSnapshot> {
        self.get(job_id).await
    }
}

/// Polls `GET /api/jobs/{job_id}` on a running server.
pub struct HttpProgressSource {
    client: reqwest::Client,
    base_url: String,
    user: String,
}

impl HttpProgressSource {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
        }
    }
}

#[async_trait]
impl ProgressSource for HttpProgressSource {
    async fn fetch(&self, job_id: &str) -> CoreResult<JobSnapshot> {
        let response = self
            .client
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .header(USER_HEADER, &self.user)
            .send()
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| CoreError::Transient(format!("unreadable job snapshot: {}", e))),
            StatusCode::NOT_FOUND => Err(CoreError::NotFound(job_id.to_string())),
            StatusCode::UNAUTHORIZED => Err(CoreError::Unauthorized),
            StatusCode::FORBIDDEN => Err(CoreError::Forbidden(format!(
                "job {} belongs to another user",
                job_id
            ))),
            status => Err(CoreError::Transient(format!(
                "job status request returned HTTP {}",
                status.as_u16()
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PollPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_attempts: 90,
        }
    }
}

/// Waits for `job_id` to finish and returns its `result_uri`.
///
/// Fails with `JobFailed` carrying the backend's error text, `PollTimeout`
/// once `max_attempts` polls passed without a terminal state, or `NotFound`.
pub async fn await_completion(
    source: &dyn ProgressSource,
    job_id: &str,
    policy: PollPolicy,
) -> CoreResult<String> {
    await_completion_with(source, job_id, policy, |_| {}).await
}

/// Like [`await_completion`], calling `on_update` with every snapshot seen.
pub async fn await_completion_with(
    source: &dyn ProgressSource,
    job_id: &str,
    policy: PollPolicy,
    mut on_update: impl FnMut(&JobSnapshot) + Send,
) -> CoreResult<String> {
    if policy.max_attempts == 0 {
        return Err(CoreError::Validation(
            "max_attempts must be at least 1".into(),
        ));
    }

    for attempt in 1..=policy.max_attempts {
        match source.fetch(job_id).await {
            Ok(snapshot) => {
                on_update(&snapshot);
                match snapshot.status {
                    JobStatus::Completed => {
                        return snapshot.result_uri.ok_or_else(|| {
                            CoreError::Storage(format!("job {} completed without a result", job_id))
                        })
                    }
                    JobStatus::Failed => {
                        return Err(CoreError::JobFailed(
                            snapshot.error.unwrap_or_else(|| "unknown error".to_string()),
                        ))
                    }
                    JobStatus::Pending | JobStatus::Running => {}
                }
            }
            Err(CoreError::Transient(reason)) => {
                debug!("Poll {} for job {} failed: {}", attempt, job_id, reason);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(policy.poll_interval).await;
    }

    Err(CoreError::PollTimeout {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use common::jobs::JobKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        answers: Mutex<VecDeque<CoreResult<JobSnapshot>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(answers: Vec<CoreResult<JobSnapshot>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProgressSource for Scripted {
        async fn fetch(&self, _job_id: &str) -> CoreResult<JobSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(snapshot(JobStatus::Running, 50)))
        }
    }

    fn snapshot(status: JobStatus, progress: u8) -> JobSnapshot {
        JobSnapshot {
            job_id: "job-1".into(),
            kind: JobKind::Grayscale,
            status,
            progress,
            message: String::new(),
            result_uri: (status == JobStatus::Completed)
                .then(|| "/api/artifacts/job-1".to_string()),
            error: (status == JobStatus::Failed).then(|| "engine timeout".to_string()),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            poll_interval: Duration::from_secs(1),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_result_uri_on_completion() {
        let source = Scripted::new(vec![
            Ok(snapshot(JobStatus::Pending, 0)),
            Ok(snapshot(JobStatus::Running, 40)),
            Ok(snapshot(JobStatus::Completed, 100)),
        ]);
        let mut progress = Vec::new();
        let uri = await_completion_with(&source, "job-1", policy(10), |s| progress.push(s.progress))
            .await
            .unwrap();
        assert_eq!(uri, "/api/artifacts/job-1");
        assert_eq!(progress, vec![0, 40, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_carries_backend_error() {
        let source = Scripted::new(vec![Ok(snapshot(JobStatus::Failed, 10))]);
        assert_matches!(
            await_completion(&source, "job-1", policy(10)).await,
            Err(CoreError::JobFailed(msg)) if msg == "engine timeout"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let source = Scripted::new(Vec::new());
        let started = tokio::time::Instant::now();
        assert_matches!(
            await_completion(&source, "job-1", policy(3)).await,
            Err(CoreError::PollTimeout { attempts: 3 })
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_consume_attempts() {
        let source = Scripted::new(vec![
            Err(CoreError::Transient("connection reset".into())),
            Err(CoreError::Transient("HTTP 502".into())),
            Ok(snapshot(JobStatus::Completed, 100)),
        ]);
        assert!(await_completion(&source, "job-1", policy(3)).await.is_ok());

        let source = Scripted::new(vec![
            Err(CoreError::Transient("connection reset".into())),
            Err(CoreError::Transient("HTTP 502".into())),
        ]);
        assert_matches!(
            await_completion(&source, "job-1", policy(2)).await,
            Err(CoreError::PollTimeout { attempts: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_stops_immediately() {
        let source = Scripted::new(vec![Err(CoreError::NotFound("job-1".into()))]);
        assert_matches!(
            await_completion(&source, "job-1", policy(10)).await,
            Err(CoreError::NotFound(_))
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_is_invalid() {
        let source = Scripted::new(Vec::new());
        assert_matches!(
            await_completion(&source, "job-1", policy(0)).await,
            Err(CoreError::Validation(_))
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
