use crate::job_controller::state::JobsState;
use crate::storage::ArtifactStore;
use log::{info, warn};
use std::time::Duration;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Removes expired jobs and their artifacts every `interval`.
///
/// Spawned once at startup; runs for the lifetime of the server. Intervals
/// shorter than a second are raised to one second.
pub async fn start_retention_sweeper(
    jobs: JobsState,
    artifacts: ArtifactStore,
    interval: Duration,
) {
    if interval < MIN_SWEEP_INTERVAL {
        warn!(
            "Sweep interval {:?} is too short; using {:?}",
            interval, MIN_SWEEP_INTERVAL
        );
    }
    let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_once(&jobs, &artifacts).await;
    }
}

pub async fn sweep_once(jobs: &JobsState, artifacts: &ArtifactStore) -> usize {
    let expired = match jobs.sweep_expired().await {
        Ok(expired) => expired,
        Err(e) => {
            warn!("Retention sweep failed: {}", e);
            return 0;
        }
    };
    for job_id in &expired {
        if let Err(e) = artifacts.remove(job_id).await {
            warn!("Cannot remove artifact for expired job {}: {}", job_id, e);
        }
    }
    if !expired.is_empty() {
        info!("Retention sweep removed {} job(s)", expired.len());
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::job_controller::state::{JobEvent, JobRecord};
    use common::jobs::JobKind;

    #[tokio::test]
    async fn expired_job_loses_its_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::open(dir.path()).unwrap();
        let (jobs, _rx) = JobsState::new(Database::open_in_memory().unwrap(), Duration::ZERO);

        let reservation = jobs.reserve("alice", 3).unwrap();
        jobs.create(JobRecord::new("job-1", JobKind::Grayscale, "alice"), reservation)
            .await
            .unwrap();
        let uri = artifacts.save("job-1", b"png").await.unwrap();
        jobs.update(
            "job-1",
            JobEvent::Running {
                progress: 0,
                message: "processing".into(),
            },
        )
        .await
        .unwrap();
        jobs.update(
            "job-1",
            JobEvent::Completed {
                result_uri: uri,
                message: "done".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(sweep_once(&jobs, &artifacts).await, 1);
        assert!(!artifacts.exists("job-1"));
        assert_eq!(sweep_once(&jobs, &artifacts).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_sweeper_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::open(dir.path()).unwrap();
        let (jobs, _rx) = JobsState::new(Database::open_in_memory().unwrap(), Duration::ZERO);

        let sweeper = tokio::spawn(start_retention_sweeper(jobs, artifacts, Duration::ZERO));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!sweeper.is_finished());
        sweeper.abort();
    }
}
