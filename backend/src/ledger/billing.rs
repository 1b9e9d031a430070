use crate::error::{CoreError, CoreResult};
use crate::job_controller::state::JobsState;
use crate::ledger::CreditLedger;
use crate::processing::KindCatalog;
use common::jobs::JobStatus;
use log::info;

/// What settling a download did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// The job was charged now; carries the balance afterwards.
    Charged { balance: i64 },
    /// The job had been charged by an earlier download.
    AlreadySettled,
}

/// Charges `user` for a completed job the first time its artifact is downloaded.
///
/// Runs under the job's lock, so two concurrent downloads of the same job
/// cannot both pass the `is_settled` check.
pub async fn settle_download(
    jobs: &JobsState,
    ledger: &dyn CreditLedger,
    catalog: &KindCatalog,
    user: &str,
    job_id: &str,
) -> CoreResult<Settlement> {
    jobs.with_record(job_id, |record| {
        if record.owner != user {
            return Err(CoreError::Forbidden(format!(
                "job {} belongs to another user",
                job_id
            )));
        }
        if record.status != JobStatus::Completed {
            return Err(CoreError::NotCompleted(job_id.to_string()));
        }
        if ledger.is_settled(job_id)? {
            return Ok(Settlement::AlreadySettled);
        }

        let cost = catalog.spec(record.kind)?.cost;
        let balance = ledger.debit(user, cost, job_id)?;
        info!(
            "Charged {} credits to {} for job {} ({} left)",
            cost, user, job_id, balance
        );
        Ok(Settlement::Charged { balance })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::Database;
    use crate::job_controller::state::{JobEvent, JobRecord};
    use crate::ledger::SqliteLedger;
    use assert_matches::assert_matches;
    use common::jobs::JobKind;
    use std::time::Duration;

    struct Fixture {
        jobs: JobsState,
        ledger: SqliteLedger,
        catalog: KindCatalog,
    }

    async fn fixture(kind: JobKind) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let (jobs, _rx) = JobsState::new(db.clone(), Duration::from_secs(3600));
        let reservation = jobs.reserve("alice", 3).unwrap();
        jobs.create(JobRecord::new("job-1", kind, "alice"), reservation)
            .await
            .unwrap();
        Fixture {
            jobs,
            ledger: SqliteLedger::new(db, 50),
            catalog: KindCatalog::from_settings(&Settings::default()),
        }
    }

    async fn start(jobs: &JobsState) {
        jobs.update(
            "job-1",
            JobEvent::Running {
                progress: 0,
                message: "processing".into(),
            },
        )
        .await
        .unwrap();
    }

    async fn complete(jobs: &JobsState) {
        start(jobs).await;
        jobs.update(
            "job-1",
            JobEvent::Completed {
                result_uri: "/api/artifacts/job-1".into(),
                message: "done".into(),
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn first_download_charges_and_repeat_is_free() {
        let f = fixture(JobKind::FaceSwap).await;
        complete(&f.jobs).await;

        let first = settle_download(&f.jobs, &f.ledger, &f.catalog, "alice", "job-1")
            .await
            .unwrap();
        assert_eq!(first, Settlement::Charged { balance: 35 });

        let again = settle_download(&f.jobs, &f.ledger, &f.catalog, "alice", "job-1")
            .await
            .unwrap();
        assert_eq!(again, Settlement::AlreadySettled);
        assert_eq!(f.ledger.balance("alice").unwrap(), 35);
    }

    #[tokio::test]
    async fn unfinished_jobs_are_not_charged() {
        let f = fixture(JobKind::Grayscale).await;
        assert_matches!(
            settle_download(&f.jobs, &f.ledger, &f.catalog, "alice", "job-1").await,
            Err(CoreError::NotCompleted(_))
        );

        start(&f.jobs).await;
        f.jobs
            .update("job-1", JobEvent::Failed { error: "engine timeout".into() })
            .await
            .unwrap();
        assert_matches!(
            settle_download(&f.jobs, &f.ledger, &f.catalog, "alice", "job-1").await,
            Err(CoreError::NotCompleted(_))
        );
        assert_eq!(f.ledger.balance("alice").unwrap(), 50);
    }

    #[tokio::test]
    async fn other_users_cannot_settle() {
        let f = fixture(JobKind::Grayscale).await;
        complete(&f.jobs).await;
        assert_matches!(
            settle_download(&f.jobs, &f.ledger, &f.catalog, "mallory", "job-1").await,
            Err(CoreError::Forbidden(_))
        );
        assert!(!f.ledger.is_settled("job-1").unwrap());
    }

    #[tokio::test]
    async fn concurrent_downloads_charge_once() {
        let f = fixture(JobKind::Grayscale).await;
        complete(&f.jobs).await;

        let (a, b) = tokio::join!(
            settle_download(&f.jobs, &f.ledger, &f.catalog, "alice", "job-1"),
            settle_download(&f.jobs, &f.ledger, &f.catalog, "alice", "job-1"),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&Settlement::AlreadySettled));
        assert_eq!(f.ledger.balance("alice").unwrap(), 40);
    }
}
