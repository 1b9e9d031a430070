//! `GET /api/artifacts/{job_id}?mode=view|download`
//!
//! Serves the PNG of a completed job to its owner. `view` (the default)
//! displays it inline and is free. `download` serves it as an attachment and
//! charges the job's cost the first time; later downloads of the same job are
//! not charged again.

use crate::error::CoreError;
use crate::identity::Caller;
use crate::job_controller::state::JobsState;
use crate::ledger::billing::{settle_download, Settlement};
use crate::ledger::CreditLedger;
use crate::processing::KindCatalog;
use crate::storage::ArtifactStore;
use actix_files::NamedFile;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::web::{get, scope};
use actix_web::{web, Scope};
use common::jobs::JobStatus;
use common::requests::{ArtifactMode, ArtifactQuery};
use log::{debug, error};

const API_PATH: &str = "/api/artifacts";

pub fn configure_routes() -> Scope {
    scope(API_PATH).route("/{job_id}", get().to(process))
}

async fn process(
    caller: Caller,
    job_id: web::Path<String>,
    query: web::Query<ArtifactQuery>,
    jobs: web::Data<JobsState>,
    ledger: web::Data<dyn CreditLedger>,
    catalog: web::Data<KindCatalog>,
    artifacts: web::Data<ArtifactStore>,
) -> Result<NamedFile, CoreError> {
    let job_id = job_id.into_inner();

    let kind = jobs
        .with_record(&job_id, |record| {
            if record.owner != caller.id() {
                return Err(CoreError::Forbidden(format!(
                    "job {} belongs to another user",
                    job_id
                )));
            }
            if record.status != JobStatus::Completed {
                return Err(CoreError::NotCompleted(job_id.clone()));
            }
            Ok(record.kind)
        })
        .await?;

    // Never charge for a file that can no longer be served.
    if !artifacts.exists(&job_id) {
        error!("Artifact for completed job {} is missing", job_id);
        return Err(CoreError::NotFound(job_id));
    }

    let disposition = match query.mode {
        ArtifactMode::View => DispositionType::Inline,
        ArtifactMode::Download => {
            match settle_download(&jobs, ledger.get_ref(), &catalog, caller.id(), &job_id).await? {
                Settlement::Charged { balance } => {
                    debug!("{} downloaded {} ({} credits left)", caller.id(), job_id, balance)
                }
                Settlement::AlreadySettled => {
                    debug!("{} downloaded {} again", caller.id(), job_id)
                }
            }
            DispositionType::Attachment
        }
    };

    let file = NamedFile::open_async(artifacts.path_for(&job_id))
        .await
        .map_err(|_| CoreError::NotFound(job_id.clone()))?;
    Ok(file.set_content_disposition(ContentDisposition {
        disposition,
        parameters: vec![DispositionParam::Filename(format!("{}_{}.png", kind, job_id))],
    }))
}
