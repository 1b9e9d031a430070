use crate::error::CoreError;
use crate::identity::Caller;
use crate::job_controller::state::JobsState;
use actix_web::{web, HttpResponse};

pub(crate) async fn process(
    caller: Caller,
    job_id: web::Path<String>,
    state: web::Data<JobsState>,
) -> Result<HttpResponse, CoreError> {
    let job_id = job_id.into_inner();
    let snapshot = state
        .with_record(&job_id, |record| {
            if record.owner != caller.id() {
                return Err(CoreError::Forbidden(format!(
                    "job {} belongs to another user",
                    record.id
                )));
            }
            Ok(record.snapshot())
        })
        .await?;
    Ok(HttpResponse::Ok().json(snapshot))
}
