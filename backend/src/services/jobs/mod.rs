//! Job submission and status polling.
//!
//! The provided routes are:
//! - `POST /api/jobs`: multipart submission. Expects a `kind` text field, an
//!   optional `prompt`, an optional `parameters` field holding a JSON object,
//!   and the image files for the kind (`file`, or `source` and `target` for
//!   face swaps). Answers `202 Accepted` with `{job_id}` as soon as an engine
//!   has taken the job; the work itself continues in the background.
//!
//! - `GET /api/jobs/{job_id}`: the job's current snapshot from the shared
//!   `JobsState`. Clients poll this until `status` is `completed` or
//!   `failed`.

use actix_web::web::{get, post, scope};
use actix_web::Scope;

mod get_status;
mod submit;

const API_PATH: &str = "/api/jobs";

pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("", post().to(submit::process))
        .route("/{job_id}", get().to(get_status::process))
}
