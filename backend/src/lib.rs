//! Image processing job service.
//!
//! Clients submit image jobs (style transfer, grayscale, upscaling, text to
//! image, face swap), poll their progress, and fetch the finished PNG. The
//! heavy lifting happens in pluggable engines; this crate owns the job
//! lifecycle around them.

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod job_controller;
pub mod ledger;
pub mod poller;
pub mod processing;
pub mod services;
pub mod storage;

use crate::config::Settings;
use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::job_controller::dispatch::DispatchPolicy;
use crate::job_controller::retention::start_retention_sweeper;
use crate::job_controller::state::{start_job_updater, JobUpdate, JobsState};
use crate::job_controller::submit::JobSubmitter;
use crate::ledger::{CreditLedger, SqliteLedger};
use crate::processing::backend::Engines;
use crate::processing::KindCatalog;
use crate::storage::ArtifactStore;
use actix_web::web;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Every shared component of the server, wired together once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub jobs: JobsState,
    pub ledger: Arc<dyn CreditLedger>,
    pub catalog: Arc<KindCatalog>,
    pub artifacts: ArtifactStore,
    pub submitter: JobSubmitter,
}

impl AppContext {
    /// Returns the context and the receiving end of the job update channel,
    /// to be handed to [`AppContext::spawn_background`].
    pub fn new(
        settings: Settings,
        db: Database,
        engines: Engines,
    ) -> CoreResult<(Self, mpsc::Receiver<JobUpdate>)> {
        let artifacts = ArtifactStore::open(&settings.upload_dir)?;
        let ledger: Arc<dyn CreditLedger> =
            Arc::new(SqliteLedger::new(db.clone(), settings.default_credits));
        let catalog = Arc::new(KindCatalog::from_settings(&settings));
        let (jobs, rx) = JobsState::new(db, settings.job_retention);

        let submitter = JobSubmitter::new(
            jobs.clone(),
            ledger.clone(),
            catalog.clone(),
            engines,
            artifacts.clone(),
            DispatchPolicy::from_settings(&settings),
            settings.max_active_jobs_per_user,
        );

        Ok((
            Self {
                settings,
                jobs,
                ledger,
                catalog,
                artifacts,
                submitter,
            },
            rx,
        ))
    }

    /// Starts the job updater and the retention sweeper.
    pub fn spawn_background(&self, rx: mpsc::Receiver<JobUpdate>) {
        tokio::spawn(start_job_updater(self.jobs.clone(), rx));
        tokio::spawn(start_retention_sweeper(
            self.jobs.clone(),
            self.artifacts.clone(),
            self.settings.sweep_interval,
        ));
    }

    /// Registers shared state and every `/api` scope on an Actix app.
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::new(self.jobs.clone()))
            .app_data(web::Data::new(self.submitter.clone()))
            .app_data(web::Data::new(self.artifacts.clone()))
            .app_data(web::Data::from(self.catalog.clone()))
            .app_data(web::Data::from(self.ledger.clone()))
            .app_data(web::JsonConfig::default().limit(16 * 1024).error_handler(
                |err, _| CoreError::Validation(err.to_string()).into(),
            ))
            .app_data(
                web::QueryConfig::default()
                    .error_handler(|err, _| CoreError::Validation(err.to_string()).into()),
            )
            .service(services::jobs::configure_routes())
            .service(services::artifacts::configure_routes())
            .service(services::processors::configure_routes())
            .service(services::credits::configure_routes())
            .service(services::health::configure_routes());
    }
}
