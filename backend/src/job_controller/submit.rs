//! # Job submission
//!
//! `JobSubmitter::submit` is the only way a job comes into existence:
//!
//! 1.  Validate the payload against the kind's row of the catalog.
//! 2.  Ask the ledger whether the user can afford the kind. Nothing is
//!     charged here; the debit happens on download.
//! 3.  Reserve one of the user's active-job places.
//! 4.  Hand the work to the kind's engine, bounded by `submit_timeout`. An
//!     unreachable engine is replaced by the local engine when the kind
//!     allows it; otherwise submission fails and no job is created.
//! 5.  Register the job as pending and spawn its dispatch worker.
//!
//! The caller gets the job id back as soon as step 5 is done.

use crate::error::{CoreError, CoreResult};
use crate::job_controller::dispatch::{ActiveDispatch, DispatchPolicy, Worker};
use crate::job_controller::state::{JobRecord, JobsState};
use crate::ledger::CreditLedger;
use crate::processing::backend::{
    BackendError, DispatchRequest, Engines, ProcessingBackend, RemoteTicket,
};
use crate::processing::{EngineRoute, JobPayload, KindCatalog, KindSpec};
use crate::storage::ArtifactStore;
use common::jobs::{JobHandle, JobKind};
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct JobSubmitter {
    jobs: JobsState,
    ledger: Arc<dyn CreditLedger>,
    catalog: Arc<KindCatalog>,
    engines: Engines,
    worker: Worker,
    max_active_per_user: usize,
}

impl JobSubmitter {
    pub fn new(
        jobs: JobsState,
        ledger: Arc<dyn CreditLedger>,
        catalog: Arc<KindCatalog>,
        engines: Engines,
        artifacts: ArtifactStore,
        policy: DispatchPolicy,
        max_active_per_user: usize,
    ) -> Self {
        let worker = Worker {
            tx: jobs.tx.clone(),
            artifacts,
            policy,
        };
        Self {
            jobs,
            ledger,
            catalog,
            engines,
            worker,
            max_active_per_user,
        }
    }

    pub async fn submit(
        &self,
        owner: &str,
        kind: JobKind,
        payload: JobPayload,
    ) -> CoreResult<JobHandle> {
        let spec = self.catalog.validate(kind, &payload)?;

        let check = self.ledger.check(owner, spec.cost)?;
        if !check.sufficient {
            return Err(CoreError::InsufficientCredits {
                balance: check.current_balance,
                cost: spec.cost,
            });
        }

        let reservation = self.jobs.reserve(owner, self.max_active_per_user)?;

        let request = DispatchRequest {
            job_id: Uuid::new_v4().to_string(),
            kind,
            payload,
        };
        let dispatch = self.hand_off(spec, request).await?;

        let job_id = dispatch.request.job_id.clone();
        self.jobs
            .create(JobRecord::new(job_id.clone(), kind, owner), reservation)
            .await?;
        info!(
            "Job {} ({}) for {} accepted by {}",
            job_id,
            kind,
            owner,
            dispatch.engine.name()
        );
        self.worker.spawn(dispatch);

        Ok(JobHandle { job_id })
    }

    /// Submits to the kind's engine, falling back to the local engine when
    /// allowed.
    async fn hand_off(
        &self,
        spec: &KindSpec,
        request: DispatchRequest,
    ) -> CoreResult<ActiveDispatch> {
        let fallback = if spec.fallback && spec.route != EngineRoute::Local {
            self.engines.get(EngineRoute::Local)
        } else {
            None
        };

        let primary = match self.engines.get(spec.route) {
            Some(engine) => self
                .submit_bounded(engine.as_ref(), &request)
                .await
                .map(|ticket| (engine, ticket)),
            None => Err(BackendError::Unavailable(format!(
                "no engine configured for {}",
                spec.kind
            ))),
        };

        match primary {
            Ok((engine, ticket)) => Ok(ActiveDispatch {
                engine,
                ticket,
                request,
                fallback,
                used_fallback: false,
            }),
            Err(e) => match fallback {
                Some(local) if e.is_unavailable() => {
                    warn!(
                        "Engine for {} unavailable ({}); using local fallback for job {}",
                        spec.kind, e, request.job_id
                    );
                    let ticket = self
                        .submit_bounded(local.as_ref(), &request)
                        .await
                        .map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
                    Ok(ActiveDispatch {
                        engine: local,
                        ticket,
                        request,
                        fallback: None,
                        used_fallback: true,
                    })
                }
                _ => Err(CoreError::BackendUnavailable(e.to_string())),
            },
        }
    }

    async fn submit_bounded(
        &self,
        engine: &dyn ProcessingBackend,
        request: &DispatchRequest,
    ) -> Result<RemoteTicket, BackendError> {
        let limit = self.worker.policy.submit_timeout;
        match tokio::time::timeout(limit, engine.submit(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Unavailable(format!(
                "{} did not accept the job within {:?}",
                engine.name(),
                limit
            ))),
        }
    }
}
