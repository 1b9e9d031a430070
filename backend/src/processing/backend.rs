//! Contract between the job core and the engines that do the actual work.
//!
//! An engine accepts a [`DispatchRequest`] and hands back a [`RemoteTicket`]
//! (`submit`), reports where that ticket stands (`poll`), and returns the
//! finished image bytes (`fetch_result`). A ticket that will never be fetched
//! is handed back with `release`. Engines never touch job state; the dispatch
//! worker translates what they report into tracker updates.

use crate::processing::{EngineRoute, JobPayload};
use async_trait::async_trait;
use common::jobs::JobKind;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Errors from an engine adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The engine could not be reached (network, DNS, refused, 5xx, timeout).
    #[error("{0}")]
    Unavailable(String),

    /// The engine answered but refused or failed the work.
    #[error("{0}")]
    Rejected(String),

    /// The engine answered with something we could not interpret.
    #[error("unexpected response from engine: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Protocol(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

/// Everything an engine needs to run one job.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub job_id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
}

/// Engine-side handle for submitted work.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteTicket(pub String);

/// Where a ticket stands according to its engine.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteStatus {
    Queued { position: Option<u32> },
    /// `percent` is `None` when the engine gives no progress figure.
    Running { percent: Option<u8>, message: String },
    Done,
    Failed(String),
}

#[async_trait]
pub trait ProcessingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(&self, request: &DispatchRequest) -> Result<RemoteTicket, BackendError>;

    async fn poll(&self, ticket: &RemoteTicket) -> Result<RemoteStatus, BackendError>;

    async fn fetch_result(&self, ticket: &RemoteTicket) -> Result<Vec<u8>, BackendError>;

    /// Forgets `ticket` after the job failed or ran out of time. Best effort.
    async fn release(&self, _ticket: &RemoteTicket) {}
}

/// The engines available to the dispatcher, keyed by route.
#[derive(Clone, Default)]
pub struct Engines {
    routes: HashMap<EngineRoute, Arc<dyn ProcessingBackend>>,
}

impl Engines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, route: EngineRoute, backend: Arc<dyn ProcessingBackend>) -> Self {
        self.routes.insert(route, backend);
        self
    }

    pub fn get(&self, route: EngineRoute) -> Option<Arc<dyn ProcessingBackend>> {
        self.routes.get(&route).cloned()
    }
}

enum TaskState {
    Running(JoinHandle<Result<Vec<u8>, BackendError>>),
    Finished(Vec<u8>),
}

/// Bookkeeping for engines whose work is a single future rather than a remote
/// queue: the future is spawned at submit time and polled by ticket.
///
/// An entry lives until its bytes are taken, its task fails, or it is
/// released.
#[derive(Clone, Default)]
pub struct InflightTasks {
    tasks: Arc<Mutex<HashMap<RemoteTicket, TaskState>>>,
}

impl InflightTasks {
    pub fn spawn<F>(&self, ticket: RemoteTicket, work: F) -> Result<RemoteTicket, BackendError>
    where
        F: Future<Output = Result<Vec<u8>, BackendError>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.lock()?
            .insert(ticket.clone(), TaskState::Running(handle));
        Ok(ticket)
    }

    pub async fn poll(&self, ticket: &RemoteTicket) -> Result<RemoteStatus, BackendError> {
        let finished = {
            let mut tasks = self.lock()?;
            let ready = match tasks.get(ticket) {
                None => return Err(unknown_ticket(ticket)),
                Some(TaskState::Finished(_)) => return Ok(RemoteStatus::Done),
                Some(TaskState::Running(handle)) => handle.is_finished(),
            };
            if !ready {
                return Ok(RemoteStatus::Running {
                    percent: None,
                    message: "processing".to_string(),
                });
            }
            match tasks.remove(ticket) {
                Some(TaskState::Running(handle)) => handle,
                _ => return Err(BackendError::Protocol("task vanished".into())),
            }
        };

        // A failed task is already out of the table.
        let bytes = finished
            .await
            .unwrap_or_else(|e| Err(BackendError::Rejected(format!("task join error: {}", e))))?;
        self.lock()?
            .insert(ticket.clone(), TaskState::Finished(bytes));
        Ok(RemoteStatus::Done)
    }

    /// Removes the ticket and returns its bytes. Only valid after `poll`
    /// reported `Done`.
    pub fn take(&self, ticket: &RemoteTicket) -> Result<Vec<u8>, BackendError> {
        match self.lock()?.remove(ticket) {
            Some(TaskState::Finished(bytes)) => Ok(bytes),
            Some(TaskState::Running(handle)) => {
                handle.abort();
                Err(BackendError::Protocol(format!(
                    "result for {} requested before completion",
                    ticket.0
                )))
            }
            None => Err(unknown_ticket(ticket)),
        }
    }

    /// Drops the ticket, aborting its task if it is still running.
    pub fn release(&self, ticket: &RemoteTicket) {
        if let Ok(mut tasks) = self.lock() {
            if let Some(TaskState::Running(handle)) = tasks.remove(ticket) {
                handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<RemoteTicket, TaskState>>, BackendError> {
        self.tasks
            .lock()
            .map_err(|_| BackendError::Protocol("task table poisoned".into()))
    }
}

fn unknown_ticket(ticket: &RemoteTicket) -> BackendError {
    BackendError::Rejected(format!("unknown ticket {}", ticket.0))
}
