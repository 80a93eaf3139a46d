use bytes::Bytes;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::callout::{Callout, CalloutError, CalloutOutcome};
use crate::host::HostId;
use crate::outcome::LogCollector;
use crate::state::{StateStore, StoreError};

/// Error recorded against a single host during dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no payload for host")]
    MissingPayload,

    #[error("clear processed marker: {0}")]
    ClearMarker(#[source] StoreError),

    #[error("persist payload: {0}")]
    Persist(#[source] StoreError),

    #[error("set processed marker: {0}")]
    SetMarker(#[source] StoreError),

    #[error("callout: {0}")]
    Callout(#[from] CalloutError),

    #[error("playbook failed with exit code {exit_code}: {error}")]
    Failed { exit_code: i32, error: String },

    #[error("dispatch task aborted: {0}")]
    Aborted(String),
}

/// How changed hosts are worked through within one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub mode: DispatchMode,
    /// Upper bound on concurrent callouts in parallel mode.
    pub max_parallel: usize,
    pub dry_run: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Serial,
            max_parallel: 16,
            dry_run: false,
        }
    }
}

/// Errors per dispatched host; an empty list means the host succeeded.
pub type DispatchResults = HashMap<HostId, Vec<DispatchError>>;

/// Everything one host's dispatch needs, cheap to clone into a task.
#[derive(Clone)]
struct HostWorker {
    store: Arc<dyn StateStore>,
    callout: Arc<dyn Callout>,
    logs: LogCollector,
    dry_run: bool,
}

impl HostWorker {
    /// Marker off, payload written, callout run, marker on if it succeeded.
    ///
    /// The marker goes first so that a crash anywhere after the payload
    /// write leaves the host without a marker, and thus a candidate again.
    async fn run(
        &self,
        id: &HostId,
        payload: &Bytes,
        cancel: &CancellationToken,
    ) -> Vec<DispatchError> {
        let log = self.logs.for_host(id);

        // Nothing new starts after shutdown; the host's state stays as it was.
        if cancel.is_cancelled() {
            log.warn("skipped, agent is shutting down");
            return vec![DispatchError::Callout(CalloutError::Cancelled)];
        }

        if let Err(e) = self.store.clear_marker(id).await {
            log.warn(format!("cannot clear processed marker: {e}"));
            return vec![DispatchError::ClearMarker(e)];
        }
        if let Err(e) = self.store.save(id, payload).await {
            log.warn(format!("cannot write payload: {e}"));
            return vec![DispatchError::Persist(e)];
        }

        let path = self.store.payload_path(id);
        let outcome = match self.callout.run(cancel, id, &path, self.dry_run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log.warn(format!("callout error: {e}"));
                return vec![DispatchError::Callout(e)];
            }
        };
        for line in outcome.output() {
            log.info(line.clone());
        }

        match outcome {
            CalloutOutcome::Succeeded { .. } => match self.store.set_marker(id).await {
                Ok(()) => {
                    debug!(host = %id, "marked processed");
                    Vec::new()
                }
                Err(e) => {
                    log.warn(format!("cannot write processed marker: {e}"));
                    vec![DispatchError::SetMarker(e)]
                }
            },
            CalloutOutcome::Failed {
                exit_code, error, ..
            } => {
                log.warn(format!("playbook failed with exit code {exit_code}: {error}"));
                vec![DispatchError::Failed { exit_code, error }]
            }
        }
    }
}

/// Runs the callout for every changed host and keeps the marker protocol.
///
/// One host's failure never stops the others. In parallel mode at most
/// `max_parallel` callouts run at once.
pub struct Dispatcher {
    worker: HostWorker,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        callout: Arc<dyn Callout>,
        logs: LogCollector,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            worker: HostWorker {
                store,
                callout,
                logs,
                dry_run: settings.dry_run,
            },
            settings,
        }
    }

    pub async fn dispatch(
        &self,
        changed: &BTreeSet<HostId>,
        payloads: &HashMap<HostId, Bytes>,
        cancel: &CancellationToken,
    ) -> DispatchResults {
        let mut results = DispatchResults::new();
        let mut work = Vec::with_capacity(changed.len());
        for id in changed {
            match payloads.get(id) {
                Some(payload) => work.push((id.clone(), payload.clone())),
                None => {
                    error!(host = %id, "changed host has no payload");
                    results.insert(id.clone(), vec![DispatchError::MissingPayload]);
                }
            }
        }

        match self.settings.mode {
            DispatchMode::Serial => {
                for (id, payload) in work {
                    info!(host = %id, "dispatching host");
                    let errors = self.worker.run(&id, &payload, cancel).await;
                    results.insert(id, errors);
                }
            }
            DispatchMode::Parallel => {
                self.dispatch_parallel(work, cancel, &mut results).await;
            }
        }
        results
    }

    async fn dispatch_parallel(
        &self,
        work: Vec<(HostId, Bytes)>,
        cancel: &CancellationToken,
        results: &mut DispatchResults,
    ) {
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut pending: BTreeSet<HostId> = BTreeSet::new();
        let mut join_set: JoinSet<(HostId, Vec<DispatchError>)> = JoinSet::new();

        for (id, payload) in work {
            pending.insert(id.clone());
            let worker = self.worker.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (id, vec![DispatchError::Aborted("worker pool closed".to_string())]);
                };
                info!(host = %id, "dispatching host");
                let errors = worker.run(&id, &payload, &cancel).await;
                (id, errors)
            });
        }

        let mut last_join_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, errors)) => {
                    pending.remove(&id);
                    results.insert(id, errors);
                }
                Err(e) => {
                    error!(error = %e, "dispatch task failed");
                    last_join_error = Some(e.to_string());
                }
            }
        }

        // Tasks that panicked never reported back; their marker may be in
        // any state, so drop it.
        let reason = last_join_error.unwrap_or_else(|| "task lost".to_string());
        for id in pending {
            let mut errors = vec![DispatchError::Aborted(reason.clone())];
            if let Err(e) = self.worker.store.clear_marker(&id).await {
                errors.push(DispatchError::ClearMarker(e));
            }
            self.worker
                .logs
                .for_host(&id)
                .warn(format!("dispatch aborted: {reason}"));
            results.insert(id, errors);
        }
    }
}
