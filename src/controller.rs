use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::callout::Callout;
use crate::diff::changed_hosts;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::error::AgentError;
use crate::host::HostId;
use crate::inventory::{Inventory, Snapshot};
use crate::liveness::Liveness;
use crate::outcome::{CycleOutcome, LogCollector};
use crate::payload::canonicalize;
use crate::post_process::PostProcess;
use crate::state::StateStore;

/// The external capabilities a controller drives.
pub struct Collaborators {
    pub inventory: Arc<dyn Inventory>,
    pub store: Arc<dyn StateStore>,
    pub callout: Arc<dyn Callout>,
    pub liveness: Arc<dyn Liveness>,
    pub post_process: Arc<dyn PostProcess>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerSettings {
    pub dispatch: DispatchSettings,
    /// Delete all known host state when the inventory returns no hosts.
    pub cleanup_on_empty_snapshot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
}

/// Clears the running flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives reconciliation: fetch, diff, dispatch, cleanup, report, heartbeat.
///
/// Cycles never overlap. A fetch failure ends the cycle before anything is
/// written; every later failure is confined to its host and reported in the
/// `CycleOutcome`.
pub struct CycleController {
    inventory: Arc<dyn Inventory>,
    store: Arc<dyn StateStore>,
    liveness: Arc<dyn Liveness>,
    post_process: Arc<dyn PostProcess>,
    dispatcher: Dispatcher,
    logs: LogCollector,
    settings: ControllerSettings,
    running: AtomicBool,
}

impl CycleController {
    pub fn new(collaborators: Collaborators, settings: ControllerSettings) -> Self {
        let logs = LogCollector::new();
        let dispatcher = Dispatcher::new(
            collaborators.store.clone(),
            collaborators.callout,
            logs.clone(),
            settings.dispatch,
        );
        Self {
            inventory: collaborators.inventory,
            store: collaborators.store,
            liveness: collaborators.liveness,
            post_process: collaborators.post_process,
            dispatcher,
            logs,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.running.load(Ordering::SeqCst) {
            ControllerState::Running
        } else {
            ControllerState::Idle
        }
    }

    /// Run cycles on a fixed interval until `cancel` fires. The first cycle
    /// starts immediately; a cycle that overruns delays the next tick
    /// instead of overlapping with it.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => break,
            }
            if let Ok(outcome) = self.run_cycle(&cancel).await {
                debug!(
                    changed = outcome.changed.len(),
                    failed = outcome.errors.len(),
                    "cycle complete"
                );
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        info!("reconciliation loop stopped");
    }

    /// Run one reconciliation pass.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome, AgentError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::CycleInProgress);
        }
        let _guard = RunningGuard(&self.running);

        let cycle_id = ulid::Ulid::new().to_string().to_lowercase();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        self.cycle(&cycle_id, cancel).instrument(span).await
    }

    async fn cycle(
        &self,
        cycle_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, AgentError> {
        self.logs.clear();

        debug!("starting fetch");
        let snapshot = match self.inventory.fetch(cancel).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "inventory fetch failed, skipping cycle");
                return Err(e.into());
            }
        };
        debug!(hosts = snapshot.len(), "fetch complete");

        let mut errors: HashMap<HostId, Vec<String>> = HashMap::new();
        let mut payloads: HashMap<HostId, Bytes> = HashMap::with_capacity(snapshot.len());
        for (id, desired) in &snapshot {
            match canonicalize(desired) {
                Ok(bytes) => {
                    payloads.insert(id.clone(), bytes);
                }
                Err(e) => {
                    // State is kept; the host is retried once it serializes.
                    self.logs
                        .for_host(id)
                        .warn(format!("cannot serialize payload: {e}"));
                    errors
                        .entry(id.clone())
                        .or_default()
                        .push(format!("serialize payload: {e}"));
                }
            }
        }

        let changed = changed_hosts(&payloads, self.store.as_ref()).await;
        info!(hosts = snapshot.len(), changed = changed.len(), "diff complete");

        if changed.is_empty() {
            debug!("no hosts changed, skipping dispatch");
        } else {
            let results = self.dispatcher.dispatch(&changed, &payloads, cancel).await;
            for (id, host_errors) in results {
                errors
                    .entry(id)
                    .or_default()
                    .extend(host_errors.iter().map(ToString::to_string));
            }
        }

        self.cleanup(&snapshot).await;

        let outcome = CycleOutcome::build(
            cycle_id,
            self.settings.dispatch.dry_run,
            changed,
            errors,
            self.logs.take(),
        );

        if let Err(e) = self.post_process.post_process(cancel, &outcome).await {
            warn!(error = %e, "post-process hook failed");
        }

        if outcome.is_success() {
            match self.liveness.heartbeat() {
                Ok(()) => debug!("heartbeat"),
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }
        } else {
            warn!(
                failed = outcome.errors.len(),
                "hosts failed this cycle, withholding heartbeat"
            );
        }

        Ok(outcome)
    }

    /// Delete state for every known host missing from the snapshot.
    async fn cleanup(&self, snapshot: &Snapshot) {
        let known = match self.store.list_known().await {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, "cannot list known hosts, skipping cleanup");
                return;
            }
        };
        let stale: Vec<HostId> = known
            .into_iter()
            .filter(|id| !snapshot.contains_key(id))
            .collect();
        if stale.is_empty() {
            return;
        }
        if snapshot.is_empty() && !self.settings.cleanup_on_empty_snapshot {
            warn!(
                known = stale.len(),
                "inventory returned no hosts, keeping existing state"
            );
            return;
        }

        for id in stale {
            match self.store.delete(&id).await {
                Ok(()) => info!(host = %id, "removed state of host no longer in inventory"),
                Err(e) => warn!(host = %id, error = %e, "cannot remove stale host state"),
            }
        }
    }
}
