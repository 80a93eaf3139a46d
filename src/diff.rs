use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use tracing::{trace, warn};

use crate::host::HostId;
use crate::state::{StateStore, StoreError};

/// Select the hosts that need a callout this cycle.
///
/// A host is a candidate when its canonical payload differs byte-for-byte
/// from the stored one, or when its processed marker is absent. A host whose
/// state cannot be read is a candidate too. Read-only: nothing is written to
/// the store.
pub async fn changed_hosts(
    fetched: &HashMap<HostId, Bytes>,
    store: &dyn StateStore,
) -> BTreeSet<HostId> {
    let mut changed = BTreeSet::new();
    for (id, desired) in fetched {
        match needs_dispatch(id, desired, store).await {
            Ok(false) => {}
            Ok(true) => {
                changed.insert(id.clone());
            }
            Err(e) => {
                warn!(host = %id, error = %e, "cannot read persisted state, treating as changed");
                changed.insert(id.clone());
            }
        }
    }
    changed
}

async fn needs_dispatch(
    id: &HostId,
    desired: &Bytes,
    store: &dyn StateStore,
) -> Result<bool, StoreError> {
    if !store.marker_exists(id).await? {
        trace!(host = %id, "no processed marker");
        return Ok(true);
    }
    let persisted = store.load(id).await?;
    if persisted.as_ref() != Some(desired) {
        trace!(host = %id, "payload differs from persisted state");
        return Ok(true);
    }
    Ok(false)
}
