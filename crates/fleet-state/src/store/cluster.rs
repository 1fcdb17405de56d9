//! Cluster rows and their managed-state flag.

use tracing::info;

use super::{StateStore, get_row, next_id, put_row, scan};
use crate::error::{StateError, StateResult};
use crate::tables::CLUSTERS;
use crate::types::*;

impl StateStore {
    pub fn create_cluster(
        &self,
        name: &str,
        managed_state: ManagedState,
        now: u64,
    ) -> StateResult<Cluster> {
        self.write(|txn| {
            let cluster = Cluster {
                id: next_id(txn, "cluster")?,
                name: name.to_string(),
                managed_state,
                created: now,
            };
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            put_row(&mut clusters, cluster.id, &cluster)?;
            Ok(cluster)
        })
    }

    pub fn get_cluster(&self, id: ClusterId) -> StateResult<Option<Cluster>> {
        self.read(|txn| {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            get_row(&clusters, id)
        })
    }

    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.read(|txn| {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            scan(&clusters, |_| true)
        })
    }

    /// Flip a cluster between Managed and Unmanaged if it is still in `expected`.
    pub fn update_cluster_managed_state(
        &self,
        id: ClusterId,
        expected: ManagedState,
        next: ManagedState,
    ) -> StateResult<bool> {
        let changed = self.write(|txn| {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let Some(mut cluster) = get_row::<Cluster>(&clusters, id)? else {
                return Err(StateError::NotFound(format!("cluster {id}")));
            };
            if cluster.managed_state != expected {
                return Ok(false);
            }
            cluster.managed_state = next;
            put_row(&mut clusters, id, &cluster)?;
            Ok(true)
        })?;
        if changed {
            info!(cluster_id = id, ?next, "cluster managed state changed");
        }
        Ok(changed)
    }
}
