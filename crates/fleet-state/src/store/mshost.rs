//! Management-server heartbeat rows.

use tracing::{debug, info};

use super::{StateStore, get_row, put_row, scan};
use crate::error::{StateError, StateResult};
use crate::tables::MSHOSTS;
use crate::types::*;

impl StateStore {
    /// Insert or replace the heartbeat row for `msid`, marking it Up.
    ///
    /// A restarted process joins with a new `run_id`; heartbeats from the
    /// previous run stop matching from then on.
    pub fn join_mshost(
        &self,
        msid: Msid,
        name: &str,
        run_id: u64,
        now: u64,
    ) -> StateResult<ManagementServerHost> {
        let row = self.write(|txn| {
            let mut mshosts = txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            let joined = get_row::<ManagementServerHost>(&mshosts, msid)?
                .map(|previous| previous.joined)
                .unwrap_or(now);
            let row = ManagementServerHost {
                msid,
                name: name.to_string(),
                state: MsState::Up,
                run_id,
                last_update: now,
                joined,
            };
            put_row(&mut mshosts, msid, &row)?;
            Ok(row)
        })?;
        info!(msid, run_id, "management server joined");
        Ok(row)
    }

    /// Refresh `last_update` if the row still belongs to this run.
    ///
    /// Returns false when the row is gone or was taken over by a newer run.
    /// A row marked Down by a peer comes back Up.
    pub fn heartbeat_mshost(&self, msid: Msid, run_id: u64, now: u64) -> StateResult<bool> {
        self.write(|txn| {
            let mut mshosts = txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<ManagementServerHost>(&mshosts, msid)? else {
                return Ok(false);
            };
            if row.run_id != run_id {
                return Ok(false);
            }
            row.last_update = now;
            row.state = MsState::Up;
            put_row(&mut mshosts, msid, &row)?;
            Ok(true)
        })
    }

    /// Mark `msid` Down if its last heartbeat is at or before `stale_before`.
    ///
    /// A peer that heartbeated after the caller's scan is left alone.
    pub fn mark_mshost_down(&self, msid: Msid, stale_before: u64) -> StateResult<bool> {
        let marked = self.write(|txn| {
            let mut mshosts = txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<ManagementServerHost>(&mshosts, msid)? else {
                return Ok(false);
            };
            if row.state == MsState::Down || row.last_update > stale_before {
                return Ok(false);
            }
            row.state = MsState::Down;
            put_row(&mut mshosts, msid, &row)?;
            Ok(true)
        })?;
        if marked {
            debug!(msid, "management server marked down");
        }
        Ok(marked)
    }

    /// Graceful shutdown: mark this run's row Down.
    pub fn leave_mshost(&self, msid: Msid, run_id: u64) -> StateResult<bool> {
        self.write(|txn| {
            let mut mshosts = txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<ManagementServerHost>(&mshosts, msid)? else {
                return Ok(false);
            };
            if row.run_id != run_id {
                return Ok(false);
            }
            row.state = MsState::Down;
            put_row(&mut mshosts, msid, &row)?;
            Ok(true)
        })
    }

    pub fn get_mshost(&self, msid: Msid) -> StateResult<Option<ManagementServerHost>> {
        self.read(|txn| {
            let mshosts = txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            get_row(&mshosts, msid)
        })
    }

    pub fn list_mshosts(&self) -> StateResult<Vec<ManagementServerHost>> {
        self.read(|txn| {
            let mshosts = txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            scan(&mshosts, |_| true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_only_matches_the_current_run() {
        let store = StateStore::open_in_memory().unwrap();
        store.join_mshost(5, "ms-5", 1, 100).unwrap();
        assert!(store.heartbeat_mshost(5, 1, 110).unwrap());

        // Restart with a new run id.
        let row = store.join_mshost(5, "ms-5", 2, 120).unwrap();
        assert_eq!(row.joined, 100);
        assert!(!store.heartbeat_mshost(5, 1, 130).unwrap());
        assert_eq!(store.get_mshost(5).unwrap().unwrap().last_update, 120);
        assert!(!store.heartbeat_mshost(6, 1, 130).unwrap());
    }

    #[test]
    fn mark_down_skips_fresh_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store.join_mshost(9, "ms-9", 1, 100).unwrap();

        assert!(!store.mark_mshost_down(9, 99).unwrap());
        assert!(store.mark_mshost_down(9, 100).unwrap());
        assert!(!store.mark_mshost_down(9, 100).unwrap(), "already down");
        assert_eq!(store.get_mshost(9).unwrap().unwrap().state, MsState::Down);

        // The process was only slow: its next heartbeat brings it back.
        assert!(store.heartbeat_mshost(9, 1, 200).unwrap());
        assert_eq!(store.get_mshost(9).unwrap().unwrap().state, MsState::Up);
    }

    #[test]
    fn leave_marks_own_run_down() {
        let store = StateStore::open_in_memory().unwrap();
        store.join_mshost(5, "ms-5", 7, 100).unwrap();
        assert!(!store.leave_mshost(5, 6).unwrap());
        assert!(store.leave_mshost(5, 7).unwrap());
        assert_eq!(store.list_mshosts().unwrap()[0].state, MsState::Down);
    }
}
