// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Row locks with bounded waits

use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Identifies something that can be locked
///
/// The derived ordering is the acquisition order: global locks first, then
/// groups, then instances.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LockKey {
    Global(&'static str),
    SecurityGroup(SecurityGroupUuid),
    Instance(InstanceUuid),
}

/// Serializes concurrent schedulers while they mutate the work queue
pub const GLOBAL_WORK_LOCK: LockKey = LockKey::Global("security_group_work");

#[derive(Default)]
pub(super) struct RowLocks {
    rows: Mutex<BTreeMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Holds a set of row locks until dropped
#[must_use]
#[derive(Debug)]
pub struct RowLockGuard {
    keys: BTreeSet<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl RowLockGuard {
    pub fn keys(&self) -> &BTreeSet<LockKey> {
        &self.keys
    }
}

impl RowLocks {
    fn row(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut rows = self.rows.lock().unwrap();
        Arc::clone(rows.entry(*key).or_default())
    }

    /// Acquires every lock in `keys` in sorted order, giving up with
    /// [`Error::Conflict`] if they cannot all be held within `timeout`
    ///
    /// Locks acquired before the timeout fired are released.
    pub(super) async fn lock_sorted(
        &self,
        keys: impl IntoIterator<Item = LockKey>,
        timeout: Duration,
    ) -> Result<RowLockGuard, Error> {
        let keys: BTreeSet<LockKey> = keys.into_iter().collect();
        let rows: Vec<_> = keys.iter().map(|k| self.row(k)).collect();
        let acquire = async move {
            let mut guards = Vec::with_capacity(rows.len());
            for row in rows {
                guards.push(row.lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(timeout, acquire).await {
            Ok(guards) => Ok(RowLockGuard { keys, _guards: guards }),
            Err(_) => Err(Error::conflict(&format!(
                "timed out after {:?} waiting for locks on {:?}",
                timeout, keys
            ))),
        }
    }
}
