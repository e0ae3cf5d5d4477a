// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for security group state
//!
//! The `DataStore` keeps every table in memory behind one mutex.  Each method
//! runs as a single critical section, which stands in for a database
//! transaction: no caller ever observes a half-applied update.  Longer-lived
//! exclusion (the global work lock, group and instance row locks) goes through
//! [`DataStore::lock_rows`], which waits asynchronously with a timeout.
//!
//! Methods are split across submodules by table, the way queries would be.

use crate::context::OpContext;
use crate::db::model::Instance;
use crate::db::model::SecurityGroup;
use crate::db::model::SecurityGroupRule;
use crate::db::model::SequenceLog;
use crate::db::model::WorkItem;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_common::typed_uuid::SecurityGroupRuleUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

mod instance;
mod lock;
mod security_group;
mod sequence_log;
mod work_queue;

pub use lock::LockKey;
pub use lock::RowLockGuard;
pub use lock::GLOBAL_WORK_LOCK;
pub use work_queue::ScheduledWork;

#[derive(Default)]
struct Tables {
    security_groups: BTreeMap<SecurityGroupUuid, SecurityGroup>,
    security_group_rules: BTreeMap<SecurityGroupRuleUuid, SecurityGroupRule>,
    /// (instance, group) pairs
    memberships: BTreeSet<(InstanceUuid, SecurityGroupUuid)>,
    instances: BTreeMap<InstanceUuid, Instance>,
    work_items: BTreeMap<u64, WorkItem>,
    next_work_item_id: u64,
    sequence_log: BTreeMap<InstanceUuid, SequenceLog>,
}

pub struct DataStore {
    tables: Mutex<Tables>,
    locks: lock::RowLocks,
}

impl DataStore {
    pub fn new(log: &Logger) -> DataStore {
        debug!(log, "creating in-memory datastore");
        DataStore {
            tables: Mutex::new(Tables::default()),
            locks: lock::RowLocks::default(),
        }
    }

    /// Acquires the given row locks in sorted order
    ///
    /// Returns [`Error::Conflict`] if they could not all be acquired within
    /// `timeout`.
    pub async fn lock_rows(
        &self,
        opctx: &OpContext,
        keys: impl IntoIterator<Item = LockKey>,
        timeout: Duration,
    ) -> Result<RowLockGuard, Error> {
        let guard = self.locks.lock_sorted(keys, timeout).await;
        match &guard {
            Ok(guard) => {
                trace!(opctx.log, "acquired row locks"; "keys" => ?guard.keys())
            }
            Err(error) => {
                debug!(opctx.log, "failed to acquire row locks";
                    "error" => %error)
            }
        }
        guard
    }
}
