// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on the per-instance sequence log

use super::DataStore;
use super::Tables;
use crate::context::OpContext;
use crate::db::model::SequenceLog;
use chrono::Utc;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;

impl Tables {
    /// Returns the instance's log row, creating it at sequence 0 if needed,
    /// and bumps it if asked
    pub(super) fn sequence_log_advance(
        &mut self,
        instance_id: InstanceUuid,
        bump: bool,
    ) -> u64 {
        let now = Utc::now();
        let log = self.sequence_log.entry(instance_id).or_insert_with(|| {
            SequenceLog { instance_id, sequence: 0, time_updated: now }
        });
        if bump {
            log.sequence += 1;
            log.time_updated = now;
        }
        log.sequence
    }
}

impl DataStore {
    pub async fn sequence_log_fetch(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<Option<SequenceLog>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.sequence_log.get(&instance_id).cloned())
    }

    /// Returns the instance's current sequence number, creating its log row
    /// if it has none
    pub async fn sequence_log_current(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<u64, Error> {
        let mut tables = self.tables.lock().unwrap();
        Ok(tables.sequence_log_advance(instance_id, false))
    }
}
