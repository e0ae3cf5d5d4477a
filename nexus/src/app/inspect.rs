// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-facing view of ruleset propagation

use crate::context::OpContext;
use crate::db::model::WorkItem;
use chrono::DateTime;
use chrono::Utc;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// When something last happened to an instance's ruleset, and with which
/// sequence number
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct PropagationEvent {
    pub sequence: u64,
    pub time: DateTime<Utc>,
}

#[derive(Default)]
struct StatsInner {
    last_scheduled: BTreeMap<InstanceUuid, PropagationEvent>,
    last_sent: BTreeMap<InstanceUuid, PropagationEvent>,
    disabled: BTreeSet<InstanceUuid>,
    dropped_batches: u64,
}

/// In-memory bookkeeping shared by the scheduler and dispatcher
#[derive(Default)]
pub struct PropagationStats {
    inner: Mutex<StatsInner>,
}

impl PropagationStats {
    pub fn record_scheduled(&self, instance_id: InstanceUuid, sequence: u64) {
        self.inner.lock().unwrap().last_scheduled.insert(
            instance_id,
            PropagationEvent { sequence, time: Utc::now() },
        );
    }

    pub fn record_sent(&self, instance_id: InstanceUuid, sequence: u64) {
        self.inner
            .lock()
            .unwrap()
            .last_sent
            .insert(instance_id, PropagationEvent { sequence, time: Utc::now() });
    }

    pub fn record_dropped_batch(&self) {
        self.inner.lock().unwrap().dropped_batches += 1;
    }

    pub fn dropped_batches(&self) -> u64 {
        self.inner.lock().unwrap().dropped_batches
    }

    pub fn set_enabled(&self, instance_id: InstanceUuid, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if enabled {
            inner.disabled.remove(&instance_id);
        } else {
            inner.disabled.insert(instance_id);
        }
    }

    /// Drops everything recorded about an instance
    pub fn forget(&self, instance_id: InstanceUuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_scheduled.remove(&instance_id);
        inner.last_sent.remove(&instance_id);
        inner.disabled.remove(&instance_id);
    }

    pub fn is_enabled(&self, instance_id: InstanceUuid) -> bool {
        !self.inner.lock().unwrap().disabled.contains(&instance_id)
    }

    fn snapshot(
        &self,
        instance_id: InstanceUuid,
    ) -> (Option<PropagationEvent>, Option<PropagationEvent>, bool) {
        let inner = self.inner.lock().unwrap();
        (
            inner.last_scheduled.get(&instance_id).copied(),
            inner.last_sent.get(&instance_id).copied(),
            !inner.disabled.contains(&instance_id),
        )
    }
}

/// Everything known about one instance's ruleset propagation
#[derive(Clone, Debug, Serialize)]
pub struct PropagationStatus {
    pub instance_id: InstanceUuid,
    pub scheduler_enabled: bool,
    /// current value of the instance's sequence log, if it has one
    pub log_sequence: Option<u64>,
    pub last_scheduled: Option<PropagationEvent>,
    pub last_sent: Option<PropagationEvent>,
    pub latest_work_item: Option<WorkItem>,
}

impl super::Nexus {
    /// Number of work items not yet finished
    pub async fn queue_depth(&self, opctx: &OpContext) -> Result<usize, Error> {
        self.datastore.work_queue_depth(opctx).await
    }

    pub async fn propagation_status(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<PropagationStatus, Error> {
        let instance = self
            .datastore
            .instance_fetch_including_deleted(opctx, instance_id)
            .await?;
        let log_sequence = self
            .datastore
            .sequence_log_fetch(opctx, instance.id)
            .await?
            .map(|log| log.sequence);
        let latest_work_item =
            self.datastore.work_item_latest(opctx, instance.id).await?;
        let (last_scheduled, last_sent, scheduler_enabled) =
            self.stats.snapshot(instance.id);
        Ok(PropagationStatus {
            instance_id,
            scheduler_enabled,
            log_sequence,
            last_scheduled,
            last_sent,
            latest_work_item,
        })
    }

    /// Enables or disables ruleset scheduling for one instance
    ///
    /// While disabled, requests to schedule the instance are ignored.
    pub async fn set_scheduler_enabled(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        enabled: bool,
    ) -> Result<(), Error> {
        self.datastore.instance_fetch(opctx, instance_id).await?;
        info!(opctx.log, "setting ruleset scheduling";
            "instance_id" => %instance_id,
            "enabled" => enabled);
        self.stats.set_enabled(instance_id, enabled);
        Ok(())
    }

    /// Immediately pushes the instance's current ruleset to its agent,
    /// bypassing the work queue
    pub async fn force_resend(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<u64, Error> {
        self.dispatcher.force_resend(opctx, instance_id).await
    }

    /// Pushes dropped by per-agent admission control since startup
    pub fn discard_count(&self) -> u64 {
        self.tracker.discard_count()
    }

    /// Batches dropped because the global work lock could not be acquired
    pub fn dropped_batch_count(&self) -> u64 {
        self.stats.dropped_batches()
    }
}
