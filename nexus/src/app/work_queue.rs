// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling of ruleset pushes
//!
//! Anything that changes an instance's effective ruleset calls
//! [`WorkScheduler::schedule_update()`] with the set of affected instances.
//! The scheduler records one pending work item per instance (coalescing
//! repeats) under the global work lock, then wakes the dispatcher's workers
//! once per instance.  It never talks to agents itself.

use super::inspect::PropagationStats;
use crate::context::OpContext;
use crate::db::DataStore;
use crate::db::datastore::GLOBAL_WORK_LOCK;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What happened to a scheduling request
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScheduleOutcome {
    /// Work items were recorded for `instances`.  `disabled` were skipped
    /// because scheduling is disabled for them.
    Scheduled {
        instances: BTreeSet<InstanceUuid>,
        disabled: BTreeSet<InstanceUuid>,
    },
    /// The global work lock could not be acquired; nothing was recorded.
    Dropped,
}

pub struct WorkScheduler {
    log: Logger,
    datastore: Arc<DataStore>,
    global_lock_timeout: Duration,
    stats: Arc<PropagationStats>,
    wakeups: mpsc::UnboundedSender<()>,
}

impl WorkScheduler {
    /// Returns the scheduler and the receiving end of its worker wakeups
    pub fn new(
        log: &Logger,
        datastore: Arc<DataStore>,
        global_lock_timeout: Duration,
        stats: Arc<PropagationStats>,
    ) -> (WorkScheduler, mpsc::UnboundedReceiver<()>) {
        let (wakeups, rx) = mpsc::unbounded_channel();
        let scheduler = WorkScheduler {
            log: log.new(o!("component" => "WorkScheduler")),
            datastore,
            global_lock_timeout,
            stats,
            wakeups,
        };
        (scheduler, rx)
    }

    /// Records that each of `instance_ids` needs its ruleset re-pushed
    ///
    /// If `bump` is set, each instance's sequence log is advanced first.
    /// Workers are woken after `delay`.  If the global work lock can't be
    /// acquired in time the whole batch is dropped and left for the
    /// unfinished-work sweep and agent resyncs to catch up on.
    pub async fn schedule_update(
        &self,
        opctx: &OpContext,
        instance_ids: BTreeSet<InstanceUuid>,
        bump: bool,
        delay: Duration,
    ) -> Result<ScheduleOutcome, Error> {
        let (instances, disabled): (BTreeSet<_>, BTreeSet<_>) = instance_ids
            .into_iter()
            .partition(|id| self.stats.is_enabled(*id));
        if !disabled.is_empty() {
            debug!(opctx.log, "skipping instances with scheduling disabled";
                "instances" => ?disabled);
        }
        if instances.is_empty() {
            return Ok(ScheduleOutcome::Scheduled { instances, disabled });
        }

        let guard = match self
            .datastore
            .lock_rows(opctx, [GLOBAL_WORK_LOCK], self.global_lock_timeout)
            .await
        {
            Ok(guard) => guard,
            Err(error) => {
                warn!(self.log, "dropping ruleset scheduling batch";
                    "instances" => instances.len(),
                    "error" => %error);
                self.stats.record_dropped_batch();
                return Ok(ScheduleOutcome::Dropped);
            }
        };
        let scheduled =
            self.datastore.work_items_schedule(opctx, &instances, bump).await;
        drop(guard);
        let scheduled = scheduled?;

        for work in &scheduled {
            debug!(opctx.log, "scheduled ruleset update";
                "instance_id" => %work.instance_id,
                "work_item_id" => work.work_item_id,
                "sequence" => work.sequence,
                "coalesced" => work.coalesced);
            self.stats.record_scheduled(work.instance_id, work.sequence);
        }
        for _ in &scheduled {
            self.wake_after(delay);
        }

        Ok(ScheduleOutcome::Scheduled { instances, disabled })
    }

    /// Wakes one worker after `delay`
    pub fn wake_after(&self, delay: Duration) {
        if delay.is_zero() {
            self.wake();
            return;
        }
        let wakeups = self.wakeups.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The receiver goes away only at shutdown.
            let _ = wakeups.send(());
        });
    }

    fn wake(&self) {
        if self.wakeups.send(()).is_err() {
            trace!(self.log, "no workers to wake");
        }
    }
}
