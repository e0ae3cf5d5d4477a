// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for rescheduling work that never finished
//!
//! A work item can get stuck if its wakeup was lost, the worker processing it
//! failed partway, or the agent never answered.  Anything still pending after
//! two sweep intervals is marked `Error` and its instance is scheduled again
//! (without advancing its sequence).  This is what guarantees that every
//! instance eventually converges on its current ruleset.

use crate::app::background::BackgroundTask;
use crate::app::work_queue::ScheduleOutcome;
use crate::app::work_queue::WorkScheduler;
use crate::context::OpContext;
use crate::db::DataStore;
use crate::db::model::WorkItem;
use chrono::DateTime;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::InternalContext;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Summary of one sweep
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SweepSummary {
    /// work items found pending past the horizon
    pub swept: usize,
    /// distinct instances scheduled again
    pub rescheduled: usize,
    /// whether the reschedule was dropped for lack of the global work lock
    pub dropped: bool,
}

pub struct UnfinishedWorkSweeper {
    datastore: Arc<DataStore>,
    scheduler: Arc<WorkScheduler>,
    interval: Duration,
}

impl UnfinishedWorkSweeper {
    pub fn new(
        datastore: Arc<DataStore>,
        scheduler: Arc<WorkScheduler>,
        interval: Duration,
    ) -> UnfinishedWorkSweeper {
        UnfinishedWorkSweeper { datastore, scheduler, interval }
    }

    /// Sweeps work items left pending for more than twice the interval, as
    /// of `now`
    pub async fn sweep(
        &self,
        opctx: &OpContext,
        now: DateTime<Utc>,
    ) -> Result<SweepSummary, Error> {
        let horizon = chrono::Duration::from_std(self.interval * 2)
            .map_err(|e| Error::internal_error(&e.to_string()))?;
        let cutoff = now - horizon;

        let stale =
            self.datastore.work_items_unfinished_before(opctx, cutoff).await?;
        if stale.is_empty() {
            return Ok(SweepSummary::default());
        }
        self.sweep_items(opctx, stale, cutoff).await
    }

    /// Marks each of `stale` as failed, unless it finished since it was
    /// read, and reschedules the instances of those that were marked
    async fn sweep_items(
        &self,
        opctx: &OpContext,
        stale: Vec<WorkItem>,
        cutoff: DateTime<Utc>,
    ) -> Result<SweepSummary, Error> {
        let log = &opctx.log;
        let mut swept = 0;
        let mut instances = BTreeSet::new();
        for work in &stale {
            let marked = self
                .datastore
                .work_item_mark_error_if_unfinished(opctx, work.id, cutoff)
                .await
                .with_internal_context(|| {
                    format!("sweeping work item {}", work.id)
                })?;
            if !marked {
                debug!(log, "work item finished before it was swept";
                    "work_item_id" => work.id,
                    "instance_id" => %work.instance_id);
                continue;
            }
            warn!(log, "work item unfinished past horizon";
                "work_item_id" => work.id,
                "instance_id" => %work.instance_id,
                "step" => %work.step,
                "time_updated" => %work.time_updated);
            swept += 1;
            instances.insert(work.instance_id);
        }
        if instances.is_empty() {
            return Ok(SweepSummary::default());
        }

        let rescheduled = instances.len();
        let outcome = self
            .scheduler
            .schedule_update(opctx, instances, false, Duration::ZERO)
            .await?;
        Ok(SweepSummary {
            swept,
            rescheduled,
            dropped: outcome == ScheduleOutcome::Dropped,
        })
    }
}

impl BackgroundTask for UnfinishedWorkSweeper {
    fn activate<'a>(
        &'a mut self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async {
            match self.sweep(opctx, Utc::now()).await {
                Ok(summary) => serde_json::to_value(&summary)
                    .unwrap_or_else(|error| {
                        json!({
                            "error":
                                format!(
                                    "failed to serialize final value: {:#}",
                                    error
                                )
                        })
                    }),
                Err(error) => {
                    error!(
                        &opctx.log,
                        "failed to sweep unfinished work";
                        "error" => %error
                    );
                    json!({
                        "error":
                            format!("failed to sweep unfinished work: {:#}", error)
                    })
                }
            }
        }
        .boxed()
    }
}
