// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::background::SweepSummary;
use super::background::UnfinishedWorkSweeper;
use crate::context::OpContext;
use crate::db::model::WorkItem;
use crate::db::DataStore;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;
use std::sync::Arc;
use std::time::Duration;

/// Exposes additional [`Nexus`](super::Nexus) interfaces for use by the test
/// suite
#[async_trait]
pub trait TestInterfaces {
    /// Access the datastore directly.
    fn datastore(&self) -> &Arc<DataStore>;

    /// Returns the newest work item for an instance, if any.
    async fn instance_latest_work_item(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<Option<WorkItem>, Error>;

    /// Runs the unfinished-work sweep as if the clock read `now`.
    async fn sweep_unfinished_work(
        &self,
        opctx: &OpContext,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> Result<SweepSummary, Error>;
}

#[async_trait]
impl TestInterfaces for super::Nexus {
    fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    async fn instance_latest_work_item(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<Option<WorkItem>, Error> {
        self.datastore.work_item_latest(opctx, instance_id).await
    }

    async fn sweep_unfinished_work(
        &self,
        opctx: &OpContext,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> Result<SweepSummary, Error> {
        let sweeper = UnfinishedWorkSweeper::new(
            Arc::clone(&self.datastore),
            Arc::clone(&self.scheduler),
            interval,
        );
        sweeper.sweep(opctx, now).await
    }
}
