// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task initialization

use super::tasks::finished_work_cleanup::FinishedWorkCleanup;
use super::tasks::unfinished_work_cleanup::UnfinishedWorkSweeper;
use super::Driver;
use super::TaskName;
use crate::app::work_queue::WorkScheduler;
use crate::config::BackgroundTaskConfig;
use crate::context::OpContext;
use crate::db::DataStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Names of the well-known background tasks
#[derive(Clone, Debug)]
pub struct BackgroundTasks {
    pub task_finished_work_cleanup: TaskName,
    pub task_unfinished_work_cleanup: TaskName,
}

/// Kick off all background tasks
///
/// Returns a `Driver` that can be used for inspecting background tasks and
/// their state, along with the names of the well-known tasks.
pub fn init(
    opctx: &OpContext,
    datastore: Arc<DataStore>,
    scheduler: Arc<WorkScheduler>,
    config: &BackgroundTaskConfig,
) -> (Driver, BackgroundTasks) {
    let mut driver = Driver::new();

    let task_finished_work_cleanup = {
        let task = FinishedWorkCleanup::new(
            Arc::clone(&datastore),
            config.finished_work_cleanup.retention_secs,
        );
        driver.register(
            String::from("finished_work_cleanup"),
            String::from(
                "deletes security group work items that finished long ago",
            ),
            config.finished_work_cleanup.period_secs,
            Box::new(task),
            opctx.child(BTreeMap::new()),
        )
    };

    let task_unfinished_work_cleanup = {
        let interval = config.unfinished_work_cleanup.period_secs;
        let task = UnfinishedWorkSweeper::new(datastore, scheduler, interval);
        driver.register(
            String::from("unfinished_work_cleanup"),
            String::from(
                "reschedules security group work items that have been \
                pending too long",
            ),
            interval,
            Box::new(task),
            opctx.child(BTreeMap::new()),
        )
    };

    (
        driver,
        BackgroundTasks {
            task_finished_work_cleanup,
            task_unfinished_work_cleanup,
        },
    )
}
