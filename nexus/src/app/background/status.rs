// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! View status of background tasks (for support and debugging)

use super::Driver;
use crate::Nexus;
use crate::context::OpContext;
use chrono::DateTime;
use chrono::Utc;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::LookupResult;
use secgroup_common::api::external::LookupType;
use secgroup_common::api::external::ResourceType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

/// Background tasks
///
/// These are currently only intended for observability by developers and
/// operators.
#[derive(Clone, Debug, Serialize)]
pub struct BackgroundTaskView {
    /// unique identifier for this background task
    pub name: String,
    /// brief summary (for developers) of what this task does
    pub description: String,
    /// how long after an activation completes before another will be
    /// triggered automatically
    pub period: Duration,

    #[serde(flatten)]
    pub status: TaskStatus,
}

impl BackgroundTaskView {
    pub fn new(
        name: &str,
        description: &str,
        period: Duration,
        status: TaskStatus,
    ) -> BackgroundTaskView {
        BackgroundTaskView {
            name: name.to_owned(),
            description: description.to_owned(),
            period,
            status,
        }
    }
}

/// Describes why a background task was activated
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Signaled,
    Timeout,
}

/// Describes the runtime status of the background task
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    /// Describes the current task status
    pub current: CurrentStatus,
    /// Describes the last completed activation
    pub last: LastResult,
}

/// Describes the current status of a background task
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "current_status", content = "details")]
pub enum CurrentStatus {
    /// The background task is waiting for its next activation
    Idle,
    /// The background task has been activated and has not yet finished
    Running(CurrentStatusRunning),
}

impl CurrentStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }

    pub fn unwrap_running(&self) -> &CurrentStatusRunning {
        match self {
            CurrentStatus::Running(r) => r,
            CurrentStatus::Idle => {
                panic!("attempted to get running state of idle task")
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CurrentStatusRunning {
    /// wall-clock time when the current activation started
    pub start_time: DateTime<Utc>,
    /// (local) monotonic timestamp when the activation started
    #[allow(dead_code)]
    #[serde(skip)]
    pub start_instant: Instant,
    /// what kind of event triggered this activation
    pub reason: ActivationReason,
    /// which iteration this was (counter)
    pub iteration: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "last_result", content = "details")]
pub enum LastResult {
    /// The task has never completed an activation
    NeverCompleted,
    /// The task has completed at least one activation
    Completed(LastResultCompleted),
}

impl LastResult {
    pub fn has_completed(&self) -> bool {
        matches!(self, LastResult::Completed(_))
    }

    pub fn unwrap_completion(self) -> LastResultCompleted {
        match self {
            LastResult::Completed(r) => r,
            LastResult::NeverCompleted => {
                panic!(
                    "attempted to get completion state of a task that \
                    has never completed"
                );
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LastResultCompleted {
    /// which iteration this was (counter)
    pub iteration: u64,
    /// wall-clock time when the activation started
    pub start_time: DateTime<Utc>,
    /// what kind of event triggered this activation
    pub reason: ActivationReason,
    /// total time elapsed during the activation
    pub elapsed: Duration,
    /// arbitrary datum emitted by the background task
    pub details: serde_json::Value,
}

impl Nexus {
    pub fn bgtasks_list(
        &self,
        _opctx: &OpContext,
    ) -> BTreeMap<String, BackgroundTaskView> {
        let driver = self.driver();
        driver
            .tasks()
            .map(|t| {
                let name = t.as_str();
                let description = driver.task_description(t);
                let period = driver.task_period(t);
                let status = driver.task_status(t);
                (
                    name.to_owned(),
                    BackgroundTaskView::new(name, description, period, status),
                )
            })
            .collect()
    }

    pub fn bgtask_status(
        &self,
        _opctx: &OpContext,
        name: &str,
    ) -> LookupResult<BackgroundTaskView> {
        let driver = self.driver();
        let task =
            driver.tasks().find(|t| t.as_str() == name).ok_or_else(|| {
                LookupType::from(name)
                    .into_not_found(ResourceType::BackgroundTask)
            })?;
        let description = driver.task_description(task);
        let status = driver.task_status(task);
        let period = driver.task_period(task);
        Ok(BackgroundTaskView::new(task.as_str(), description, period, status))
    }

    pub fn bgtask_activate(
        &self,
        opctx: &OpContext,
        mut names: BTreeSet<String>,
    ) -> Result<(), Error> {
        let driver = self.driver();

        // Ensure all task names are valid by removing them from the set of
        // names as we find them.
        let tasks_to_activate: Vec<_> =
            driver.tasks().filter(|t| names.remove(t.as_str())).collect();

        // If any names weren't recognized, return an error.
        if !names.is_empty() {
            let names_str = format!(
                "background tasks: {}",
                names.into_iter().collect::<Vec<_>>().join(", ")
            );
            return Err(LookupType::ByCompositeId(names_str)
                .into_not_found(ResourceType::BackgroundTask));
        }

        for task in tasks_to_activate {
            info!(opctx.log, "activating background task";
                "task" => task.as_str());
            driver.activate(task);
        }

        Ok(())
    }

    fn driver(&self) -> &Driver {
        &self.background_tasks_driver
    }
}
