// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background tasks
//!
//! Background tasks are periodic activities that keep the work queue healthy:
//! one deletes finished work items once they're old enough, and the other
//! finds work items that have been pending for too long and reschedules their
//! instances.  The latter is what makes ruleset propagation converge even
//! when pushes are dropped or agents never answer.
//!
//! Each task implements [`BackgroundTask`] and is registered with the
//! [`Driver`], which activates it periodically or on request and keeps track
//! of what it last did.  Activations of a task never overlap.  If a task is
//! activated while running, it runs again once the current activation
//! finishes.

mod driver;
mod init;
mod status;
mod tasks;

pub use driver::Driver;
pub use init::init;
pub use init::BackgroundTasks;
pub use status::ActivationReason;
pub use status::BackgroundTaskView;
pub use status::CurrentStatus;
pub use status::LastResult;
pub use status::TaskStatus;
pub use tasks::unfinished_work_cleanup::SweepSummary;
pub use tasks::unfinished_work_cleanup::UnfinishedWorkSweeper;

use crate::context::OpContext;
use futures::future::BoxFuture;

/// An operation activated both periodically and by an explicit signal
///
/// The value returned by `activate()` is stored with the task's status so
/// that operators can see what the last activation did.
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(
        &'a mut self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value>;
}

/// Identifies a background task registered with the [`Driver`]
#[derive(Clone, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct TaskName(String);

impl TaskName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
