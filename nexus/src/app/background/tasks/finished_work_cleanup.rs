// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for deleting finished work items once they are old enough

use crate::app::background::BackgroundTask;
use crate::context::OpContext;
use crate::db::DataStore;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Deletes `Done` and `Error` work items last updated more than `retention`
/// ago
pub struct FinishedWorkCleanup {
    datastore: Arc<DataStore>,
    retention: Duration,
}

impl FinishedWorkCleanup {
    pub fn new(
        datastore: Arc<DataStore>,
        retention: Duration,
    ) -> FinishedWorkCleanup {
        FinishedWorkCleanup { datastore, retention }
    }
}

impl BackgroundTask for FinishedWorkCleanup {
    fn activate<'a>(
        &'a mut self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async {
            let log = &opctx.log;
            let retention = match chrono::Duration::from_std(self.retention) {
                Ok(retention) => retention,
                Err(error) => {
                    error!(log, "invalid retention"; "error" => %error);
                    return json!({ "error": error.to_string() });
                }
            };
            let cutoff = Utc::now() - retention;

            match self
                .datastore
                .work_items_delete_finished_before(opctx, cutoff)
                .await
            {
                Ok(deleted) => {
                    if deleted > 0 {
                        info!(log, "deleted finished work items";
                            "count" => deleted);
                    }
                    json!({ "deleted": deleted })
                }
                Err(error) => {
                    warn!(
                        log,
                        "failed to delete finished work items";
                        "error" => %error
                    );
                    json!({
                        "error":
                            format!(
                                "failed to delete finished work items: {:#}",
                                error
                            )
                    })
                }
            }
        }
        .boxed()
    }
}
