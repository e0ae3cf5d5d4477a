// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for inspecting and activating background tasks

use crate::common::test_setup;
use crate::common::POLL_INTERVAL;
use crate::common::POLL_MAX;
use assert_matches::assert_matches;
use secgroup_common::api::external::Error;
use secgroup_nexus::app::background::ActivationReason;
use secgroup_nexus::app::background::LastResult;
use secgroup_test_utils::dev::poll::wait_for_condition;
use secgroup_test_utils::dev::poll::CondCheckError;
use std::collections::BTreeSet;

#[tokio::test]
async fn test_bgtask_activate() {
    let cptestctx = test_setup("test_bgtask_activate", 1).await;
    let nexus = &cptestctx.nexus;
    let opctx = &cptestctx.opctx;

    let tasks = nexus.bgtasks_list(opctx);
    assert_eq!(
        tasks.keys().map(String::as_str).collect::<Vec<_>>(),
        ["finished_work_cleanup", "unfinished_work_cleanup"]
    );

    assert_matches!(
        nexus.bgtask_activate(
            opctx,
            BTreeSet::from([
                String::from("unfinished_work_cleanup"),
                String::from("no_such_task"),
            ])
        ),
        Err(Error::ObjectNotFound { .. })
    );

    let name = nexus.background_tasks().task_unfinished_work_cleanup.clone();
    nexus
        .bgtask_activate(opctx, BTreeSet::from([name.as_str().to_owned()]))
        .unwrap();
    wait_for_condition(
        || {
            let view = nexus.bgtask_status(opctx, name.as_str());
            async move {
                match view.map_err(CondCheckError::Failed)?.status.last {
                    LastResult::Completed(last)
                        if matches!(last.reason, ActivationReason::Signaled) =>
                    {
                        Ok(last)
                    }
                    _ => Err(CondCheckError::<Error>::NotYet),
                }
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();

    // Nothing is stuck, so the sweep found nothing.
    let last = nexus
        .bgtask_status(opctx, name.as_str())
        .unwrap()
        .status
        .last
        .unwrap_completion();
    assert_eq!(last.details["swept"], 0);
    cptestctx.teardown().await;
}
