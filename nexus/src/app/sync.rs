// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of an agent's applied rulesets against the sequence log

use super::work_queue::WorkScheduler;
use crate::context::OpContext;
use crate::db::DataStore;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

/// Schedules a re-push for every instance on `host_id` whose applied ruleset
/// may be out of date
///
/// `reported` is what the agent says it has applied, by instance.  An
/// instance running on the host is out of sync if the agent reported a
/// sequence different from the sequence log, or did not report it at all.
/// Instances the agent reported that are no longer running there are left
/// alone.  Nothing is bumped: the agent just needs the current ruleset.
///
/// Returns the instances that were scheduled.
pub async fn full_sync(
    datastore: &DataStore,
    scheduler: &WorkScheduler,
    opctx: &OpContext,
    host_id: HostUuid,
    reported: &BTreeMap<InstanceUuid, u64>,
) -> Result<BTreeSet<InstanceUuid>, Error> {
    let log = &opctx.log;
    let running = datastore.instances_running_on_host(opctx, host_id).await?;

    let mut out_of_sync = BTreeSet::new();
    for instance in &running {
        let expected = datastore
            .sequence_log_fetch(opctx, instance.id)
            .await?
            .map(|l| l.sequence);
        match (reported.get(&instance.id), expected) {
            (Some(applied), Some(expected)) if *applied == expected => (),
            (applied, expected) => {
                debug!(log, "instance ruleset out of sync";
                    "instance_id" => %instance.id,
                    "applied" => ?applied,
                    "expected" => ?expected);
                out_of_sync.insert(instance.id);
            }
        }
    }

    let unknown = reported
        .keys()
        .filter(|id| !running.iter().any(|i| i.id == **id))
        .count();
    if unknown > 0 {
        debug!(log, "agent reported instances not running on its host";
            "count" => unknown);
    }

    if out_of_sync.is_empty() {
        debug!(log, "agent rulesets in sync"; "host_id" => %host_id);
        return Ok(out_of_sync);
    }

    info!(log, "scheduling ruleset resync";
        "host_id" => %host_id,
        "instances" => out_of_sync.len());
    scheduler
        .schedule_update(opctx, out_of_sync.clone(), false, Duration::ZERO)
        .await?;
    Ok(out_of_sync)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::inspect::PropagationStats;
    use crate::db::model::Instance;
    use crate::db::model::InstanceState;
    use crate::db::model::NetworkInterface;
    use chrono::Utc;
    use secgroup_common::typed_uuid::AccountUuid;
    use secgroup_test_utils::dev::test_setup_log;
    use std::sync::Arc;

    async fn instance(
        datastore: &DataStore,
        opctx: &OpContext,
        host_id: HostUuid,
        state: InstanceState,
    ) -> InstanceUuid {
        let id = InstanceUuid::new_v4();
        datastore
            .instance_insert(
                opctx,
                Instance {
                    id,
                    account_id: AccountUuid::new_v4(),
                    name: "vm".parse().unwrap(),
                    state,
                    host_id: Some(host_id),
                    nic: NetworkInterface {
                        ipv4: "10.0.0.2".parse().unwrap(),
                        ipv6: None,
                        mac: "02:08:20:00:00:02".parse().unwrap(),
                        secondary_ips: vec![],
                    },
                    time_created: Utc::now(),
                    time_deleted: None,
                },
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_full_sync_schedules_mismatches() {
        let logctx = test_setup_log("test_full_sync_schedules_mismatches");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = Arc::new(DataStore::new(&logctx.log));
        let (scheduler, _rx) = WorkScheduler::new(
            &logctx.log,
            Arc::clone(&datastore),
            Duration::from_secs(5),
            Arc::new(PropagationStats::default()),
        );
        let host = HostUuid::new_v4();

        let in_sync = instance(&datastore, &opctx, host, InstanceState::Running).await;
        let behind = instance(&datastore, &opctx, host, InstanceState::Running).await;
        let missing = instance(&datastore, &opctx, host, InstanceState::Running).await;
        let stopped = instance(&datastore, &opctx, host, InstanceState::Stopped).await;
        let elsewhere =
            instance(&datastore, &opctx, HostUuid::new_v4(), InstanceState::Running)
                .await;
        datastore
            .work_items_schedule(
                &opctx,
                &BTreeSet::from([in_sync, behind, missing, stopped, elsewhere]),
                true,
            )
            .await
            .unwrap();
        datastore
            .work_items_schedule(&opctx, &BTreeSet::from([behind]), true)
            .await
            .unwrap();

        let reported = BTreeMap::from([
            (in_sync, 1),
            (behind, 1),
            (stopped, 1),
            (InstanceUuid::new_v4(), 7),
        ]);
        let scheduled = full_sync(&datastore, &scheduler, &opctx, host, &reported)
            .await
            .unwrap();
        assert_eq!(scheduled, BTreeSet::from([behind, missing]));

        // Resync never advances the sequence.
        let log = datastore.sequence_log_fetch(&opctx, behind).await.unwrap();
        assert_eq!(log.unwrap().sequence, 2);
        logctx.cleanup_successful();
    }
}
