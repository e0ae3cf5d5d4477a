// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests pushing rulesets to agents as groups, rules, and instances change

use crate::common::allow_tcp_from_group;
use crate::common::create_group;
use crate::common::ingress_tcp_cidrs;
use crate::common::start_instance;
use crate::common::test_setup;
use crate::common::wait_for_applied;
use crate::common::ControlPlaneTestContext;
use crate::common::POLL_INTERVAL;
use crate::common::POLL_MAX;
use assert_matches::assert_matches;
use chrono::Utc;
use secgroup_common::api::external::Error;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_nexus::context::OpContext;
use secgroup_nexus::db::model::WorkStep;
use secgroup_nexus::TestInterfaces as _;
use secgroup_sled_agent::sim::FailureMode;
use secgroup_test_utils::dev::poll::wait_for_condition;
use secgroup_test_utils::dev::poll::CondCheckError;
use std::time::Duration;

/// Waits for the newest work item of the instance to reach `step`
async fn wait_for_work_step(
    cptestctx: &ControlPlaneTestContext,
    instance_id: InstanceUuid,
    step: WorkStep,
) {
    let nexus = &cptestctx.nexus;
    let log = &cptestctx.logctx.log;
    wait_for_condition(
        || async move {
            let opctx = OpContext::for_tests(log.clone());
            let work = nexus
                .instance_latest_work_item(&opctx, instance_id)
                .await
                .map_err(CondCheckError::Failed)?;
            match work {
                Some(work) if work.step == step => Ok(()),
                _ => Err(CondCheckError::<Error>::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_group_reference_follows_membership() {
    let cptestctx =
        test_setup("test_group_reference_follows_membership", 2).await;
    let opctx = &cptestctx.opctx;
    let nexus = &cptestctx.nexus;

    // g2 allows ssh from members of g1.
    let g1 = create_group(&cptestctx, "g1").await;
    let g2 = create_group(&cptestctx, "g2").await;
    allow_tcp_from_group(&cptestctx, &g2, 22, &g1).await;

    let v2 = start_instance(
        &cptestctx,
        "v2",
        "10.0.0.6".parse().unwrap(),
        &["g2"],
        0,
    )
    .await;
    // With g1 empty, the rule contributes nothing.
    let applied = wait_for_applied(&cptestctx.agents[0], v2.id, |_| true).await;
    assert!(ingress_tcp_cidrs(&applied, 22).is_empty());

    let v1 = start_instance(
        &cptestctx,
        "v1",
        "10.0.0.5".parse().unwrap(),
        &["g1", "default"],
        1,
    )
    .await;
    let applied = wait_for_applied(&cptestctx.agents[0], v2.id, |a| {
        ingress_tcp_cidrs(a, 22) == ["10.0.0.5/32"]
    })
    .await;
    let sequence = applied.sequence;

    // v1 itself is programmed too, with no ingress from anyone.
    let v1_applied =
        wait_for_applied(&cptestctx.agents[1], v1.id, |_| true).await;
    assert!(v1_applied.ingress.is_empty());

    // Once v1 leaves g1, v2's next push drops the bucket.
    assert!(nexus.instance_group_remove(opctx, v1.id, g1.id).await.unwrap());
    let applied = wait_for_applied(&cptestctx.agents[0], v2.id, |a| {
        a.sequence > sequence
    })
    .await;
    assert!(ingress_tcp_cidrs(&applied, 22).is_empty());

    // Revoking the now-empty rule is fine, and v2 gets another push.
    let rules = nexus.security_group_rules_list(opctx, g2.id).await.unwrap();
    assert_eq!(rules.len(), 1);
    nexus.security_group_rule_revoke(opctx, rules[0].id).await.unwrap();
    wait_for_applied(&cptestctx.agents[0], v2.id, |a| {
        a.sequence > applied.sequence
    })
    .await;
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_stopping_member_updates_referencing_groups() {
    let cptestctx =
        test_setup("test_stopping_member_updates_referencing_groups", 1).await;
    let opctx = &cptestctx.opctx;
    let nexus = &cptestctx.nexus;

    let bastion = create_group(&cptestctx, "bastion").await;
    let web = create_group(&cptestctx, "web").await;
    allow_tcp_from_group(&cptestctx, &web, 22, &bastion).await;

    let server = start_instance(
        &cptestctx,
        "server",
        "10.1.0.2".parse().unwrap(),
        &["web"],
        0,
    )
    .await;
    let jump = start_instance(
        &cptestctx,
        "jump",
        "10.1.0.3".parse().unwrap(),
        &["bastion"],
        0,
    )
    .await;
    let agent = &cptestctx.agents[0];
    wait_for_applied(agent, server.id, |a| {
        ingress_tcp_cidrs(a, 22) == ["10.1.0.3/32"]
    })
    .await;

    nexus.instance_stop(opctx, jump.id).await.unwrap();
    wait_for_applied(agent, server.id, |a| ingress_tcp_cidrs(a, 22).is_empty())
        .await;

    nexus.instance_start(opctx, jump.id, cptestctx.host(0)).await.unwrap();
    wait_for_applied(agent, server.id, |a| {
        ingress_tcp_cidrs(a, 22) == ["10.1.0.3/32"]
    })
    .await;

    nexus.instance_destroy(opctx, jump.id).await.unwrap();
    wait_for_applied(agent, server.id, |a| ingress_tcp_cidrs(a, 22).is_empty())
        .await;
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_programming_failure_is_retried() {
    let cptestctx = test_setup("test_programming_failure_is_retried", 1).await;
    let agent = &cptestctx.agents[0];

    // Fail the first two attempts.  The listener allows three.
    let instance = crate::common::create_instance(
        &cptestctx,
        "flaky",
        "10.2.0.2".parse().unwrap(),
        &[],
    )
    .await;
    agent.set_failure(instance.id, FailureMode::ProgrammingFailed { times: 2 });
    cptestctx
        .nexus
        .instance_start(&cptestctx.opctx, instance.id, cptestctx.host(0))
        .await
        .unwrap();

    wait_for_applied(agent, instance.id, |_| true).await;
    assert_eq!(agent.received(instance.id), 3);
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_cannot_bridge_is_not_retried() {
    let cptestctx = test_setup("test_cannot_bridge_is_not_retried", 1).await;
    let agent = &cptestctx.agents[0];
    let instance = crate::common::create_instance(
        &cptestctx,
        "unbridged",
        "10.2.0.3".parse().unwrap(),
        &[],
    )
    .await;
    agent.set_failure(instance.id, FailureMode::CannotBridgeFirewall);
    cptestctx
        .nexus
        .instance_start(&cptestctx.opctx, instance.id, cptestctx.host(0))
        .await
        .unwrap();

    wait_for_work_step(&cptestctx, instance.id, WorkStep::Error).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.received(instance.id), 1);
    assert!(agent.applied(instance.id).is_none());
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_agent_resync_repushes_forgotten_rulesets() {
    let cptestctx =
        test_setup("test_agent_resync_repushes_forgotten_rulesets", 1).await;
    let agent = &cptestctx.agents[0];
    let instance = start_instance(
        &cptestctx,
        "forgetful",
        "10.3.0.2".parse().unwrap(),
        &[],
        0,
    )
    .await;
    let applied = wait_for_applied(agent, instance.id, |_| true).await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;

    // The agent restarts and reports nothing; a resync pushes the same
    // sequence again.
    agent.forget_all();
    cptestctx.channel.request_report(cptestctx.host(0)).await.unwrap();
    let again = wait_for_applied(agent, instance.id, |_| true).await;
    assert_eq!(again.sequence, applied.sequence);
    assert_eq!(again.signature, applied.signature);
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_unavailable_agent_converges_after_sweep() {
    let cptestctx =
        test_setup("test_unavailable_agent_converges_after_sweep", 1).await;
    let opctx = &cptestctx.opctx;
    let nexus = &cptestctx.nexus;
    let host_id = cptestctx.host(0);

    // The agent is gone when the instance starts, so the push is given up.
    cptestctx.channel.disconnect(host_id).await;
    let instance = start_instance(
        &cptestctx,
        "lonely",
        "10.4.0.2".parse().unwrap(),
        &[],
        0,
    )
    .await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;
    assert!(cptestctx.agents[0].applied(instance.id).is_none());

    // Reconnecting and resyncing brings it back in line.
    cptestctx
        .channel
        .connect(host_id, cptestctx.agents[0].clone())
        .await;
    wait_for_applied(&cptestctx.agents[0], instance.id, |_| true).await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;

    // Nothing is left for the sweep to do.
    let summary = nexus
        .sweep_unfinished_work(
            opctx,
            Utc::now() + chrono::Duration::seconds(600),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert_eq!(summary.rescheduled, 0);
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_sweep_reschedules_stuck_work() {
    let cptestctx = test_setup("test_sweep_reschedules_stuck_work", 1).await;
    let opctx = &cptestctx.opctx;
    let nexus = &cptestctx.nexus;

    let instance = start_instance(
        &cptestctx,
        "stuck",
        "10.5.0.2".parse().unwrap(),
        &[],
        0,
    )
    .await;
    wait_for_applied(&cptestctx.agents[0], instance.id, |_| true).await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;

    // Leave a work item stranded as though its wakeup had been lost.
    let scheduled = nexus
        .datastore()
        .work_items_schedule(
            opctx,
            &std::collections::BTreeSet::from([instance.id]),
            true,
        )
        .await
        .unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(nexus.queue_depth(opctx).await.unwrap(), 1);

    let summary = nexus
        .sweep_unfinished_work(
            opctx,
            Utc::now() + chrono::Duration::seconds(121),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert_eq!(summary.swept, 1);
    assert_eq!(summary.rescheduled, 1);
    let stranded = nexus
        .datastore()
        .work_item_fetch(opctx, scheduled[0].work_item_id)
        .await
        .unwrap();
    assert_eq!(stranded.step, WorkStep::Error);

    // The replacement carries the bumped sequence to the agent.
    let sequence = scheduled[0].sequence;
    wait_for_applied(&cptestctx.agents[0], instance.id, |a| {
        a.sequence == sequence
    })
    .await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_management_overrides() {
    let cptestctx = test_setup("test_management_overrides", 1).await;
    let opctx = &cptestctx.opctx;
    let nexus = &cptestctx.nexus;
    let agent = &cptestctx.agents[0];

    let instance = start_instance(
        &cptestctx,
        "managed",
        "10.6.0.2".parse().unwrap(),
        &[],
        0,
    )
    .await;
    let applied = wait_for_applied(agent, instance.id, |_| true).await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;

    let status = nexus.propagation_status(opctx, instance.id).await.unwrap();
    assert!(status.scheduler_enabled);
    assert_eq!(status.log_sequence, Some(applied.sequence));
    assert_eq!(status.last_sent.map(|e| e.sequence), Some(applied.sequence));

    // With scheduling disabled, group changes leave the instance alone.
    nexus.set_scheduler_enabled(opctx, instance.id, false).await.unwrap();
    let other = create_group(&cptestctx, "other").await;
    nexus.instance_group_add(opctx, instance.id, other.id).await.unwrap();
    let status = nexus.propagation_status(opctx, instance.id).await.unwrap();
    assert!(!status.scheduler_enabled);
    assert_eq!(status.log_sequence, Some(applied.sequence));

    // A forced push goes out anyway, at the current sequence.
    let received = agent.received(instance.id);
    let sequence = nexus.force_resend(opctx, instance.id).await.unwrap();
    assert_eq!(sequence, applied.sequence);
    wait_for_condition(
        || {
            let resent = agent.received(instance.id) > received;
            async move {
                if resent {
                    Ok(())
                } else {
                    Err(CondCheckError::<()>::NotYet)
                }
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();

    nexus.instance_stop(opctx, instance.id).await.unwrap();
    assert_matches!(
        nexus.force_resend(opctx, instance.id).await,
        Err(Error::InvalidRequest { .. })
    );
    assert_eq!(nexus.discard_count(), 0);
    assert_eq!(nexus.dropped_batch_count(), 0);
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_destroy_clears_propagation_status() {
    let cptestctx = test_setup("test_destroy_clears_propagation_status", 1).await;
    let opctx = &cptestctx.opctx;
    let nexus = &cptestctx.nexus;
    let agent = &cptestctx.agents[0];

    let instance = start_instance(
        &cptestctx,
        "short-lived",
        "10.7.0.2".parse().unwrap(),
        &[],
        0,
    )
    .await;
    wait_for_applied(agent, instance.id, |_| true).await;
    wait_for_work_step(&cptestctx, instance.id, WorkStep::Done).await;
    nexus.set_scheduler_enabled(opctx, instance.id, false).await.unwrap();
    let status = nexus.propagation_status(opctx, instance.id).await.unwrap();
    assert!(!status.scheduler_enabled);
    assert!(status.last_sent.is_some());

    nexus.instance_destroy(opctx, instance.id).await.unwrap();
    let status = nexus.propagation_status(opctx, instance.id).await.unwrap();
    assert!(status.scheduler_enabled);
    assert!(status.last_scheduled.is_none());
    assert!(status.last_sent.is_none());
    cptestctx.teardown().await;
}
