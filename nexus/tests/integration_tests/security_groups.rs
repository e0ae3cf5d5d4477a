// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for managing security groups and their rules

use crate::common::allow_tcp_from_group;
use crate::common::create_group;
use crate::common::create_instance;
use crate::common::name;
use crate::common::tcp_ingress;
use crate::common::test_setup;
use assert_matches::assert_matches;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::RuleProtocol;
use secgroup_common::api::external::RuleSourceParams;
use secgroup_common::api::external::SecurityGroupCreate;
use secgroup_nexus::TestInterfaces as _;

#[tokio::test]
async fn test_group_names_are_unique_per_account() {
    let cptestctx = test_setup("test_group_names_are_unique_per_account", 0).await;
    let nexus = &cptestctx.nexus;
    let opctx = &cptestctx.opctx;

    create_group(&cptestctx, "web").await;
    let error = nexus
        .security_group_create(
            opctx,
            cptestctx.account_id,
            SecurityGroupCreate {
                name: name("web"),
                description: String::from("again"),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(error, Error::ObjectAlreadyExists { .. });

    // "default" always belongs to the account's default group.
    let error = nexus
        .security_group_create(
            opctx,
            cptestctx.account_id,
            SecurityGroupCreate {
                name: name("default"),
                description: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(error, Error::ObjectAlreadyExists { .. });

    let names: Vec<_> = nexus
        .security_group_list(opctx, cptestctx.account_id)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.name.to_string())
        .collect();
    assert_eq!(names, ["default", "web"]);
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_default_group_cannot_be_deleted() {
    let cptestctx = test_setup("test_default_group_cannot_be_deleted", 0).await;
    let nexus = &cptestctx.nexus;
    let opctx = &cptestctx.opctx;

    let groups =
        nexus.security_group_list(opctx, cptestctx.account_id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert!(groups[0].is_default());
    assert_matches!(
        nexus.security_group_delete(opctx, groups[0].id).await,
        Err(Error::InvalidRequest { .. })
    );
    nexus.security_group_fetch(opctx, groups[0].id).await.unwrap();
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_delete_group_in_use() {
    let cptestctx = test_setup("test_delete_group_in_use", 0).await;
    let nexus = &cptestctx.nexus;
    let opctx = &cptestctx.opctx;

    let admins = create_group(&cptestctx, "admins").await;
    let db = create_group(&cptestctx, "db").await;
    let rule = allow_tcp_from_group(&cptestctx, &db, 5432, &admins).await;

    // Another group's rule refers to it.
    let error = nexus.security_group_delete(opctx, admins.id).await.unwrap_err();
    assert_matches!(error, Error::ObjectInUse { .. });
    nexus.security_group_fetch(opctx, admins.id).await.unwrap();

    // Once the rule is gone it has members instead.
    nexus.security_group_rule_revoke(opctx, rule.id).await.unwrap();
    let instance =
        create_instance(&cptestctx, "admin-1", "10.9.0.2".parse().unwrap(), &[
            "admins", "default",
        ])
        .await;
    let error = nexus.security_group_delete(opctx, admins.id).await.unwrap_err();
    assert_matches!(error, Error::ObjectInUse { .. });

    nexus.instance_group_remove(opctx, instance.id, admins.id).await.unwrap();
    nexus.security_group_delete(opctx, admins.id).await.unwrap();
    assert_matches!(
        nexus.security_group_fetch(opctx, admins.id).await,
        Err(Error::ObjectNotFound { .. })
    );

    // A group's rules go with it, including ones referring to itself.
    let self_ref = create_group(&cptestctx, "cluster").await;
    allow_tcp_from_group(&cptestctx, &self_ref, 7000, &self_ref).await;
    nexus.security_group_delete(opctx, self_ref.id).await.unwrap();
    assert!(nexus
        .datastore()
        .security_group_rules_list(opctx, self_ref.id)
        .await
        .unwrap()
        .is_empty());
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_rule_validation() {
    let cptestctx = test_setup("test_rule_validation", 0).await;
    let nexus = &cptestctx.nexus;
    let opctx = &cptestctx.opctx;
    let web = create_group(&cptestctx, "web").await;
    let anywhere =
        || RuleSourceParams::Cidr { cidr: "0.0.0.0/0".parse().unwrap() };

    let mut bad_port = tcp_ingress(70000, anywhere());
    assert_matches!(
        nexus.security_group_rule_authorize(opctx, web.id, bad_port.clone()).await,
        Err(Error::InvalidValue { .. })
    );
    bad_port.start_port = Some(443);
    bad_port.end_port = Some(80);
    assert_matches!(
        nexus.security_group_rule_authorize(opctx, web.id, bad_port).await,
        Err(Error::InvalidValue { .. })
    );

    let mut icmp_with_port = tcp_ingress(22, anywhere());
    icmp_with_port.protocol = RuleProtocol::Icmp;
    assert_matches!(
        nexus.security_group_rule_authorize(opctx, web.id, icmp_with_port).await,
        Err(Error::InvalidValue { .. })
    );

    let host_bits = tcp_ingress(22, RuleSourceParams::Cidr {
        cidr: "10.0.0.1/8".parse().unwrap(),
    });
    assert_matches!(
        nexus.security_group_rule_authorize(opctx, web.id, host_bits).await,
        Err(Error::InvalidValue { .. })
    );

    let unknown_group = tcp_ingress(22, RuleSourceParams::Group {
        account: cptestctx.account_id,
        name: name("nobody"),
    });
    assert_matches!(
        nexus.security_group_rule_authorize(opctx, web.id, unknown_group).await,
        Err(Error::ObjectNotFound { .. })
    );

    assert!(nexus
        .security_group_rules_list(opctx, web.id)
        .await
        .unwrap()
        .is_empty());
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_duplicate_rule_is_returned() {
    let cptestctx = test_setup("test_duplicate_rule_is_returned", 0).await;
    let nexus = &cptestctx.nexus;
    let opctx = &cptestctx.opctx;
    let web = create_group(&cptestctx, "web").await;
    let https = || {
        tcp_ingress(443, RuleSourceParams::Cidr {
            cidr: "0.0.0.0/0".parse().unwrap(),
        })
    };

    let first =
        nexus.security_group_rule_authorize(opctx, web.id, https()).await.unwrap();
    let second =
        nexus.security_group_rule_authorize(opctx, web.id, https()).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(
        nexus.security_group_rules_list(opctx, web.id).await.unwrap().len(),
        1
    );

    nexus.security_group_rule_revoke(opctx, first.id).await.unwrap();
    assert_matches!(
        nexus.security_group_rule_revoke(opctx, first.id).await,
        Err(Error::ObjectNotFound { .. })
    );
    cptestctx.teardown().await;
}
