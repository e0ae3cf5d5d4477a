// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Harness for running Nexus against simulated agents

use secgroup_common::api::external::Name;
use secgroup_common::api::external::RuleDirection;
use secgroup_common::api::external::RuleProtocol;
use secgroup_common::api::external::RuleSourceParams;
use secgroup_common::api::external::SecurityGroupCreate;
use secgroup_common::api::external::SecurityGroupRuleCreate;
use secgroup_common::typed_uuid::AccountUuid;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_nexus::app::agent_channel::LocalAgentChannel;
use secgroup_nexus::app::instance::InstanceCreate;
use secgroup_nexus::context::OpContext;
use secgroup_nexus::db::model::Instance;
use secgroup_nexus::db::model::NetworkInterface;
use secgroup_nexus::db::model::SecurityGroup;
use secgroup_nexus::db::model::SecurityGroupRule;
use secgroup_nexus::Config;
use secgroup_nexus::Nexus;
use secgroup_sled_agent::sim::AppliedRuleset;
use secgroup_sled_agent::sim::SimFirewallAgent;
use secgroup_test_utils::dev::poll::wait_for_condition;
use secgroup_test_utils::dev::poll::CondCheckError;
use secgroup_test_utils::dev::test_setup_log;
use secgroup_test_utils::dev::LogContext;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const POLL_MAX: Duration = Duration::from_secs(30);

pub struct ControlPlaneTestContext {
    pub nexus: Arc<Nexus>,
    pub channel: Arc<LocalAgentChannel>,
    pub agents: Vec<Arc<SimFirewallAgent>>,
    pub account_id: AccountUuid,
    pub opctx: OpContext,
    pub logctx: LogContext,
}

impl ControlPlaneTestContext {
    pub fn host(&self, i: usize) -> HostUuid {
        self.agents[i].host_id()
    }

    pub async fn teardown(self) {
        for agent in &self.agents {
            self.channel.disconnect(agent.host_id()).await;
        }
        drop(self.nexus);
        self.logctx.cleanup_successful();
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.propagation.worker_count = 2;
    config.propagation.answer_timeout = Duration::from_secs(10);
    config.propagation.retry_delay = Duration::from_millis(50);
    config
}

pub async fn test_setup(
    test_name: &str,
    host_count: usize,
) -> ControlPlaneTestContext {
    test_setup_with_config(test_name, host_count, test_config()).await
}

pub async fn test_setup_with_config(
    test_name: &str,
    host_count: usize,
    config: Config,
) -> ControlPlaneTestContext {
    let logctx = test_setup_log(test_name);
    let log = &logctx.log;
    let channel = Arc::new(LocalAgentChannel::new(
        log,
        config.propagation.answer_timeout,
    ));
    let nexus = Nexus::new_with_id(
        Uuid::new_v4(),
        log.clone(),
        &config,
        channel.clone(),
    );
    channel.register_listener(nexus.answer_handler());

    let mut agents = Vec::with_capacity(host_count);
    for _ in 0..host_count {
        let agent = Arc::new(SimFirewallAgent::new(log, HostUuid::new_v4()));
        channel.connect(agent.host_id(), agent.clone()).await;
        agents.push(agent);
    }

    ControlPlaneTestContext {
        nexus,
        channel,
        agents,
        account_id: AccountUuid::new_v4(),
        opctx: OpContext::for_tests(log.clone()),
        logctx,
    }
}

pub fn name(value: &str) -> Name {
    value.parse().unwrap()
}

pub async fn create_group(
    cptestctx: &ControlPlaneTestContext,
    group_name: &str,
) -> SecurityGroup {
    cptestctx
        .nexus
        .security_group_create(
            &cptestctx.opctx,
            cptestctx.account_id,
            SecurityGroupCreate {
                name: name(group_name),
                description: format!("{} servers", group_name),
            },
        )
        .await
        .unwrap()
}

pub fn tcp_ingress(port: i32, source: RuleSourceParams) -> SecurityGroupRuleCreate {
    SecurityGroupRuleCreate {
        direction: RuleDirection::Ingress,
        protocol: RuleProtocol::Tcp,
        start_port: Some(port),
        end_port: None,
        icmp_type: None,
        icmp_code: None,
        source,
    }
}

/// Allows tcp/`port` into `group` from members of `source`
pub async fn allow_tcp_from_group(
    cptestctx: &ControlPlaneTestContext,
    group: &SecurityGroup,
    port: i32,
    source: &SecurityGroup,
) -> SecurityGroupRule {
    cptestctx
        .nexus
        .security_group_rule_authorize(
            &cptestctx.opctx,
            group.id,
            tcp_ingress(
                port,
                RuleSourceParams::Group {
                    account: cptestctx.account_id,
                    name: source.name.clone(),
                },
            ),
        )
        .await
        .unwrap()
}

pub async fn create_instance(
    cptestctx: &ControlPlaneTestContext,
    instance_name: &str,
    ipv4: Ipv4Addr,
    groups: &[&str],
) -> Instance {
    let octets = ipv4.octets();
    cptestctx
        .nexus
        .instance_create(
            &cptestctx.opctx,
            cptestctx.account_id,
            InstanceCreate {
                name: name(instance_name),
                nic: NetworkInterface {
                    ipv4,
                    ipv6: None,
                    mac: [2, 8, 32, octets[1], octets[2], octets[3]].into(),
                    secondary_ips: vec![],
                },
                security_groups: groups.iter().map(|g| name(g)).collect(),
            },
        )
        .await
        .unwrap()
}

/// Creates an instance and starts it on host `host`
pub async fn start_instance(
    cptestctx: &ControlPlaneTestContext,
    instance_name: &str,
    ipv4: Ipv4Addr,
    groups: &[&str],
    host: usize,
) -> Instance {
    let instance =
        create_instance(cptestctx, instance_name, ipv4, groups).await;
    cptestctx
        .nexus
        .instance_start(&cptestctx.opctx, instance.id, cptestctx.host(host))
        .await
        .unwrap()
}

/// Waits until `agent` enforces a ruleset for the instance that satisfies
/// `cond`
pub async fn wait_for_applied<F>(
    agent: &SimFirewallAgent,
    instance_id: InstanceUuid,
    cond: F,
) -> AppliedRuleset
where
    F: Fn(&AppliedRuleset) -> bool,
{
    wait_for_condition(
        || {
            let applied = agent.applied(instance_id).filter(|a| cond(a));
            async move { applied.ok_or(CondCheckError::<()>::NotYet) }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap()
}

/// Returns the CIDRs the ruleset admits for ingress tcp/`port`
pub fn ingress_tcp_cidrs(applied: &AppliedRuleset, port: i32) -> Vec<String> {
    applied
        .ingress
        .iter()
        .find(|e| {
            e.protocol == RuleProtocol::Tcp && e.start == port && e.end == port
        })
        .map(|e| e.cidrs.iter().map(|c| c.to_string()).collect())
        .unwrap_or_default()
}
