// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of an instance's security group rules into the ruleset pushed
//! to its host agent

use crate::context::OpContext;
use crate::db::model::Instance;
use crate::db::model::SecurityGroupRule;
use crate::db::DataStore;
use ipnetwork::IpNetwork;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::RuleDirection;
use secgroup_common::api::external::RuleProtocol;
use secgroup_common::api::external::RuleSource;
use secgroup_common::api::internal::agent::RulesetEntry;
use secgroup_common::api::internal::agent::SecurityGroupRulesCmd;
use secgroup_common::typed_uuid::InstanceUuid;
use sha2::Digest;
use sha2::Sha256;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::net::IpAddr;

/// Bucket key of a resolved ruleset
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortAndProto {
    pub protocol: RuleProtocol,
    pub start: i32,
    pub end: i32,
}

impl From<&SecurityGroupRule> for PortAndProto {
    fn from(rule: &SecurityGroupRule) -> Self {
        PortAndProto {
            protocol: rule.protocol,
            start: rule.start_port_or_icmp_type,
            end: rule.end_port_or_icmp_code,
        }
    }
}

/// A network ordered by prefix length (less specific first), then by its
/// textual form
///
/// Commands and signatures are built by iterating this order, so it must be
/// deterministic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OrderedCidr(pub IpNetwork);

impl Ord for OrderedCidr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .prefix()
            .cmp(&other.0.prefix())
            .then_with(|| self.0.to_string().cmp(&other.0.to_string()))
    }
}

impl PartialOrd for OrderedCidr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Resolved rules for one direction: (protocol, port range) -> networks
///
/// Buckets are never empty.
pub type Ruleset = BTreeMap<PortAndProto, BTreeSet<OrderedCidr>>;

/// Computes the ruleset in effect for an instance in one direction
///
/// This is the union over all of the instance's groups of the rules in
/// `direction`.  A rule whose source is a CIDR contributes that network.  A
/// rule whose source is a group contributes a /32 for the primary IPv4
/// address of each running member of that group, and nothing at all if the
/// group has no running members.
pub async fn generate_rules(
    datastore: &DataStore,
    opctx: &OpContext,
    instance_id: InstanceUuid,
    direction: RuleDirection,
) -> Result<Ruleset, Error> {
    let rules = datastore
        .security_group_rules_for_instance(opctx, instance_id, direction)
        .await?;

    let mut ruleset = Ruleset::new();
    for rule in &rules {
        let cidrs: Vec<IpNetwork> = match rule.source {
            RuleSource::Cidr(cidr) => vec![cidr],
            RuleSource::Group(group_id) => datastore
                .security_group_running_members(opctx, group_id)
                .await?
                .iter()
                .map(|member| IpNetwork::from(IpAddr::V4(member.nic.ipv4)))
                .collect(),
        };
        if cidrs.is_empty() {
            continue;
        }
        ruleset
            .entry(PortAndProto::from(rule))
            .or_default()
            .extend(cidrs.into_iter().map(OrderedCidr));
    }

    debug!(
        opctx.log,
        "resolved security group rules";
        "instance_id" => %instance_id,
        "direction" => %direction,
        "rules" => rules.len(),
        "buckets" => ruleset.len(),
    );
    Ok(ruleset)
}

fn stringify_ruleset(out: &mut String, ruleset: &Ruleset) {
    for (key, cidrs) in ruleset {
        // Writing to a String cannot fail.
        let _ = write!(out, "{}:{}:{}:", key.protocol, key.start, key.end);
        for cidr in cidrs {
            let _ = write!(out, "{},", cidr.0);
        }
        out.push(';');
    }
}

/// Content hash of a pair of rulesets
///
/// Agents compare this against what they last applied to skip no-op pushes.
pub fn ruleset_signature(ingress: &Ruleset, egress: &Ruleset) -> String {
    let mut text = String::from("ingress:");
    stringify_ruleset(&mut text, ingress);
    text.push_str("egress:");
    stringify_ruleset(&mut text, egress);
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn ruleset_entries(ruleset: &Ruleset) -> Vec<RulesetEntry> {
    ruleset
        .iter()
        .map(|(key, cidrs)| RulesetEntry {
            protocol: key.protocol,
            start: key.start,
            end: key.end,
            cidrs: cidrs.iter().map(|c| c.0).collect(),
        })
        .collect()
}

/// Builds the command pushing `ingress` and `egress` to the instance's agent
pub fn build_rules_cmd(
    instance: &Instance,
    sequence: u64,
    ingress: &Ruleset,
    egress: &Ruleset,
) -> SecurityGroupRulesCmd {
    SecurityGroupRulesCmd {
        instance_id: instance.id,
        instance_name: instance.name.to_string(),
        ipv4: instance.nic.ipv4,
        ipv6: instance.nic.ipv6,
        mac: instance.nic.mac,
        signature: ruleset_signature(ingress, egress),
        sequence,
        ingress: ruleset_entries(ingress),
        egress: ruleset_entries(egress),
        secondary_ips: instance.nic.secondary_ips.clone(),
    }
}

/// Resolves both directions for `instance` and builds the command to push
pub async fn instance_rules_cmd(
    datastore: &DataStore,
    opctx: &OpContext,
    instance: &Instance,
    sequence: u64,
) -> Result<SecurityGroupRulesCmd, Error> {
    let ingress =
        generate_rules(datastore, opctx, instance.id, RuleDirection::Ingress)
            .await?;
    let egress =
        generate_rules(datastore, opctx, instance.id, RuleDirection::Egress)
            .await?;
    Ok(build_rules_cmd(instance, sequence, &ingress, &egress))
}
