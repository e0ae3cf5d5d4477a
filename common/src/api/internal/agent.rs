// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types exchanged between the control plane and host agents when pushing
//! an instance's security group ruleset

use crate::api::external::RuleProtocol;
use crate::typed_uuid::InstanceUuid;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// One resolved (protocol, port range) bucket and the networks it admits
///
/// For icmp, `start` and `end` carry the ICMP type and code.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RulesetEntry {
    pub protocol: RuleProtocol,
    pub start: i32,
    pub end: i32,
    pub cidrs: Vec<IpNetwork>,
}

/// Command pushing the complete ruleset for one instance to its host agent
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SecurityGroupRulesCmd {
    pub instance_id: InstanceUuid,
    pub instance_name: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub mac: MacAddr6,
    /// Content hash of the ingress and egress rulesets
    pub signature: String,
    /// Per-instance ordering token; agents ignore anything lower than what
    /// they have already applied
    pub sequence: u64,
    pub ingress: Vec<RulesetEntry>,
    pub egress: Vec<RulesetEntry>,
    pub secondary_ips: Vec<IpAddr>,
}

/// Why an agent could not apply a ruleset
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentFailureReason {
    /// The host cannot enforce security groups at all.  Retrying will not
    /// help.
    CannotBridgeFirewall,
    /// Applying the rules failed this time.
    ProgrammingFailed,
}

impl fmt::Display for AgentFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentFailureReason::CannotBridgeFirewall => {
                "cannot bridge firewall"
            }
            AgentFailureReason::ProgrammingFailed => "programming failed",
        })
    }
}

/// What an agent did with a [`SecurityGroupRulesCmd`]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RulesetOutcome {
    /// The ruleset was programmed.
    Applied,
    /// The agent already had this sequence with the same signature.
    Unchanged,
    /// The agent had already applied a newer sequence and ignored this one.
    Stale { applied_sequence: u64 },
    Failed { reason: AgentFailureReason, message: String },
}

/// An agent's reply to a [`SecurityGroupRulesCmd`]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RulesetAnswer {
    pub instance_id: InstanceUuid,
    pub sequence: u64,
    pub outcome: RulesetOutcome,
}

impl RulesetAnswer {
    /// Returns whether the agent is known to be enforcing this sequence (or
    /// something newer).
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RulesetOutcome::Failed { .. })
    }
}

/// Interface implemented by host agents that enforce rulesets
#[async_trait]
pub trait FirewallAgent: Send + Sync {
    /// Apply the ruleset carried by `cmd`.
    async fn ensure_rules(&self, cmd: SecurityGroupRulesCmd) -> RulesetAnswer;

    /// Report the sequence currently applied for each instance this agent
    /// knows about.
    async fn report_sequences(&self) -> BTreeMap<InstanceUuid, u64>;
}
