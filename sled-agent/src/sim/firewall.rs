// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated enforcement of security group rulesets

use async_trait::async_trait;
use secgroup_common::api::internal::agent::AgentFailureReason;
use secgroup_common::api::internal::agent::FirewallAgent;
use secgroup_common::api::internal::agent::RulesetAnswer;
use secgroup_common::api::internal::agent::RulesetEntry;
use secgroup_common::api::internal::agent::RulesetOutcome;
use secgroup_common::api::internal::agent::SecurityGroupRulesCmd;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use serde::Serialize;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// The ruleset an instance is currently enforcing
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AppliedRuleset {
    pub sequence: u64,
    pub signature: String,
    pub ingress: Vec<RulesetEntry>,
    pub egress: Vec<RulesetEntry>,
}

/// Failure to simulate when asked to program an instance's rules
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureMode {
    /// the host can never enforce rules for this instance
    CannotBridgeFirewall,
    /// the next `times` attempts fail
    ProgrammingFailed { times: u32 },
}

#[derive(Default)]
struct Inner {
    applied: BTreeMap<InstanceUuid, AppliedRuleset>,
    failures: BTreeMap<InstanceUuid, FailureMode>,
    /// commands received per instance, including ignored ones
    received: BTreeMap<InstanceUuid, usize>,
}

/// Simulates the firewall side of a sled agent
///
/// Commands are never applied out of order: a command carrying a lower
/// sequence than the one already applied for the instance is ignored and
/// answered as stale.
pub struct SimFirewallAgent {
    host_id: HostUuid,
    log: Logger,
    inner: Mutex<Inner>,
}

impl SimFirewallAgent {
    pub fn new(log: &Logger, host_id: HostUuid) -> SimFirewallAgent {
        SimFirewallAgent {
            host_id,
            log: log.new(o!(
                "component" => "SimFirewallAgent",
                "host_id" => host_id.to_string()
            )),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn host_id(&self) -> HostUuid {
        self.host_id
    }

    /// Makes programming rules for `instance_id` fail as described
    pub fn set_failure(&self, instance_id: InstanceUuid, mode: FailureMode) {
        self.inner.lock().unwrap().failures.insert(instance_id, mode);
    }

    pub fn clear_failure(&self, instance_id: InstanceUuid) {
        self.inner.lock().unwrap().failures.remove(&instance_id);
    }

    /// Returns what the instance is enforcing, if anything
    pub fn applied(&self, instance_id: InstanceUuid) -> Option<AppliedRuleset> {
        self.inner.lock().unwrap().applied.get(&instance_id).cloned()
    }

    /// Number of commands received for the instance
    pub fn received(&self, instance_id: InstanceUuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .received
            .get(&instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Forgets every applied ruleset, as after an agent restart
    pub fn forget_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        info!(self.log, "forgetting applied rulesets";
            "count" => inner.applied.len());
        inner.applied.clear();
    }

    fn apply(&self, cmd: SecurityGroupRulesCmd) -> RulesetOutcome {
        let mut inner = self.inner.lock().unwrap();
        *inner.received.entry(cmd.instance_id).or_default() += 1;

        if let Some(FailureMode::CannotBridgeFirewall) =
            inner.failures.get(&cmd.instance_id)
        {
            return RulesetOutcome::Failed {
                reason: AgentFailureReason::CannotBridgeFirewall,
                message: String::from("host has no bridge firewall support"),
            };
        }

        if let Some(applied) = inner.applied.get(&cmd.instance_id) {
            if cmd.sequence < applied.sequence {
                return RulesetOutcome::Stale {
                    applied_sequence: applied.sequence,
                };
            }
            if cmd.sequence == applied.sequence
                && cmd.signature == applied.signature
            {
                return RulesetOutcome::Unchanged;
            }
        }

        if let Some(FailureMode::ProgrammingFailed { times }) =
            inner.failures.get_mut(&cmd.instance_id)
        {
            if *times > 0 {
                *times -= 1;
                return RulesetOutcome::Failed {
                    reason: AgentFailureReason::ProgrammingFailed,
                    message: String::from("simulated rule programming failure"),
                };
            }
        }

        inner.applied.insert(
            cmd.instance_id,
            AppliedRuleset {
                sequence: cmd.sequence,
                signature: cmd.signature,
                ingress: cmd.ingress,
                egress: cmd.egress,
            },
        );
        RulesetOutcome::Applied
    }
}

#[async_trait]
impl FirewallAgent for SimFirewallAgent {
    async fn ensure_rules(&self, cmd: SecurityGroupRulesCmd) -> RulesetAnswer {
        let instance_id = cmd.instance_id;
        let sequence = cmd.sequence;
        let outcome = self.apply(cmd);
        debug!(self.log, "ensure rules";
            "instance_id" => %instance_id,
            "sequence" => sequence,
            "outcome" => ?outcome);
        RulesetAnswer { instance_id, sequence, outcome }
    }

    async fn report_sequences(&self) -> BTreeMap<InstanceUuid, u64> {
        self.inner
            .lock()
            .unwrap()
            .applied
            .iter()
            .map(|(id, applied)| (*id, applied.sequence))
            .collect()
    }
}
