// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records held by the [`DataStore`](super::DataStore)

use chrono::DateTime;
use chrono::Utc;
use macaddr::MacAddr6;
use secgroup_common::api::external::Name;
use secgroup_common::api::external::RuleDirection;
use secgroup_common::api::external::RuleProtocol;
use secgroup_common::api::external::RuleSource;
use secgroup_common::typed_uuid::AccountUuid;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_common::typed_uuid::SecurityGroupRuleUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use uuid::Uuid;

/// Name of the group every account gets implicitly
pub const DEFAULT_SECURITY_GROUP_NAME: &str = "default";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SecurityGroup {
    pub id: SecurityGroupUuid,
    pub account_id: AccountUuid,
    pub name: Name,
    pub description: String,
    pub time_created: DateTime<Utc>,
}

impl SecurityGroup {
    pub fn new(
        account_id: AccountUuid,
        name: Name,
        description: String,
    ) -> SecurityGroup {
        SecurityGroup {
            id: SecurityGroupUuid::new_v4(),
            account_id,
            name,
            description,
            time_created: Utc::now(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.name.as_str() == DEFAULT_SECURITY_GROUP_NAME
    }
}

/// One allow-entry attached to a security group
///
/// Rules are never modified in place.  For icmp, the port fields hold the ICMP
/// type and code; for "all" and numeric protocols both are 0.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SecurityGroupRule {
    pub id: SecurityGroupRuleUuid,
    pub security_group_id: SecurityGroupUuid,
    pub direction: RuleDirection,
    pub protocol: RuleProtocol,
    pub start_port_or_icmp_type: i32,
    pub end_port_or_icmp_code: i32,
    pub source: RuleSource,
    pub time_created: DateTime<Utc>,
}

impl SecurityGroupRule {
    /// Returns whether `other` allows exactly the same traffic for the same
    /// group (ignoring identity)
    pub fn same_rule(&self, other: &SecurityGroupRule) -> bool {
        self.security_group_id == other.security_group_id
            && self.direction == other.direction
            && self.protocol == other.protocol
            && self.start_port_or_icmp_type == other.start_port_or_icmp_type
            && self.end_port_or_icmp_code == other.end_port_or_icmp_code
            && self.source == other.source
    }

    /// Returns the id of the group this rule takes its source from, if any
    pub fn source_group(&self) -> Option<SecurityGroupUuid> {
        match self.source {
            RuleSource::Group(id) => Some(id),
            RuleSource::Cidr(_) => None,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Destroyed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Migrating => "migrating",
            InstanceState::Destroyed => "destroyed",
        })
    }
}

/// The instance's primary network interface
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NetworkInterface {
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub mac: MacAddr6,
    pub secondary_ips: Vec<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Instance {
    pub id: InstanceUuid,
    pub account_id: AccountUuid,
    pub name: Name,
    pub state: InstanceState,
    /// host the instance is placed on, if any
    pub host_id: Option<HostUuid>,
    pub nic: NetworkInterface,
    pub time_created: DateTime<Utc>,
    pub time_deleted: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running && self.time_deleted.is_none()
    }
}

/// Progress of a [`WorkItem`]
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkStep {
    /// waiting for a worker
    Scheduled,
    /// claimed by a worker; a ruleset may be in flight to the agent
    Processing,
    Done,
    Error,
}

impl WorkStep {
    pub fn is_finished(&self) -> bool {
        matches!(self, WorkStep::Done | WorkStep::Error)
    }
}

impl fmt::Display for WorkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkStep::Scheduled => "scheduled",
            WorkStep::Processing => "processing",
            WorkStep::Done => "done",
            WorkStep::Error => "error",
        })
    }
}

/// "This instance needs its ruleset pushed again"
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: u64,
    pub instance_id: InstanceUuid,
    pub step: WorkStep,
    pub log_sequence: u64,
    /// Nexus instance that claimed the item
    pub server_id: Option<Uuid>,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
    pub time_taken: Option<DateTime<Utc>>,
}

/// Per-instance logical clock ordering ruleset pushes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SequenceLog {
    pub instance_id: InstanceUuid,
    pub sequence: u64,
    pub time_updated: DateTime<Utc>,
}
