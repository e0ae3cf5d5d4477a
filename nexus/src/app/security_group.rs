// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security groups and their rules

use crate::context::OpContext;
use crate::db::datastore::LockKey;
use crate::db::model::SecurityGroup;
use crate::db::model::SecurityGroupRule;
use chrono::Utc;
use secgroup_common::api::external::validate_cidr;
use secgroup_common::api::external::CreateResult;
use secgroup_common::api::external::DeleteResult;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::ListResultVec;
use secgroup_common::api::external::LookupResult;
use secgroup_common::api::external::RuleSource;
use secgroup_common::api::external::RuleSourceParams;
use secgroup_common::api::external::SecurityGroupCreate;
use secgroup_common::api::external::SecurityGroupRuleCreate;
use secgroup_common::typed_uuid::AccountUuid;
use secgroup_common::typed_uuid::SecurityGroupRuleUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use std::collections::BTreeSet;
use std::time::Duration;

impl super::Nexus {
    pub async fn security_group_create(
        &self,
        opctx: &OpContext,
        account_id: AccountUuid,
        params: SecurityGroupCreate,
    ) -> CreateResult<SecurityGroup> {
        // Make sure "default" is taken by the real default group.
        self.datastore.security_group_ensure_default(opctx, account_id).await?;
        let group = self
            .datastore
            .security_group_insert(
                opctx,
                SecurityGroup::new(account_id, params.name, params.description),
            )
            .await?;
        info!(opctx.log, "created security group";
            "security_group_id" => %group.id,
            "name" => %group.name);
        Ok(group)
    }

    pub async fn security_group_list(
        &self,
        opctx: &OpContext,
        account_id: AccountUuid,
    ) -> ListResultVec<SecurityGroup> {
        self.datastore.security_group_ensure_default(opctx, account_id).await?;
        self.datastore.security_group_list(opctx, account_id).await
    }

    pub async fn security_group_fetch(
        &self,
        opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> LookupResult<SecurityGroup> {
        self.datastore.security_group_fetch(opctx, group_id).await
    }

    /// Deletes a group that has no members and that no other group's rules
    /// refer to
    pub async fn security_group_delete(
        &self,
        opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> DeleteResult {
        let _guard = self
            .datastore
            .lock_rows(
                opctx,
                [LockKey::SecurityGroup(group_id)],
                self.row_lock_timeout,
            )
            .await?;
        self.datastore.security_group_delete(opctx, group_id).await?;
        info!(opctx.log, "deleted security group";
            "security_group_id" => %group_id);
        Ok(())
    }

    pub async fn security_group_rules_list(
        &self,
        opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> ListResultVec<SecurityGroupRule> {
        self.datastore.security_group_fetch(opctx, group_id).await?;
        self.datastore.security_group_rules_list(opctx, group_id).await
    }

    /// Adds a rule to a group and schedules pushes to the group's running
    /// members
    ///
    /// If the group already has an identical rule, that rule is returned and
    /// nothing is scheduled.
    pub async fn security_group_rule_authorize(
        &self,
        opctx: &OpContext,
        group_id: SecurityGroupUuid,
        params: SecurityGroupRuleCreate,
    ) -> CreateResult<SecurityGroupRule> {
        let (start, end) = params.normalized_ports()?;
        let source = match &params.source {
            RuleSourceParams::Cidr { cidr } => {
                RuleSource::Cidr(validate_cidr(*cidr)?)
            }
            RuleSourceParams::Group { account, name } => RuleSource::Group(
                self.datastore
                    .security_group_lookup_by_name(opctx, *account, name)
                    .await?
                    .id,
            ),
        };

        let mut locks = BTreeSet::from([LockKey::SecurityGroup(group_id)]);
        if let RuleSource::Group(source_id) = source {
            locks.insert(LockKey::SecurityGroup(source_id));
        }
        let (rule, created) = {
            let _guard = self
                .datastore
                .lock_rows(opctx, locks, self.row_lock_timeout)
                .await?;
            self.datastore
                .security_group_rule_insert(
                    opctx,
                    SecurityGroupRule {
                        id: SecurityGroupRuleUuid::new_v4(),
                        security_group_id: group_id,
                        direction: params.direction,
                        protocol: params.protocol,
                        start_port_or_icmp_type: start,
                        end_port_or_icmp_code: end,
                        source,
                        time_created: Utc::now(),
                    },
                )
                .await?
        };

        if !created {
            debug!(opctx.log, "rule already authorized";
                "security_group_rule_id" => %rule.id);
            return Ok(rule);
        }
        info!(opctx.log, "authorized security group rule";
            "security_group_id" => %group_id,
            "security_group_rule_id" => %rule.id,
            "direction" => %rule.direction,
            "protocol" => %rule.protocol);
        self.schedule_group_members(opctx, group_id).await?;
        Ok(rule)
    }

    /// Removes a rule and schedules pushes to its group's running members
    pub async fn security_group_rule_revoke(
        &self,
        opctx: &OpContext,
        rule_id: SecurityGroupRuleUuid,
    ) -> DeleteResult {
        let rule = self.datastore.security_group_rule_fetch(opctx, rule_id).await?;
        let group_id = rule.security_group_id;
        {
            let _guard = self
                .datastore
                .lock_rows(
                    opctx,
                    [LockKey::SecurityGroup(group_id)],
                    self.row_lock_timeout,
                )
                .await?;
            self.datastore.security_group_rule_delete(opctx, rule_id).await?;
        }
        info!(opctx.log, "revoked security group rule";
            "security_group_id" => %group_id,
            "security_group_rule_id" => %rule_id);
        self.schedule_group_members(opctx, group_id).await
    }

    async fn schedule_group_members(
        &self,
        opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> Result<(), Error> {
        let members: BTreeSet<_> = self
            .datastore
            .security_group_running_members(opctx, group_id)
            .await?
            .into_iter()
            .map(|instance| instance.id)
            .collect();
        if members.is_empty() {
            return Ok(());
        }
        self.scheduler
            .schedule_update(opctx, members, true, Duration::ZERO)
            .await?;
        Ok(())
    }
}
