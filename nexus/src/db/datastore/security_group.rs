// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on security groups, rules, and memberships

use super::DataStore;
use super::Tables;
use crate::context::OpContext;
use crate::db::model::Instance;
use crate::db::model::SecurityGroup;
use crate::db::model::SecurityGroupRule;
use crate::db::model::DEFAULT_SECURITY_GROUP_NAME;
use secgroup_common::api::external::CreateResult;
use secgroup_common::api::external::DeleteResult;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::ListResultVec;
use secgroup_common::api::external::LookupResult;
use secgroup_common::api::external::Name;
use secgroup_common::api::external::ResourceType;
use secgroup_common::api::external::RuleDirection;
use secgroup_common::api::external::RuleSource;
use secgroup_common::typed_uuid::AccountUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_common::typed_uuid::SecurityGroupRuleUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use std::collections::BTreeSet;

impl Tables {
    fn group_by_name(
        &self,
        account_id: AccountUuid,
        name: &Name,
    ) -> Option<&SecurityGroup> {
        self.security_groups
            .values()
            .find(|g| g.account_id == account_id && g.name == *name)
    }

    pub(super) fn group_members(
        &self,
        group_id: SecurityGroupUuid,
    ) -> impl Iterator<Item = &Instance> + '_ {
        self.memberships
            .iter()
            .filter(move |(_, g)| *g == group_id)
            .filter_map(|(i, _)| self.instances.get(i))
            .filter(|i| i.time_deleted.is_none())
    }

    pub(super) fn instance_groups(
        &self,
        instance_id: InstanceUuid,
    ) -> BTreeSet<SecurityGroupUuid> {
        self.memberships
            .iter()
            .filter(|(i, _)| *i == instance_id)
            .map(|(_, g)| *g)
            .collect()
    }
}

impl DataStore {
    pub async fn security_group_insert(
        &self,
        _opctx: &OpContext,
        group: SecurityGroup,
    ) -> CreateResult<SecurityGroup> {
        let mut tables = self.tables.lock().unwrap();
        if tables.group_by_name(group.account_id, &group.name).is_some() {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::SecurityGroup,
                object_name: group.name.to_string(),
            });
        }
        tables.security_groups.insert(group.id, group.clone());
        Ok(group)
    }

    /// Returns the account's `default` group, creating it if needed
    pub async fn security_group_ensure_default(
        &self,
        opctx: &OpContext,
        account_id: AccountUuid,
    ) -> Result<SecurityGroup, Error> {
        let name: Name = DEFAULT_SECURITY_GROUP_NAME
            .parse()
            .map_err(|e: String| Error::internal_error(&e))?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(group) = tables.group_by_name(account_id, &name) {
            return Ok(group.clone());
        }

        let group = SecurityGroup::new(
            account_id,
            name,
            String::from("Default security group"),
        );
        info!(opctx.log, "created default security group";
            "account_id" => %account_id,
            "security_group_id" => %group.id);
        tables.security_groups.insert(group.id, group.clone());
        Ok(group)
    }

    pub async fn security_group_fetch(
        &self,
        _opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> LookupResult<SecurityGroup> {
        let tables = self.tables.lock().unwrap();
        tables.security_groups.get(&group_id).cloned().ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::SecurityGroup,
                group_id.as_untyped_uuid(),
            )
        })
    }

    pub async fn security_group_lookup_by_name(
        &self,
        _opctx: &OpContext,
        account_id: AccountUuid,
        name: &Name,
    ) -> LookupResult<SecurityGroup> {
        let tables = self.tables.lock().unwrap();
        tables
            .group_by_name(account_id, name)
            .cloned()
            .ok_or_else(|| {
                Error::not_found_by_name(ResourceType::SecurityGroup, name)
            })
    }

    pub async fn security_group_list(
        &self,
        _opctx: &OpContext,
        account_id: AccountUuid,
    ) -> ListResultVec<SecurityGroup> {
        let tables = self.tables.lock().unwrap();
        let mut groups: Vec<_> = tables
            .security_groups
            .values()
            .filter(|g| g.account_id == account_id)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    /// Deletes a group and the rules it owns
    ///
    /// Fails without deleting anything if the group is the account's default
    /// group, still has members, or is the source of another group's rule.
    pub async fn security_group_delete(
        &self,
        _opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> DeleteResult {
        let mut tables = self.tables.lock().unwrap();
        let group = tables.security_groups.get(&group_id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::SecurityGroup,
                group_id.as_untyped_uuid(),
            )
        })?;

        if group.is_default() {
            return Err(Error::invalid_request(
                "the default security group cannot be deleted",
            ));
        }

        let nmembers = tables.group_members(group_id).count();
        if nmembers > 0 {
            return Err(Error::in_use(
                ResourceType::SecurityGroup,
                &format!("security group has {} member instance(s)", nmembers),
            ));
        }

        let referencing: BTreeSet<_> = tables
            .security_group_rules
            .values()
            .filter(|r| {
                r.security_group_id != group_id
                    && r.source_group() == Some(group_id)
            })
            .map(|r| r.security_group_id)
            .collect();
        if !referencing.is_empty() {
            return Err(Error::in_use(
                ResourceType::SecurityGroup,
                &format!(
                    "security group is referenced by rules of {} other \
                     group(s)",
                    referencing.len()
                ),
            ));
        }

        tables.security_group_rules.retain(|_, r| r.security_group_id != group_id);
        tables.security_groups.remove(&group_id);
        Ok(())
    }

    /// Records a rule, returning an existing identical rule instead of
    /// creating a duplicate
    ///
    /// The second item of the returned pair is whether a new rule was
    /// created.
    pub async fn security_group_rule_insert(
        &self,
        _opctx: &OpContext,
        rule: SecurityGroupRule,
    ) -> CreateResult<(SecurityGroupRule, bool)> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.security_groups.contains_key(&rule.security_group_id) {
            return Err(Error::not_found_by_id(
                ResourceType::SecurityGroup,
                rule.security_group_id.as_untyped_uuid(),
            ));
        }
        if let Some(group_id) = rule.source_group() {
            if !tables.security_groups.contains_key(&group_id) {
                return Err(Error::not_found_by_id(
                    ResourceType::SecurityGroup,
                    group_id.as_untyped_uuid(),
                ));
            }
        }

        if let Some(existing) =
            tables.security_group_rules.values().find(|r| r.same_rule(&rule))
        {
            return Ok((existing.clone(), false));
        }
        tables.security_group_rules.insert(rule.id, rule.clone());
        Ok((rule, true))
    }

    pub async fn security_group_rule_fetch(
        &self,
        _opctx: &OpContext,
        rule_id: SecurityGroupRuleUuid,
    ) -> LookupResult<SecurityGroupRule> {
        let tables = self.tables.lock().unwrap();
        tables.security_group_rules.get(&rule_id).cloned().ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::SecurityGroupRule,
                rule_id.as_untyped_uuid(),
            )
        })
    }

    pub async fn security_group_rule_delete(
        &self,
        _opctx: &OpContext,
        rule_id: SecurityGroupRuleUuid,
    ) -> DeleteResult {
        let mut tables = self.tables.lock().unwrap();
        tables.security_group_rules.remove(&rule_id).map(|_| ()).ok_or_else(
            || {
                Error::not_found_by_id(
                    ResourceType::SecurityGroupRule,
                    rule_id.as_untyped_uuid(),
                )
            },
        )
    }

    pub async fn security_group_rules_list(
        &self,
        _opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> ListResultVec<SecurityGroupRule> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .security_group_rules
            .values()
            .filter(|r| r.security_group_id == group_id)
            .cloned()
            .collect())
    }

    /// Lists the rules in `direction` of every group the instance belongs to
    pub async fn security_group_rules_for_instance(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
        direction: RuleDirection,
    ) -> ListResultVec<SecurityGroupRule> {
        let tables = self.tables.lock().unwrap();
        let groups = tables.instance_groups(instance_id);
        Ok(tables
            .security_group_rules
            .values()
            .filter(|r| {
                r.direction == direction
                    && groups.contains(&r.security_group_id)
            })
            .cloned()
            .collect())
    }

    /// Returns the groups owning a rule whose source is any of `group_ids`
    pub async fn security_groups_referencing(
        &self,
        _opctx: &OpContext,
        group_ids: &BTreeSet<SecurityGroupUuid>,
    ) -> Result<BTreeSet<SecurityGroupUuid>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .security_group_rules
            .values()
            .filter(|r| {
                matches!(r.source, RuleSource::Group(g) if group_ids.contains(&g))
            })
            .map(|r| r.security_group_id)
            .collect())
    }

    /// Lists the running members of a group
    pub async fn security_group_running_members(
        &self,
        _opctx: &OpContext,
        group_id: SecurityGroupUuid,
    ) -> ListResultVec<Instance> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .group_members(group_id)
            .filter(|i| i.is_running())
            .cloned()
            .collect())
    }

    /// Returns the running members of every group that has a rule whose
    /// source is one of `group_ids`
    ///
    /// These are the instances whose rulesets change when membership of
    /// `group_ids` changes.
    pub async fn instances_affected_by_groups(
        &self,
        _opctx: &OpContext,
        group_ids: &BTreeSet<SecurityGroupUuid>,
    ) -> Result<BTreeSet<InstanceUuid>, Error> {
        let tables = self.tables.lock().unwrap();
        let referencing: BTreeSet<_> = tables
            .security_group_rules
            .values()
            .filter(|r| {
                matches!(r.source, RuleSource::Group(g) if group_ids.contains(&g))
            })
            .map(|r| r.security_group_id)
            .collect();
        Ok(referencing
            .into_iter()
            .flat_map(|g| {
                tables
                    .group_members(g)
                    .filter(|i| i.is_running())
                    .map(|i| i.id)
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    pub async fn instance_security_groups(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<BTreeSet<SecurityGroupUuid>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.instance_groups(instance_id))
    }

    /// Adds the instance to a group.  Returns whether it was newly added.
    pub async fn security_group_membership_add(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
        group_id: SecurityGroupUuid,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.lock().unwrap();
        let instance = tables.instances.get(&instance_id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Instance,
                instance_id.as_untyped_uuid(),
            )
        })?;
        let group = tables.security_groups.get(&group_id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::SecurityGroup,
                group_id.as_untyped_uuid(),
            )
        })?;
        if instance.time_deleted.is_some() {
            return Err(Error::invalid_request(
                "cannot change security groups of a destroyed instance",
            ));
        }
        if instance.account_id != group.account_id {
            return Err(Error::invalid_request(
                "instance and security group belong to different accounts",
            ));
        }
        Ok(tables.memberships.insert((instance_id, group_id)))
    }

    /// Removes the instance from a group.  Returns whether it was a member.
    pub async fn security_group_membership_remove(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
        group_id: SecurityGroupUuid,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.lock().unwrap();
        Ok(tables.memberships.remove(&(instance_id, group_id)))
    }
}
