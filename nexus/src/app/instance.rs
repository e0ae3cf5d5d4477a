// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instances, their security group memberships, and the hook that schedules
//! ruleset pushes when they change state

use super::work_queue::WorkScheduler;
use crate::context::OpContext;
use crate::db::datastore::LockKey;
use crate::db::model::Instance;
use crate::db::model::InstanceState;
use crate::db::model::NetworkInterface;
use crate::db::DataStore;
use async_trait::async_trait;
use chrono::Utc;
use secgroup_common::api::external::CreateResult;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::LookupResult;
use secgroup_common::api::external::Name;
use secgroup_common::api::external::UpdateResult;
use secgroup_common::typed_uuid::AccountUuid;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Create-time parameters for an instance
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstanceCreate {
    pub name: Name,
    pub nic: NetworkInterface,
    /// groups to place the instance in; the account's default group if empty
    #[serde(default)]
    pub security_groups: Vec<Name>,
}

/// A change of an instance's state (or host) as seen by observers
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceTransition {
    pub instance_id: InstanceUuid,
    pub previous: InstanceState,
    pub current: InstanceState,
    pub previous_host: Option<HostUuid>,
    pub current_host: Option<HostUuid>,
    /// the instance's groups at the time of the transition
    ///
    /// For a destroyed instance these are the groups it belonged to.
    pub groups: BTreeSet<SecurityGroupUuid>,
}

/// Kinds of transitions that matter to ruleset propagation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleEvent {
    Started,
    Stopped,
    Migrated,
}

impl InstanceTransition {
    pub fn lifecycle_event(&self) -> Option<LifecycleEvent> {
        let was_running = self.previous == InstanceState::Running;
        let is_running = self.current == InstanceState::Running;
        match (was_running, is_running) {
            (false, true) => Some(LifecycleEvent::Started),
            (true, false) => Some(LifecycleEvent::Stopped),
            (true, true) if self.previous_host != self.current_host => {
                Some(LifecycleEvent::Migrated)
            }
            _ => None,
        }
    }
}

/// Something interested in instance state transitions
///
/// Observers are called after the transition has been recorded.  They
/// cannot fail the transition.
#[async_trait]
pub trait InstanceObserver: Send + Sync {
    async fn instance_transitioned(
        &self,
        opctx: &OpContext,
        transition: &InstanceTransition,
    );
}

/// Schedules ruleset pushes for the instances affected by a transition
pub struct RulesetLifecycleHook {
    datastore: Arc<DataStore>,
    scheduler: Arc<WorkScheduler>,
}

impl RulesetLifecycleHook {
    pub fn new(
        datastore: Arc<DataStore>,
        scheduler: Arc<WorkScheduler>,
    ) -> RulesetLifecycleHook {
        RulesetLifecycleHook { datastore, scheduler }
    }

    /// Returns the instances whose rulesets need pushing after `transition`
    pub async fn affected_instances(
        &self,
        opctx: &OpContext,
        transition: &InstanceTransition,
    ) -> Result<BTreeSet<InstanceUuid>, Error> {
        let Some(event) = transition.lifecycle_event() else {
            return Ok(BTreeSet::new());
        };
        let mut affected = BTreeSet::new();
        match event {
            LifecycleEvent::Started => {
                affected.insert(transition.instance_id);
                affected.extend(
                    self.datastore
                        .instances_affected_by_groups(opctx, &transition.groups)
                        .await?,
                );
            }
            LifecycleEvent::Stopped => {
                affected.extend(
                    self.datastore
                        .instances_affected_by_groups(opctx, &transition.groups)
                        .await?,
                );
                // It has nothing to enforce any more.
                affected.remove(&transition.instance_id);
            }
            LifecycleEvent::Migrated => {
                affected.insert(transition.instance_id);
            }
        }
        Ok(affected)
    }
}

#[async_trait]
impl InstanceObserver for RulesetLifecycleHook {
    async fn instance_transitioned(
        &self,
        opctx: &OpContext,
        transition: &InstanceTransition,
    ) {
        let affected = match self.affected_instances(opctx, transition).await {
            Ok(affected) => affected,
            Err(error) => {
                error!(opctx.log, "failed to find instances affected by \
                    transition";
                    "instance_id" => %transition.instance_id,
                    "error" => %error);
                return;
            }
        };
        if affected.is_empty() {
            return;
        }
        debug!(opctx.log, "scheduling rulesets after instance transition";
            "instance_id" => %transition.instance_id,
            "event" => ?transition.lifecycle_event(),
            "count" => affected.len());
        if let Err(error) = self
            .scheduler
            .schedule_update(opctx, affected, true, Duration::ZERO)
            .await
        {
            error!(opctx.log, "failed to schedule rulesets";
                "instance_id" => %transition.instance_id,
                "error" => %error);
        }
    }
}

impl super::Nexus {
    /// Registers an additional observer of instance transitions
    pub fn instance_observer_register(
        &self,
        observer: Arc<dyn InstanceObserver>,
    ) {
        self.instance_observers.write().unwrap().push(observer);
    }

    async fn instance_notify(
        &self,
        opctx: &OpContext,
        transition: InstanceTransition,
    ) {
        info!(opctx.log, "instance transitioned";
            "instance_id" => %transition.instance_id,
            "from" => %transition.previous,
            "to" => %transition.current);
        let observers = self.instance_observers.read().unwrap().clone();
        for observer in observers {
            observer.instance_transitioned(opctx, &transition).await;
        }
    }

    /// Records a new, stopped instance and places it in its groups
    pub async fn instance_create(
        &self,
        opctx: &OpContext,
        account_id: AccountUuid,
        params: InstanceCreate,
    ) -> CreateResult<Instance> {
        let mut groups = Vec::with_capacity(params.security_groups.len());
        if params.security_groups.is_empty() {
            groups.push(
                self.datastore
                    .security_group_ensure_default(opctx, account_id)
                    .await?,
            );
        }
        for name in &params.security_groups {
            groups.push(
                self.datastore
                    .security_group_lookup_by_name(opctx, account_id, name)
                    .await?,
            );
        }

        let instance = self
            .datastore
            .instance_insert(
                opctx,
                Instance {
                    id: InstanceUuid::new_v4(),
                    account_id,
                    name: params.name,
                    state: InstanceState::Stopped,
                    host_id: None,
                    nic: params.nic,
                    time_created: Utc::now(),
                    time_deleted: None,
                },
            )
            .await?;
        for group in &groups {
            self.datastore
                .security_group_membership_add(opctx, instance.id, group.id)
                .await?;
        }
        info!(opctx.log, "created instance";
            "instance_id" => %instance.id,
            "name" => %instance.name,
            "groups" => groups.len());
        Ok(instance)
    }

    pub async fn instance_fetch(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> LookupResult<Instance> {
        self.datastore.instance_fetch(opctx, instance_id).await
    }

    /// Starts a stopped instance on `host_id`
    pub async fn instance_start(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        host_id: HostUuid,
    ) -> UpdateResult<Instance> {
        self.instance_set_runtime(opctx, instance_id, |instance| {
            match instance.state {
                InstanceState::Stopped | InstanceState::Starting => {
                    Ok((InstanceState::Running, Some(host_id)))
                }
                state => Err(Error::invalid_request(&format!(
                    "cannot start instance in state \"{}\"",
                    state
                ))),
            }
        })
        .await
    }

    pub async fn instance_stop(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> UpdateResult<Instance> {
        self.instance_set_runtime(opctx, instance_id, |instance| {
            match instance.state {
                InstanceState::Stopped
                | InstanceState::Running
                | InstanceState::Starting
                | InstanceState::Stopping => {
                    Ok((InstanceState::Stopped, None))
                }
                state => Err(Error::invalid_request(&format!(
                    "cannot stop instance in state \"{}\"",
                    state
                ))),
            }
        })
        .await
    }

    /// Moves a running instance to another host
    pub async fn instance_migrate(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        dst_host_id: HostUuid,
    ) -> UpdateResult<Instance> {
        self.instance_set_runtime(opctx, instance_id, |instance| {
            if !instance.is_running() {
                return Err(Error::invalid_request(
                    "only a running instance can be migrated",
                ));
            }
            if instance.host_id == Some(dst_host_id) {
                return Err(Error::invalid_request(
                    "instance is already on the destination host",
                ));
            }
            Ok((InstanceState::Running, Some(dst_host_id)))
        })
        .await
    }

    /// Applies a state change computed by `next` under the instance's row
    /// lock, then tells observers about it
    async fn instance_set_runtime<F>(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        next: F,
    ) -> UpdateResult<Instance>
    where
        F: FnOnce(&Instance) -> Result<(InstanceState, Option<HostUuid>), Error>,
    {
        let (previous, current, groups) = {
            let _guard = self
                .datastore
                .lock_rows(
                    opctx,
                    [LockKey::Instance(instance_id)],
                    self.row_lock_timeout,
                )
                .await?;
            let instance =
                self.datastore.instance_fetch(opctx, instance_id).await?;
            let (state, host_id) = next(&instance)?;
            let (previous, current) = self
                .datastore
                .instance_update_runtime(opctx, instance_id, state, host_id)
                .await?;
            let groups = self
                .datastore
                .instance_security_groups(opctx, instance_id)
                .await?;
            (previous, current, groups)
        };

        self.instance_notify(
            opctx,
            InstanceTransition {
                instance_id,
                previous: previous.state,
                current: current.state,
                previous_host: previous.host_id,
                current_host: current.host_id,
                groups,
            },
        )
        .await;
        Ok(current)
    }

    /// Destroys the instance, removing it from all of its groups
    pub async fn instance_destroy(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> UpdateResult<Instance> {
        let (previous, groups) = {
            let _guard = self
                .datastore
                .lock_rows(
                    opctx,
                    [LockKey::Instance(instance_id)],
                    self.row_lock_timeout,
                )
                .await?;
            self.datastore.instance_soft_delete(opctx, instance_id).await?
        };
        self.instance_notify(
            opctx,
            InstanceTransition {
                instance_id,
                previous: previous.state,
                current: InstanceState::Destroyed,
                previous_host: previous.host_id,
                current_host: None,
                groups,
            },
        )
        .await;
        self.stats.forget(instance_id);
        self.listener.forget(instance_id);
        self.datastore.instance_fetch_including_deleted(opctx, instance_id).await
    }

    /// Adds the instance to a group
    pub async fn instance_group_add(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        group_id: SecurityGroupUuid,
    ) -> UpdateResult<bool> {
        let added = {
            let _guard = self
                .datastore
                .lock_rows(
                    opctx,
                    [
                        LockKey::SecurityGroup(group_id),
                        LockKey::Instance(instance_id),
                    ],
                    self.row_lock_timeout,
                )
                .await?;
            self.datastore
                .security_group_membership_add(opctx, instance_id, group_id)
                .await?
        };
        if added {
            self.membership_changed(opctx, instance_id, group_id).await?;
        }
        Ok(added)
    }

    /// Removes the instance from a group
    ///
    /// An instance must remain in at least one group.
    pub async fn instance_group_remove(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        group_id: SecurityGroupUuid,
    ) -> UpdateResult<bool> {
        let removed = {
            let _guard = self
                .datastore
                .lock_rows(
                    opctx,
                    [
                        LockKey::SecurityGroup(group_id),
                        LockKey::Instance(instance_id),
                    ],
                    self.row_lock_timeout,
                )
                .await?;
            let groups = self
                .datastore
                .instance_security_groups(opctx, instance_id)
                .await?;
            if groups.len() == 1 && groups.contains(&group_id) {
                return Err(Error::invalid_request(
                    "cannot remove an instance from its only security group",
                ));
            }
            self.datastore
                .security_group_membership_remove(opctx, instance_id, group_id)
                .await?
        };
        if removed {
            self.membership_changed(opctx, instance_id, group_id).await?;
        }
        Ok(removed)
    }

    /// Schedules pushes after a running instance joined or left a group:
    /// its own ruleset and those of every instance whose rules refer to the
    /// group
    async fn membership_changed(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
        group_id: SecurityGroupUuid,
    ) -> Result<(), Error> {
        let instance = self.datastore.instance_fetch(opctx, instance_id).await?;
        if !instance.is_running() {
            return Ok(());
        }
        let mut affected = self
            .datastore
            .instances_affected_by_groups(opctx, &BTreeSet::from([group_id]))
            .await?;
        affected.insert(instance_id);
        self.scheduler
            .schedule_update(opctx, affected, true, Duration::ZERO)
            .await?;
        Ok(())
    }
}
