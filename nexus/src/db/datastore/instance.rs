// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on instances

use super::DataStore;
use crate::context::OpContext;
use crate::db::model::Instance;
use crate::db::model::InstanceState;
use chrono::Utc;
use secgroup_common::api::external::CreateResult;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::ListResultVec;
use secgroup_common::api::external::LookupResult;
use secgroup_common::api::external::ResourceType;
use secgroup_common::api::external::UpdateResult;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use secgroup_common::typed_uuid::SecurityGroupUuid;
use std::collections::BTreeSet;

impl DataStore {
    pub async fn instance_insert(
        &self,
        _opctx: &OpContext,
        instance: Instance,
    ) -> CreateResult<Instance> {
        let mut tables = self.tables.lock().unwrap();
        if tables.instances.contains_key(&instance.id) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Instance,
                object_name: instance.id.to_string(),
            });
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    /// Fetches an instance that has not been destroyed
    pub async fn instance_fetch(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> LookupResult<Instance> {
        let instance =
            self.instance_fetch_including_deleted(opctx, instance_id).await?;
        if instance.time_deleted.is_some() {
            return Err(Error::not_found_by_id(
                ResourceType::Instance,
                instance_id.as_untyped_uuid(),
            ));
        }
        Ok(instance)
    }

    pub async fn instance_fetch_including_deleted(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> LookupResult<Instance> {
        let tables = self.tables.lock().unwrap();
        tables.instances.get(&instance_id).cloned().ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Instance,
                instance_id.as_untyped_uuid(),
            )
        })
    }

    /// Moves an instance to a new state (and possibly host)
    ///
    /// Returns the record as it was before and after the update.
    pub async fn instance_update_runtime(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
        state: InstanceState,
        host_id: Option<HostUuid>,
    ) -> UpdateResult<(Instance, Instance)> {
        let mut tables = self.tables.lock().unwrap();
        let instance = tables
            .instances
            .get_mut(&instance_id)
            .filter(|i| i.time_deleted.is_none())
            .ok_or_else(|| {
                Error::not_found_by_id(
                    ResourceType::Instance,
                    instance_id.as_untyped_uuid(),
                )
            })?;
        let previous = instance.clone();
        instance.state = state;
        instance.host_id = host_id;
        Ok((previous, instance.clone()))
    }

    /// Marks the instance destroyed and removes its group memberships
    ///
    /// Returns the record as it was before deletion along with the groups it
    /// belonged to.
    pub async fn instance_soft_delete(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> UpdateResult<(Instance, BTreeSet<SecurityGroupUuid>)> {
        let mut tables = self.tables.lock().unwrap();
        let groups = tables.instance_groups(instance_id);
        let instance = tables
            .instances
            .get_mut(&instance_id)
            .filter(|i| i.time_deleted.is_none())
            .ok_or_else(|| {
                Error::not_found_by_id(
                    ResourceType::Instance,
                    instance_id.as_untyped_uuid(),
                )
            })?;
        let previous = instance.clone();
        instance.state = InstanceState::Destroyed;
        instance.time_deleted = Some(Utc::now());
        tables.memberships.retain(|(i, _)| *i != instance_id);
        Ok((previous, groups))
    }

    /// Lists running instances placed on `host_id`
    pub async fn instances_running_on_host(
        &self,
        _opctx: &OpContext,
        host_id: HostUuid,
    ) -> ListResultVec<Instance> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .instances
            .values()
            .filter(|i| i.is_running() && i.host_id == Some(host_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::model::NetworkInterface;
    use assert_matches::assert_matches;
    use secgroup_common::typed_uuid::AccountUuid;
    use secgroup_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_instance_soft_delete() {
        let logctx = test_setup_log("test_instance_soft_delete");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = DataStore::new(&logctx.log);
        let account_id = AccountUuid::new_v4();
        let host_id = HostUuid::new_v4();

        let group = datastore
            .security_group_ensure_default(&opctx, account_id)
            .await
            .unwrap();
        let instance = datastore
            .instance_insert(
                &opctx,
                Instance {
                    id: InstanceUuid::new_v4(),
                    account_id,
                    name: "db".parse().unwrap(),
                    state: InstanceState::Running,
                    host_id: Some(host_id),
                    nic: NetworkInterface {
                        ipv4: "10.0.0.9".parse().unwrap(),
                        ipv6: None,
                        mac: "02:08:20:00:00:09".parse().unwrap(),
                        secondary_ips: vec![],
                    },
                    time_created: Utc::now(),
                    time_deleted: None,
                },
            )
            .await
            .unwrap();
        datastore
            .security_group_membership_add(&opctx, instance.id, group.id)
            .await
            .unwrap();
        assert_eq!(
            datastore
                .instances_running_on_host(&opctx, host_id)
                .await
                .unwrap()
                .len(),
            1
        );

        let (previous, groups) =
            datastore.instance_soft_delete(&opctx, instance.id).await.unwrap();
        assert_eq!(previous.state, InstanceState::Running);
        assert_eq!(groups, BTreeSet::from([group.id]));

        assert_matches!(
            datastore.instance_fetch(&opctx, instance.id).await,
            Err(Error::ObjectNotFound { .. })
        );
        let deleted = datastore
            .instance_fetch_including_deleted(&opctx, instance.id)
            .await
            .unwrap();
        assert_eq!(deleted.state, InstanceState::Destroyed);
        assert!(deleted.time_deleted.is_some());
        assert!(datastore
            .instance_security_groups(&opctx, instance.id)
            .await
            .unwrap()
            .is_empty());
        assert!(datastore
            .instances_running_on_host(&opctx, host_id)
            .await
            .unwrap()
            .is_empty());
        logctx.cleanup_successful();
    }
}
