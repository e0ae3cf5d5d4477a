// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on the ruleset work queue

use super::DataStore;
use crate::context::OpContext;
use crate::db::model::WorkItem;
use crate::db::model::WorkStep;
use chrono::DateTime;
use chrono::Utc;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::ListResultVec;
use secgroup_common::api::external::LookupResult;
use secgroup_common::api::external::LookupType;
use secgroup_common::api::external::ResourceType;
use secgroup_common::api::external::UpdateResult;
use secgroup_common::typed_uuid::InstanceUuid;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Result of scheduling one instance
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScheduledWork {
    pub instance_id: InstanceUuid,
    pub work_item_id: u64,
    pub sequence: u64,
    /// whether an already-scheduled item absorbed this request
    pub coalesced: bool,
}

fn work_item_not_found(id: u64) -> Error {
    LookupType::ByCompositeId(format!("work item {}", id))
        .into_not_found(ResourceType::WorkItem)
}

impl DataStore {
    /// Ensures each instance has exactly one `Scheduled` work item, advancing
    /// its sequence log first if `bump` is set
    ///
    /// Instances are processed in sorted order.  The whole batch is applied
    /// atomically.
    pub async fn work_items_schedule(
        &self,
        _opctx: &OpContext,
        instance_ids: &BTreeSet<InstanceUuid>,
        bump: bool,
    ) -> Result<Vec<ScheduledWork>, Error> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        let mut scheduled = Vec::with_capacity(instance_ids.len());
        for instance_id in instance_ids {
            let sequence = tables.sequence_log_advance(*instance_id, bump);

            let existing = tables.work_items.values_mut().find(|w| {
                w.instance_id == *instance_id && w.step == WorkStep::Scheduled
            });
            let (work_item_id, coalesced) = match existing {
                Some(work) => {
                    work.log_sequence = sequence;
                    work.time_updated = now;
                    (work.id, true)
                }
                None => {
                    tables.next_work_item_id += 1;
                    let id = tables.next_work_item_id;
                    tables.work_items.insert(
                        id,
                        WorkItem {
                            id,
                            instance_id: *instance_id,
                            step: WorkStep::Scheduled,
                            log_sequence: sequence,
                            server_id: None,
                            time_created: now,
                            time_updated: now,
                            time_taken: None,
                        },
                    );
                    (id, false)
                }
            };
            scheduled.push(ScheduledWork {
                instance_id: *instance_id,
                work_item_id,
                sequence,
                coalesced,
            });
        }
        Ok(scheduled)
    }

    /// Claims the oldest `Scheduled` item for `server_id`, moving it to
    /// `Processing`
    pub async fn work_item_take(
        &self,
        _opctx: &OpContext,
        server_id: Uuid,
    ) -> Result<Option<WorkItem>, Error> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        // Ids are allocated in creation order.
        let claimed = tables
            .work_items
            .values_mut()
            .find(|w| w.step == WorkStep::Scheduled)
            .map(|work| {
                work.step = WorkStep::Processing;
                work.server_id = Some(server_id);
                work.time_taken = Some(now);
                work.time_updated = now;
                work.clone()
            });
        Ok(claimed)
    }

    pub async fn work_item_fetch(
        &self,
        _opctx: &OpContext,
        work_item_id: u64,
    ) -> LookupResult<WorkItem> {
        let tables = self.tables.lock().unwrap();
        tables
            .work_items
            .get(&work_item_id)
            .cloned()
            .ok_or_else(|| work_item_not_found(work_item_id))
    }

    pub async fn work_item_update_step(
        &self,
        _opctx: &OpContext,
        work_item_id: u64,
        step: WorkStep,
    ) -> UpdateResult<WorkItem> {
        let mut tables = self.tables.lock().unwrap();
        let work = tables
            .work_items
            .get_mut(&work_item_id)
            .ok_or_else(|| work_item_not_found(work_item_id))?;
        work.step = step;
        work.time_updated = Utc::now();
        Ok(work.clone())
    }

    /// Marks an item `Error` only if it is still unfinished and was last
    /// updated before `cutoff`
    ///
    /// Returns whether the item was marked.  An item finished or refreshed
    /// since the caller last read it is left alone.
    pub async fn work_item_mark_error_if_unfinished(
        &self,
        _opctx: &OpContext,
        work_item_id: u64,
        cutoff: DateTime<Utc>,
    ) -> UpdateResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        let work = tables
            .work_items
            .get_mut(&work_item_id)
            .ok_or_else(|| work_item_not_found(work_item_id))?;
        if work.step.is_finished() || work.time_updated >= cutoff {
            return Ok(false);
        }
        work.step = WorkStep::Error;
        work.time_updated = Utc::now();
        Ok(true)
    }

    /// Records the sequence number actually sent for a claimed item
    pub async fn work_item_set_sequence(
        &self,
        _opctx: &OpContext,
        work_item_id: u64,
        sequence: u64,
    ) -> UpdateResult<WorkItem> {
        let mut tables = self.tables.lock().unwrap();
        let work = tables
            .work_items
            .get_mut(&work_item_id)
            .ok_or_else(|| work_item_not_found(work_item_id))?;
        work.log_sequence = sequence;
        work.time_updated = Utc::now();
        Ok(work.clone())
    }

    /// Finishes the `Processing` items for an instance that were sent with
    /// `sequence`
    ///
    /// Returns how many items were updated.  Zero is normal when the answer
    /// arrives after the item was swept.
    pub async fn work_item_complete(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
        sequence: u64,
        step: WorkStep,
    ) -> Result<usize, Error> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        let mut count = 0;
        for work in tables.work_items.values_mut().filter(|w| {
            w.instance_id == instance_id
                && w.log_sequence == sequence
                && w.step == WorkStep::Processing
        }) {
            work.step = step;
            work.time_updated = now;
            count += 1;
        }
        Ok(count)
    }

    /// Lists `Scheduled` and `Processing` items last updated before `cutoff`
    pub async fn work_items_unfinished_before(
        &self,
        _opctx: &OpContext,
        cutoff: DateTime<Utc>,
    ) -> ListResultVec<WorkItem> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .work_items
            .values()
            .filter(|w| !w.step.is_finished() && w.time_updated < cutoff)
            .cloned()
            .collect())
    }

    /// Deletes `Done` and `Error` items last updated before `cutoff`
    pub async fn work_items_delete_finished_before(
        &self,
        _opctx: &OpContext,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, Error> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.work_items.len();
        tables
            .work_items
            .retain(|_, w| !(w.step.is_finished() && w.time_updated < cutoff));
        Ok(before - tables.work_items.len())
    }

    /// Counts items that are `Scheduled` or `Processing`
    pub async fn work_queue_depth(
        &self,
        _opctx: &OpContext,
    ) -> Result<usize, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.work_items.values().filter(|w| !w.step.is_finished()).count())
    }

    /// Returns the most recently created item for the instance
    pub async fn work_item_latest(
        &self,
        _opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<Option<WorkItem>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .work_items
            .values()
            .rev()
            .find(|w| w.instance_id == instance_id)
            .cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use secgroup_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_schedule_coalesces() {
        let logctx = test_setup_log("test_schedule_coalesces");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = DataStore::new(&logctx.log);
        let vm = InstanceUuid::new_v4();
        let ids = BTreeSet::from([vm]);

        let first = datastore.work_items_schedule(&opctx, &ids, true).await.unwrap();
        let second =
            datastore.work_items_schedule(&opctx, &ids, true).await.unwrap();
        assert!(!first[0].coalesced);
        assert!(second[0].coalesced);
        assert_eq!(first[0].work_item_id, second[0].work_item_id);
        assert_eq!(second[0].sequence, 2);

        // A non-bumping request coalesces without advancing the sequence.
        let third =
            datastore.work_items_schedule(&opctx, &ids, false).await.unwrap();
        assert_eq!(third[0].sequence, 2);
        assert_eq!(datastore.work_queue_depth(&opctx).await.unwrap(), 1);
        let work = datastore
            .work_item_fetch(&opctx, first[0].work_item_id)
            .await
            .unwrap();
        assert_eq!(work.log_sequence, 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_take_and_complete() {
        let logctx = test_setup_log("test_take_and_complete");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = DataStore::new(&logctx.log);
        let server_id = Uuid::new_v4();
        let vm1 = InstanceUuid::new_v4();
        let vm2 = InstanceUuid::new_v4();

        datastore
            .work_items_schedule(&opctx, &BTreeSet::from([vm1]), true)
            .await
            .unwrap();
        datastore
            .work_items_schedule(&opctx, &BTreeSet::from([vm2]), true)
            .await
            .unwrap();

        let first =
            datastore.work_item_take(&opctx, server_id).await.unwrap().unwrap();
        assert_eq!(first.instance_id, vm1);
        assert_eq!(first.step, WorkStep::Processing);
        assert_eq!(first.server_id, Some(server_id));
        assert!(first.time_taken.is_some());

        // A claimed item no longer absorbs new requests.
        let again = datastore
            .work_items_schedule(&opctx, &BTreeSet::from([vm1]), true)
            .await
            .unwrap();
        assert!(!again[0].coalesced);
        assert_eq!(again[0].sequence, 2);

        let second =
            datastore.work_item_take(&opctx, server_id).await.unwrap().unwrap();
        assert_eq!(second.instance_id, vm2);

        // Answers only complete the item sent with the same sequence.
        assert_eq!(
            datastore
                .work_item_complete(&opctx, vm1, 2, WorkStep::Done)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            datastore
                .work_item_complete(&opctx, vm1, 1, WorkStep::Done)
                .await
                .unwrap(),
            1
        );
        let done = datastore.work_item_fetch(&opctx, first.id).await.unwrap();
        assert_eq!(done.step, WorkStep::Done);
        assert_eq!(datastore.work_queue_depth(&opctx).await.unwrap(), 2);

        let latest =
            datastore.work_item_latest(&opctx, vm1).await.unwrap().unwrap();
        assert_eq!(latest.id, again[0].work_item_id);
        assert_matches!(
            datastore.work_item_fetch(&opctx, 1000).await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cleanup_queries() {
        let logctx = test_setup_log("test_cleanup_queries");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = DataStore::new(&logctx.log);
        let ids: BTreeSet<_> = (0..3).map(|_| InstanceUuid::new_v4()).collect();
        let scheduled =
            datastore.work_items_schedule(&opctx, &ids, true).await.unwrap();
        datastore
            .work_item_update_step(&opctx, scheduled[0].work_item_id, WorkStep::Done)
            .await
            .unwrap();
        datastore
            .work_item_update_step(&opctx, scheduled[1].work_item_id, WorkStep::Error)
            .await
            .unwrap();

        let now = Utc::now();
        assert!(datastore
            .work_items_unfinished_before(&opctx, now - Duration::seconds(60))
            .await
            .unwrap()
            .is_empty());
        let unfinished = datastore
            .work_items_unfinished_before(&opctx, now + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, scheduled[2].work_item_id);

        assert_eq!(
            datastore
                .work_items_delete_finished_before(
                    &opctx,
                    now - Duration::seconds(60)
                )
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            datastore
                .work_items_delete_finished_before(
                    &opctx,
                    now + Duration::seconds(60)
                )
                .await
                .unwrap(),
            2
        );
        assert_eq!(datastore.work_queue_depth(&opctx).await.unwrap(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_mark_error_if_unfinished() {
        let logctx = test_setup_log("test_mark_error_if_unfinished");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = DataStore::new(&logctx.log);
        let ids: BTreeSet<_> = (0..2).map(|_| InstanceUuid::new_v4()).collect();
        let scheduled =
            datastore.work_items_schedule(&opctx, &ids, true).await.unwrap();
        let cutoff = Utc::now() + Duration::seconds(60);

        // An item answered in the meantime keeps its outcome.
        datastore
            .work_item_update_step(&opctx, scheduled[0].work_item_id, WorkStep::Done)
            .await
            .unwrap();
        assert!(!datastore
            .work_item_mark_error_if_unfinished(
                &opctx,
                scheduled[0].work_item_id,
                cutoff
            )
            .await
            .unwrap());
        assert_eq!(
            datastore
                .work_item_fetch(&opctx, scheduled[0].work_item_id)
                .await
                .unwrap()
                .step,
            WorkStep::Done
        );

        // An item touched after the cutoff is not stale any more.
        assert!(!datastore
            .work_item_mark_error_if_unfinished(
                &opctx,
                scheduled[1].work_item_id,
                Utc::now() - Duration::seconds(60)
            )
            .await
            .unwrap());
        assert!(datastore
            .work_item_mark_error_if_unfinished(
                &opctx,
                scheduled[1].work_item_id,
                cutoff
            )
            .await
            .unwrap());
        assert_eq!(
            datastore
                .work_item_fetch(&opctx, scheduled[1].work_item_id)
                .await
                .unwrap()
                .step,
            WorkStep::Error
        );
        assert_matches!(
            datastore.work_item_mark_error_if_unfinished(&opctx, 1000, cutoff).await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }
}
