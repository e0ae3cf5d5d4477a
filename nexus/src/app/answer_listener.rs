// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handling of agents' answers to ruleset pushes

use super::agent_channel::AnswerHandler;
use super::send_rate::SendRateTracker;
use super::sync::full_sync;
use super::work_queue::WorkScheduler;
use crate::context::OpContext;
use crate::db::DataStore;
use crate::db::model::WorkStep;
use async_trait::async_trait;
use secgroup_common::api::internal::agent::AgentFailureReason;
use secgroup_common::api::internal::agent::RulesetAnswer;
use secgroup_common::api::internal::agent::RulesetOutcome;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// What the listener decided to do about an answer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnswerDisposition {
    Done,
    /// permanent failure, not retried
    Failed,
    /// transient failure; the instance was rescheduled
    Retrying { attempt: u32 },
    /// transient failure that has used up its retries
    GaveUp,
}

pub struct AnswerListener {
    log: Logger,
    datastore: Arc<DataStore>,
    tracker: Arc<SendRateTracker>,
    scheduler: Arc<WorkScheduler>,
    max_retries: u32,
    retry_delay: Duration,
    /// consecutive programming failures per instance
    retries: Mutex<BTreeMap<InstanceUuid, u32>>,
}

impl AnswerListener {
    pub fn new(
        log: &Logger,
        datastore: Arc<DataStore>,
        tracker: Arc<SendRateTracker>,
        scheduler: Arc<WorkScheduler>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> AnswerListener {
        AnswerListener {
            log: log.new(o!("component" => "AnswerListener")),
            datastore,
            tracker,
            scheduler,
            max_retries,
            retry_delay,
            retries: Mutex::new(BTreeMap::new()),
        }
    }

    fn opctx(&self, host_id: HostUuid) -> OpContext {
        OpContext::for_background(
            self.log.new(o!("host_id" => host_id.to_string())),
        )
    }

    pub fn retry_count(&self, instance_id: InstanceUuid) -> u32 {
        self.retries.lock().unwrap().get(&instance_id).copied().unwrap_or(0)
    }

    /// Drops the retry counter for an instance that no longer exists
    pub fn forget(&self, instance_id: InstanceUuid) {
        self.retries.lock().unwrap().remove(&instance_id);
    }

    /// Applies an answer to the work queue, returning what was done
    pub async fn handle_answer(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        answer: RulesetAnswer,
    ) -> AnswerDisposition {
        self.tracker.release(host_id);

        let instance_id = answer.instance_id;
        let (step, disposition) = match &answer.outcome {
            RulesetOutcome::Applied
            | RulesetOutcome::Unchanged
            | RulesetOutcome::Stale { .. } => {
                self.retries.lock().unwrap().remove(&instance_id);
                (WorkStep::Done, AnswerDisposition::Done)
            }
            RulesetOutcome::Failed {
                reason: AgentFailureReason::CannotBridgeFirewall,
                message,
            } => {
                warn!(opctx.log, "host cannot enforce security groups";
                    "instance_id" => %instance_id,
                    "message" => message);
                self.retries.lock().unwrap().remove(&instance_id);
                (WorkStep::Error, AnswerDisposition::Failed)
            }
            RulesetOutcome::Failed {
                reason: AgentFailureReason::ProgrammingFailed,
                message,
            } => {
                let attempt = {
                    let mut retries = self.retries.lock().unwrap();
                    let count = retries.entry(instance_id).or_insert(0);
                    *count += 1;
                    let attempt = *count;
                    if attempt >= self.max_retries {
                        retries.remove(&instance_id);
                    }
                    attempt
                };
                if attempt < self.max_retries {
                    info!(opctx.log, "ruleset programming failed, retrying";
                        "instance_id" => %instance_id,
                        "attempt" => attempt,
                        "message" => message);
                    (WorkStep::Error, AnswerDisposition::Retrying { attempt })
                } else {
                    warn!(opctx.log, "ruleset programming failed, giving up";
                        "instance_id" => %instance_id,
                        "attempts" => attempt,
                        "message" => message);
                    (WorkStep::Error, AnswerDisposition::GaveUp)
                }
            }
        };

        match self
            .datastore
            .work_item_complete(opctx, instance_id, answer.sequence, step)
            .await
        {
            Ok(0) => debug!(opctx.log, "no work item waiting for answer";
                "instance_id" => %instance_id,
                "sequence" => answer.sequence),
            Ok(_) => (),
            Err(error) => error!(opctx.log, "failed to record answer";
                "instance_id" => %instance_id,
                "error" => %error),
        }

        if let AnswerDisposition::Retrying { .. } = disposition {
            if let Err(error) = self
                .scheduler
                .schedule_update(
                    opctx,
                    BTreeSet::from([instance_id]),
                    false,
                    self.retry_delay,
                )
                .await
            {
                error!(opctx.log, "failed to reschedule ruleset push";
                    "instance_id" => %instance_id,
                    "error" => %error);
            }
        }
        disposition
    }
}

#[async_trait]
impl AnswerHandler for AnswerListener {
    async fn process_answer(&self, host_id: HostUuid, answer: RulesetAnswer) {
        let opctx = self.opctx(host_id);
        self.handle_answer(&opctx, host_id, answer).await;
    }

    async fn process_timeout(
        &self,
        host_id: HostUuid,
        instance_id: InstanceUuid,
        sequence: u64,
    ) {
        // The work item stays in progress until the unfinished-work sweep
        // picks it up, and the sweep's push starts a fresh retry count.
        debug!(self.log, "ruleset push unanswered";
            "host_id" => %host_id,
            "instance_id" => %instance_id,
            "sequence" => sequence);
        self.retries.lock().unwrap().remove(&instance_id);
        self.tracker.release(host_id);
    }

    async fn process_connect(&self, host_id: HostUuid) {
        self.tracker.reset(host_id);
    }

    async fn process_disconnect(&self, host_id: HostUuid) {
        info!(self.log, "agent disconnected, forgetting outstanding pushes";
            "host_id" => %host_id,
            "outstanding" => self.tracker.outstanding(host_id));
        self.tracker.reset(host_id);
    }

    async fn process_sequence_report(
        &self,
        host_id: HostUuid,
        report: BTreeMap<InstanceUuid, u64>,
    ) {
        let opctx = self.opctx(host_id);
        if let Err(error) = full_sync(
            &self.datastore,
            &self.scheduler,
            &opctx,
            host_id,
            &report,
        )
        .await
        {
            error!(opctx.log, "full resync failed"; "error" => %error);
        }
    }
}
