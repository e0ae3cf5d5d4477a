// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workers that turn queued work items into ruleset pushes
//!
//! Each wakeup from the [`WorkScheduler`] lets one worker claim one work
//! item.  The worker holds the instance's row lock while it resolves the
//! ruleset and hands the command to the [`AgentChannel`], and never waits for
//! the agent's answer: that arrives later at the [`AnswerHandler`].

use super::agent_channel::AgentChannel;
use super::agent_channel::AnswerHandler;
use super::inspect::PropagationStats;
use super::ruleset::instance_rules_cmd;
use super::send_rate::SendRateTracker;
use super::work_queue::WorkScheduler;
use crate::context::OpContext;
use crate::db::DataStore;
use crate::db::datastore::LockKey;
use crate::db::model::Instance;
use crate::db::model::WorkStep;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::InternalContext;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What a worker did with one wakeup
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// nothing was waiting
    NoWork,
    /// the claimed item was already finished by the time we looked again
    StaleRetrigger,
    /// the instance has been destroyed
    InstanceGone,
    /// the instance isn't running, so there's nothing to push
    NotRunning,
    /// the agent's send buffer was full
    Discarded,
    /// the command was handed to the agent channel
    Sent { sequence: u64 },
    /// the agent could not be reached
    AgentUnavailable,
}

/// Result of trying to send one instance's ruleset
enum SendOutcome {
    Sent { sequence: u64 },
    Discarded,
    AgentUnavailable(String),
}

pub struct Dispatcher {
    log: Logger,
    /// identifies this process's claims on work items
    server_id: Uuid,
    datastore: Arc<DataStore>,
    scheduler: Arc<WorkScheduler>,
    tracker: Arc<SendRateTracker>,
    channel: Arc<dyn AgentChannel>,
    listener: Arc<dyn AnswerHandler>,
    stats: Arc<PropagationStats>,
    row_lock_timeout: Duration,
    cleanup_interval: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: &Logger,
        server_id: Uuid,
        datastore: Arc<DataStore>,
        scheduler: Arc<WorkScheduler>,
        tracker: Arc<SendRateTracker>,
        channel: Arc<dyn AgentChannel>,
        listener: Arc<dyn AnswerHandler>,
        stats: Arc<PropagationStats>,
        row_lock_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Dispatcher {
        Dispatcher {
            log: log.new(o!("component" => "Dispatcher")),
            server_id,
            datastore,
            scheduler,
            tracker,
            channel,
            listener,
            stats,
            row_lock_timeout,
            cleanup_interval,
        }
    }

    /// Claims and processes one work item
    ///
    /// An error leaves the claimed item in progress for the unfinished-work
    /// sweep.
    pub async fn process_one(
        &self,
        opctx: &OpContext,
    ) -> Result<DispatchOutcome, Error> {
        let Some(work) =
            self.datastore.work_item_take(opctx, self.server_id).await?
        else {
            return Ok(DispatchOutcome::NoWork);
        };
        let opctx = opctx.child(BTreeMap::from([
            (String::from("instance_id"), work.instance_id.to_string()),
            (String::from("work_item_id"), work.id.to_string()),
        ]));

        let _guard = self
            .datastore
            .lock_rows(
                &opctx,
                [LockKey::Instance(work.instance_id)],
                self.row_lock_timeout,
            )
            .await?;

        let work = self.datastore.work_item_fetch(&opctx, work.id).await?;
        if work.step.is_finished() {
            debug!(opctx.log, "claimed work item already finished";
                "step" => %work.step);
            self.scheduler.wake_after(self.cleanup_interval);
            return Ok(DispatchOutcome::StaleRetrigger);
        }

        let instance =
            match self.datastore.instance_fetch(&opctx, work.instance_id).await {
                Ok(instance) => instance,
                Err(Error::ObjectNotFound { .. }) => {
                    debug!(opctx.log, "instance is gone");
                    self.finish(&opctx, work.id).await?;
                    return Ok(DispatchOutcome::InstanceGone);
                }
                Err(error) => return Err(error),
            };
        let host_id = match (instance.is_running(), instance.host_id) {
            (true, Some(host_id)) => host_id,
            _ => {
                debug!(opctx.log, "instance not running";
                    "state" => %instance.state);
                self.finish(&opctx, work.id).await?;
                return Ok(DispatchOutcome::NotRunning);
            }
        };

        let sent = self
            .send_ruleset(&opctx, &instance, host_id, Some(work.id))
            .await
            .with_internal_context(|| {
                format!("sending ruleset for work item {}", work.id)
            })?;
        let outcome = match sent {
            SendOutcome::Sent { sequence } => {
                return Ok(DispatchOutcome::Sent { sequence });
            }
            SendOutcome::Discarded => DispatchOutcome::Discarded,
            SendOutcome::AgentUnavailable(_) => {
                DispatchOutcome::AgentUnavailable
            }
        };
        // Agent resyncs and the sweeps take care of anything lost here.
        self.finish(&opctx, work.id).await?;
        Ok(outcome)
    }

    /// Pushes the instance's current ruleset right away, without a work item
    ///
    /// Returns the sequence number sent.
    pub async fn force_resend(
        &self,
        opctx: &OpContext,
        instance_id: InstanceUuid,
    ) -> Result<u64, Error> {
        let _guard = self
            .datastore
            .lock_rows(
                opctx,
                [LockKey::Instance(instance_id)],
                self.row_lock_timeout,
            )
            .await?;
        let instance = self.datastore.instance_fetch(opctx, instance_id).await?;
        let host_id = match (instance.is_running(), instance.host_id) {
            (true, Some(host_id)) => host_id,
            _ => {
                return Err(Error::invalid_request(&format!(
                    "instance is {}, not running",
                    instance.state
                )));
            }
        };

        warn!(opctx.log, "forcing ruleset push"; "instance_id" => %instance_id);
        match self.send_ruleset(opctx, &instance, host_id, None).await? {
            SendOutcome::Sent { sequence } => Ok(sequence),
            SendOutcome::Discarded => {
                Err(Error::unavail("agent has too many pushes outstanding"))
            }
            SendOutcome::AgentUnavailable(message) => {
                Err(Error::unavail(&message))
            }
        }
    }

    async fn send_ruleset(
        &self,
        opctx: &OpContext,
        instance: &Instance,
        host_id: HostUuid,
        work_item_id: Option<u64>,
    ) -> Result<SendOutcome, Error> {
        let sequence =
            self.datastore.sequence_log_current(opctx, instance.id).await?;
        if let Some(work_item_id) = work_item_id {
            self.datastore
                .work_item_set_sequence(opctx, work_item_id, sequence)
                .await?;
        }
        let cmd =
            instance_rules_cmd(&self.datastore, opctx, instance, sequence).await?;

        if !self.tracker.can_send(host_id) {
            warn!(opctx.log, "agent send buffer full, dropping ruleset push";
                "host_id" => %host_id,
                "buffer_length" => self.tracker.buffer_length());
            return Ok(SendOutcome::Discarded);
        }

        let signature = cmd.signature.clone();
        if let Err(error) =
            self.channel.send(host_id, cmd, Arc::clone(&self.listener))
        {
            self.tracker.release(host_id);
            warn!(opctx.log, "failed to send ruleset"; "error" => %error);
            return Ok(SendOutcome::AgentUnavailable(error.to_string()));
        }

        debug!(opctx.log, "sent ruleset";
            "host_id" => %host_id,
            "sequence" => sequence,
            "signature" => signature);
        self.stats.record_sent(instance.id, sequence);
        Ok(SendOutcome::Sent { sequence })
    }

    async fn finish(
        &self,
        opctx: &OpContext,
        work_item_id: u64,
    ) -> Result<(), Error> {
        self.datastore
            .work_item_update_step(opctx, work_item_id, WorkStep::Done)
            .await?;
        Ok(())
    }
}

/// Starts `count` workers sharing the scheduler's wakeups
///
/// Workers exit once every sender of `wakeups` is gone.
pub fn start_workers(
    dispatcher: Arc<Dispatcher>,
    wakeups: mpsc::UnboundedReceiver<()>,
    count: usize,
    opctx: &OpContext,
) -> Vec<JoinHandle<()>> {
    let wakeups = Arc::new(tokio::sync::Mutex::new(wakeups));
    (0..count)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            let wakeups = Arc::clone(&wakeups);
            let opctx = opctx.child(BTreeMap::from([(
                String::from("worker"),
                i.to_string(),
            )]));
            tokio::spawn(async move {
                loop {
                    let woken = wakeups.lock().await.recv().await;
                    if woken.is_none() {
                        debug!(opctx.log, "ruleset worker exiting");
                        break;
                    }
                    match dispatcher.process_one(&opctx).await {
                        Ok(outcome) => {
                            trace!(opctx.log, "processed wakeup";
                                "outcome" => ?outcome)
                        }
                        Err(error) if error.retryable() => {
                            warn!(opctx.log, "failed to process work item";
                                "error" => %error)
                        }
                        Err(error) => {
                            error!(opctx.log, "failed to process work item";
                                "error" => %error)
                        }
                    }
                }
            })
        })
        .collect()
}
