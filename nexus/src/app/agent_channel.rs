// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messaging between Nexus and the per-host agents that enforce rulesets
//!
//! Sending never waits for the agent.  Results come back later through an
//! [`AnswerHandler`], along with connect/disconnect notifications and the
//! agents' periodic reports of what they have applied.

use async_trait::async_trait;
use secgroup_common::api::internal::agent::FirewallAgent;
use secgroup_common::api::internal::agent::RulesetAnswer;
use secgroup_common::api::internal::agent::SecurityGroupRulesCmd;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_common::typed_uuid::InstanceUuid;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::task::JoinSet;

/// The agent for a host could not be reached
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
#[error("agent for host {host_id} is unavailable: {message}")]
pub struct AgentUnavailable {
    pub host_id: HostUuid,
    pub message: String,
}

/// Receives the asynchronous results of ruleset pushes
#[async_trait]
pub trait AnswerHandler: Send + Sync {
    /// The agent answered a push.
    async fn process_answer(&self, host_id: HostUuid, answer: RulesetAnswer);

    /// No answer arrived for a push within the channel's timeout.
    async fn process_timeout(
        &self,
        host_id: HostUuid,
        instance_id: InstanceUuid,
        sequence: u64,
    );

    async fn process_connect(&self, host_id: HostUuid);

    /// Pushes in flight to the agent will never be answered.
    async fn process_disconnect(&self, host_id: HostUuid);

    /// The agent reported the sequence it has applied for each instance.
    async fn process_sequence_report(
        &self,
        host_id: HostUuid,
        report: BTreeMap<InstanceUuid, u64>,
    );
}

/// Interface for sending ruleset pushes to host agents
pub trait AgentChannel: Send + Sync {
    /// Starts sending `cmd` to the agent on `host_id`
    ///
    /// Returns immediately.  The result is delivered to `handler`.
    fn send(
        &self,
        host_id: HostUuid,
        cmd: SecurityGroupRulesCmd,
        handler: Arc<dyn AnswerHandler>,
    ) -> Result<(), AgentUnavailable>;
}

struct AgentConnection {
    agent: Arc<dyn FirewallAgent>,
    /// pushes in flight; dropping the connection abandons them
    in_flight: JoinSet<()>,
}

/// [`AgentChannel`] to agents living in this process
///
/// Used by the simulated deployment and by tests.
pub struct LocalAgentChannel {
    log: Logger,
    answer_timeout: Duration,
    agents: Mutex<BTreeMap<HostUuid, AgentConnection>>,
    listener: OnceLock<Arc<dyn AnswerHandler>>,
}

impl LocalAgentChannel {
    pub fn new(log: &Logger, answer_timeout: Duration) -> LocalAgentChannel {
        LocalAgentChannel {
            log: log.new(o!("component" => "LocalAgentChannel")),
            answer_timeout,
            agents: Mutex::new(BTreeMap::new()),
            listener: OnceLock::new(),
        }
    }

    /// Registers the handler told about connects, disconnects, and reports
    ///
    /// Panics if called twice.
    pub fn register_listener(&self, listener: Arc<dyn AnswerHandler>) {
        if self.listener.set(listener).is_err() {
            panic!("attempted to register a second agent channel listener");
        }
    }

    /// Connects the agent for `host_id`, replacing any existing connection,
    /// and forwards its initial sequence report
    pub async fn connect(&self, host_id: HostUuid, agent: Arc<dyn FirewallAgent>) {
        let previous = self.agents.lock().unwrap().insert(
            host_id,
            AgentConnection { agent: Arc::clone(&agent), in_flight: JoinSet::new() },
        );
        drop(previous);
        info!(self.log, "agent connected"; "host_id" => %host_id);

        if let Some(listener) = self.listener.get() {
            listener.process_connect(host_id).await;
            let report = agent.report_sequences().await;
            listener.process_sequence_report(host_id, report).await;
        }
    }

    /// Disconnects the agent for `host_id`, abandoning pushes in flight
    pub async fn disconnect(&self, host_id: HostUuid) {
        let previous = self.agents.lock().unwrap().remove(&host_id);
        if previous.is_none() {
            return;
        }
        drop(previous);
        info!(self.log, "agent disconnected"; "host_id" => %host_id);

        if let Some(listener) = self.listener.get() {
            listener.process_disconnect(host_id).await;
        }
    }

    /// Asks the agent for `host_id` for a sequence report and forwards it
    pub async fn request_report(
        &self,
        host_id: HostUuid,
    ) -> Result<(), AgentUnavailable> {
        let agent = self.agent(host_id)?;
        let report = agent.report_sequences().await;
        debug!(self.log, "agent sequence report";
            "host_id" => %host_id,
            "instances" => report.len());
        if let Some(listener) = self.listener.get() {
            listener.process_sequence_report(host_id, report).await;
        }
        Ok(())
    }

    pub fn connected_hosts(&self) -> Vec<HostUuid> {
        self.agents.lock().unwrap().keys().copied().collect()
    }

    fn agent(
        &self,
        host_id: HostUuid,
    ) -> Result<Arc<dyn FirewallAgent>, AgentUnavailable> {
        self.agents
            .lock()
            .unwrap()
            .get(&host_id)
            .map(|c| Arc::clone(&c.agent))
            .ok_or_else(|| AgentUnavailable {
                host_id,
                message: String::from("agent is not connected"),
            })
    }
}

impl AgentChannel for LocalAgentChannel {
    fn send(
        &self,
        host_id: HostUuid,
        cmd: SecurityGroupRulesCmd,
        handler: Arc<dyn AnswerHandler>,
    ) -> Result<(), AgentUnavailable> {
        let mut agents = self.agents.lock().unwrap();
        let connection =
            agents.get_mut(&host_id).ok_or_else(|| AgentUnavailable {
                host_id,
                message: String::from("agent is not connected"),
            })?;

        // Reap pushes that have already finished.
        while connection.in_flight.try_join_next().is_some() {}

        let agent = Arc::clone(&connection.agent);
        let timeout = self.answer_timeout;
        let log = self.log.new(o!(
            "host_id" => host_id.to_string(),
            "instance_id" => cmd.instance_id.to_string(),
            "sequence" => cmd.sequence,
        ));
        connection.in_flight.spawn(async move {
            let instance_id = cmd.instance_id;
            let sequence = cmd.sequence;
            match tokio::time::timeout(timeout, agent.ensure_rules(cmd)).await {
                Ok(answer) => {
                    trace!(log, "agent answered"; "answer" => ?answer.outcome);
                    handler.process_answer(host_id, answer).await;
                }
                Err(_) => {
                    warn!(log, "timed out waiting for agent answer";
                        "timeout" => ?timeout);
                    handler
                        .process_timeout(host_id, instance_id, sequence)
                        .await;
                }
            }
        });
        Ok(())
    }
}
