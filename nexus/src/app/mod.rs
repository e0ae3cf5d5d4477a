// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nexus, the security group control plane

use self::agent_channel::AgentChannel;
use self::agent_channel::AnswerHandler;
use self::answer_listener::AnswerListener;
use self::dispatcher::Dispatcher;
use self::inspect::PropagationStats;
use self::instance::InstanceObserver;
use self::instance::RulesetLifecycleHook;
use self::send_rate::SendRateTracker;
use self::work_queue::WorkScheduler;
use crate::config;
use crate::context::OpContext;
use crate::db;
use slog::Logger;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

// The implementation of Nexus is large, and split into a number of submodules
// by resource.
pub mod agent_channel;
pub mod answer_listener;
pub mod background;
pub mod dispatcher;
pub mod inspect;
pub mod instance;
pub mod ruleset;
pub mod security_group;
pub mod send_rate;
pub mod sync;
pub mod test_interfaces;
pub mod work_queue;

/// Manages security groups and keeps every running instance's firewall
/// ruleset in step with them
pub struct Nexus {
    /// uuid for this nexus instance; stamped on the work items it claims
    id: Uuid,

    /// general server log
    log: Logger,

    /// storage for groups, rules, instances, and the work queue
    datastore: Arc<db::DataStore>,

    /// entry point for scheduling ruleset pushes
    scheduler: Arc<WorkScheduler>,

    /// turns queued work into pushes
    dispatcher: Arc<Dispatcher>,

    /// receives agents' answers
    listener: Arc<AnswerListener>,

    /// per-agent admission control for pushes
    tracker: Arc<SendRateTracker>,

    /// per-instance propagation bookkeeping for operators
    stats: Arc<PropagationStats>,

    /// parties told about instance state transitions
    instance_observers: RwLock<Vec<Arc<dyn InstanceObserver>>>,

    /// driver for background tasks
    background_tasks_driver: background::Driver,

    /// names of the well-known background tasks
    background_tasks: background::BackgroundTasks,

    /// ruleset push workers
    workers: Vec<JoinHandle<()>>,

    /// how long to wait for group and instance row locks
    row_lock_timeout: std::time::Duration,
}

impl Nexus {
    /// Create a new Nexus instance with id `id`
    ///
    /// Agents' answers must be routed to [`Nexus::answer_handler()`] by
    /// whoever owns `channel`.
    pub fn new_with_id(
        id: Uuid,
        log: Logger,
        config: &config::Config,
        channel: Arc<dyn AgentChannel>,
    ) -> Arc<Nexus> {
        let log = log.new(o!("nexus_id" => id.to_string()));
        let propagation = &config.propagation;
        let cleanup_interval =
            config.background_tasks.unfinished_work_cleanup.period_secs;

        let datastore = Arc::new(db::DataStore::new(&log));
        let stats = Arc::new(PropagationStats::default());
        let tracker =
            Arc::new(SendRateTracker::new(propagation.agent_buffer_length));
        let (scheduler, wakeups) = WorkScheduler::new(
            &log,
            Arc::clone(&datastore),
            propagation.global_lock_timeout,
            Arc::clone(&stats),
        );
        let scheduler = Arc::new(scheduler);
        let listener = Arc::new(AnswerListener::new(
            &log,
            Arc::clone(&datastore),
            Arc::clone(&tracker),
            Arc::clone(&scheduler),
            propagation.max_programming_retries,
            propagation.retry_delay,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &log,
            id,
            Arc::clone(&datastore),
            Arc::clone(&scheduler),
            Arc::clone(&tracker),
            channel,
            Arc::clone(&listener) as Arc<dyn AnswerHandler>,
            Arc::clone(&stats),
            propagation.row_lock_timeout,
            cleanup_interval,
        ));

        let workers_opctx =
            OpContext::for_background(log.new(o!("component" => "Workers")));
        let workers = dispatcher::start_workers(
            Arc::clone(&dispatcher),
            wakeups,
            propagation.worker_count,
            &workers_opctx,
        );

        let background_ctx = OpContext::for_background(
            log.new(o!("component" => "BackgroundTasks")),
        );
        let (background_tasks_driver, background_tasks) = background::init(
            &background_ctx,
            Arc::clone(&datastore),
            Arc::clone(&scheduler),
            &config.background_tasks,
        );

        let lifecycle_hook: Arc<dyn InstanceObserver> = Arc::new(
            RulesetLifecycleHook::new(
                Arc::clone(&datastore),
                Arc::clone(&scheduler),
            ),
        );

        info!(log, "nexus started";
            "workers" => propagation.worker_count,
            "agent_buffer_length" => propagation.agent_buffer_length);

        Arc::new(Nexus {
            id,
            log,
            datastore,
            scheduler,
            dispatcher,
            listener,
            tracker,
            stats,
            instance_observers: RwLock::new(vec![lifecycle_hook]),
            background_tasks_driver,
            background_tasks,
            workers,
            row_lock_timeout: propagation.row_lock_timeout,
        })
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Returns the handler that agents' answers must be delivered to
    pub fn answer_handler(&self) -> Arc<dyn AnswerHandler> {
        Arc::clone(&self.listener) as Arc<dyn AnswerHandler>
    }

    pub fn background_tasks(&self) -> &background::BackgroundTasks {
        &self.background_tasks
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
        debug!(self.log, "nexus shut down");
    }
}
