// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by operations within Nexus

use slog::Logger;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Instant;
use std::time::SystemTime;

/// Provides general facilities scoped to whatever operation Nexus is currently
/// doing
///
/// The idea is that whatever code path you're looking at in Nexus, it should
/// eventually have an OpContext that allows it to:
///
/// - log a message (with relevant operation-specific metadata)
/// - figure out how long the operation has been running (for debugging)
///
/// Background tasks, dispatch workers, and answer processing each get a
/// context of their own.
pub struct OpContext {
    pub log: Logger,

    created_instant: Instant,
    created_walltime: SystemTime,
    metadata: BTreeMap<String, String>,
    kind: OpKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Handling a request at the group, rule, or instance management boundary
    Request,
    /// Background operations in Nexus (dispatching, sweeping, answers)
    Background,
    /// Automated testing (unit tests and integration tests)
    Test,
}

impl OpContext {
    fn new(log: Logger, metadata: BTreeMap<String, String>, kind: OpKind) -> Self {
        let created_instant = Instant::now();
        let created_walltime = SystemTime::now();
        let log = metadata.iter().fold(log, |log, (k, v)| {
            log.new(o!(k.clone() => v.clone()))
        });
        OpContext { log, created_instant, created_walltime, metadata, kind }
    }

    /// Returns a context suitable for handling a management request
    pub fn for_request(log: Logger, operation: &str) -> OpContext {
        let metadata = BTreeMap::from([(
            String::from("operation"),
            operation.to_string(),
        )]);
        OpContext::new(log, metadata, OpKind::Request)
    }

    /// Returns a context suitable for use in background operations in Nexus
    pub fn for_background(log: Logger) -> OpContext {
        OpContext::new(log, BTreeMap::new(), OpKind::Background)
    }

    /// Returns a context suitable for automated tests
    pub fn for_tests(log: Logger) -> OpContext {
        OpContext::new(log, BTreeMap::new(), OpKind::Test)
    }

    /// Creates a new `OpContext` just like the given one, but with a
    /// different logger and additional metadata
    ///
    /// Each key in `new_metadata` is also added to the child's logger.
    pub fn child(&self, new_metadata: BTreeMap<String, String>) -> OpContext {
        let mut metadata = self.metadata.clone();
        let mut log = self.log.clone();
        for (k, v) in new_metadata {
            metadata.insert(k.clone(), v.clone());
            log = log.new(o!(k => v));
        }

        OpContext {
            log,
            created_instant: Instant::now(),
            created_walltime: SystemTime::now(),
            metadata,
            kind: self.kind,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Returns how long this operation has been running
    pub fn elapsed(&self) -> std::time::Duration {
        self.created_instant.elapsed()
    }

    pub fn created_walltime(&self) -> SystemTime {
        self.created_walltime
    }
}

impl Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("created_instant", &self.created_instant)
            .field("created_walltime", &self.created_walltime)
            .field("metadata", &self.metadata)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
