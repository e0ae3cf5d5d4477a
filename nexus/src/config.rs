// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a nexus server
//! configuration

use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use serde_with::DurationSeconds;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration for a nexus server
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    /// Ruleset propagation tunables.
    #[serde(default)]
    pub propagation: PropagationConfig,
    /// Periods of the background tasks.
    #[serde(default)]
    pub background_tasks: BackgroundTaskConfig,
    /// Simulated deployment used by the `secgroup-nexus` binary.
    #[serde(default)]
    pub sim: SimConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            propagation: PropagationConfig::default(),
            background_tasks: BackgroundTaskConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&file_contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid { message: message.to_owned() })
        };
        if self.propagation.worker_count == 0 {
            return invalid("propagation.worker_count must be at least 1");
        }
        if self.propagation.agent_buffer_length == 0 {
            return invalid("propagation.agent_buffer_length must be at least 1");
        }
        if self.background_tasks.finished_work_cleanup.period_secs.is_zero() {
            return invalid(
                "background_tasks.finished_work_cleanup.period_secs must be \
                nonzero",
            );
        }
        if self.background_tasks.unfinished_work_cleanup.period_secs.is_zero() {
            return invalid(
                "background_tasks.unfinished_work_cleanup.period_secs must be \
                nonzero",
            );
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// number of workers turning queued work into ruleset pushes
    pub worker_count: usize,
    /// how long a scheduling batch waits for the global work lock before it
    /// is dropped
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "global_lock_timeout_ms")]
    pub global_lock_timeout: Duration,
    /// maximum unanswered pushes per agent
    pub agent_buffer_length: usize,
    /// attempts allowed for a ruleset the agent failed to program
    pub max_programming_retries: u32,
    /// delay before retrying after a programming failure
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    /// how long to wait for an agent to answer a push
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "answer_timeout_secs")]
    pub answer_timeout: Duration,
    /// how long to wait for group and instance row locks
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "row_lock_timeout_ms")]
    pub row_lock_timeout: Duration,
}

impl Default for PropagationConfig {
    fn default() -> PropagationConfig {
        PropagationConfig {
            worker_count: 8,
            global_lock_timeout: Duration::from_millis(5000),
            agent_buffer_length: 100,
            max_programming_retries: 3,
            retry_delay: Duration::from_millis(10000),
            answer_timeout: Duration::from_secs(60),
            row_lock_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct BackgroundTaskConfig {
    pub finished_work_cleanup: FinishedWorkCleanupConfig,
    pub unfinished_work_cleanup: UnfinishedWorkCleanupConfig,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct FinishedWorkCleanupConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
    /// how long finished work items are kept
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retention_secs: Duration,
}

impl Default for FinishedWorkCleanupConfig {
    fn default() -> FinishedWorkCleanupConfig {
        FinishedWorkCleanupConfig {
            period_secs: Duration::from_secs(120),
            retention_secs: Duration::from_secs(600),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct UnfinishedWorkCleanupConfig {
    /// period (in seconds) for periodic activations of this background task
    ///
    /// Work pending for longer than twice this is rescheduled.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
}

impl Default for UnfinishedWorkCleanupConfig {
    fn default() -> UnfinishedWorkCleanupConfig {
        UnfinishedWorkCleanupConfig { period_secs: Duration::from_secs(120) }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SimConfig {
    /// number of simulated hosts, each with its own agent
    pub host_count: usize,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig { host_count: 2 }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading \"{}\": {err}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{}\": {err}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid config: {message}")]
    Invalid { message: String },
}
