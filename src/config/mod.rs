//! Leader configuration.
//!
//! Recognized options, their defaults, and validation. Values can come from
//! a TOML file, environment overrides (`ZAB__*`), or be built in code for
//! tests.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone)]
pub struct LeaderConfig {
    /// Base tick in milliseconds. All protocol deadlines are multiples of
    /// this value.
    #[serde(default = "default_tick_time_ms")]
    pub tick_time_ms: u64,

    /// Ticks a learner may take to connect and sync with the leader.
    #[serde(default = "default_init_limit")]
    pub init_limit: u64,

    /// Ticks a synced learner may fall behind before its session is dropped.
    #[serde(default = "default_sync_limit")]
    pub sync_limit: u64,

    /// Permit dynamic `reconfig` proposals.
    #[serde(default)]
    pub reconfig_enabled: bool,

    /// TCP_NODELAY on learner sockets.
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// Log the ack round-trip of every Nth zxid; 0 disables sampling.
    #[serde(default = "default_ack_logging_frequency")]
    pub ack_logging_frequency: u64,

    /// Upper bound in milliseconds on how long the epoch barrier waits once
    /// a tracked voter is known to have returned to election. Negative
    /// disables the fast-fail.
    #[serde(default = "default_max_time_to_wait_for_epoch_ms")]
    pub max_time_to_wait_for_epoch_ms: i64,

    /// Whether the leader also accepts client sessions.
    #[serde(default = "default_true")]
    pub leader_serves: bool,

    /// Bind the learner acceptor on the wildcard address instead of the
    /// configured quorum addresses.
    #[serde(default)]
    pub listen_on_all_ips: bool,

    /// QA only: force the low 32 bits of the first minted zxid so counter
    /// rollover can be exercised without four billion writes.
    #[serde(default)]
    pub testing_initial_zxid: Option<u32>,
}

impl Debug for LeaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderConfig")
            .field("tick_time_ms", &self.tick_time_ms)
            .field("init_limit", &self.init_limit)
            .field("sync_limit", &self.sync_limit)
            .field("reconfig_enabled", &self.reconfig_enabled)
            .finish()
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            tick_time_ms: default_tick_time_ms(),
            init_limit: default_init_limit(),
            sync_limit: default_sync_limit(),
            reconfig_enabled: false,
            nodelay: default_true(),
            ack_logging_frequency: default_ack_logging_frequency(),
            max_time_to_wait_for_epoch_ms: default_max_time_to_wait_for_epoch_ms(),
            leader_serves: default_true(),
            listen_on_all_ips: false,
            testing_initial_zxid: None,
        }
    }
}

impl LeaderConfig {
    /// Load from an optional TOML file with `ZAB__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("ZAB").separator("__"));
        let cfg: LeaderConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_time_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "tick_time_ms must be greater than 0".into(),
            )));
        }
        if self.init_limit == 0 {
            return Err(Error::Config(ConfigError::Message(
                "init_limit must be greater than 0".into(),
            )));
        }
        if self.sync_limit == 0 {
            return Err(Error::Config(ConfigError::Message(
                "sync_limit must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn tick_time(&self) -> Duration {
        Duration::from_millis(self.tick_time_ms)
    }

    /// Deadline for the discovery/sync phases: `init_limit × tick_time`.
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_time_ms * self.init_limit)
    }

    /// Deadline for a serving learner: `sync_limit × tick_time`.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_time_ms * self.sync_limit)
    }

    pub fn max_epoch_wait(&self) -> Option<Duration> {
        u64::try_from(self.max_time_to_wait_for_epoch_ms)
            .ok()
            .map(Duration::from_millis)
    }
}

fn default_tick_time_ms() -> u64 {
    2000
}

fn default_init_limit() -> u64 {
    10
}

fn default_sync_limit() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_ack_logging_frequency() -> u64 {
    1000
}

fn default_max_time_to_wait_for_epoch_ms() -> i64 {
    -1
}

#[cfg(test)]
mod config_test;
