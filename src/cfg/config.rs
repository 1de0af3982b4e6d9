// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Everything needed to identify and open one connection (spec §3
/// "Connection"): host/port/db/auth_key/timeout plus the driver-level
/// reconnect policy.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionOpts {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Default database term merged into every query's options unless the
    /// call site overrides it (spec §4.5 `use(db)`).
    #[serde(default)]
    pub db: Option<String>,

    #[serde(default)]
    pub auth_key: String,

    #[serde(default = "default_timeout", with = "serde_secs")]
    pub timeout: Duration,

    /// If set, `run()` transparently reconnects a closed connection before
    /// dispatching (spec §9 design note: "auto-reconnect is a driver-level
    /// policy layered on top of the core, not a core responsibility").
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    28015
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Default for ConnectionOpts {
    fn default() -> Self {
        ConnectionOpts {
            host: default_host(),
            port: default_port(),
            db: None,
            auth_key: String::new(),
            timeout: default_timeout(),
            auto_reconnect: false,
        }
    }
}

impl ConnectionOpts {
    /// Loads connection options from YAML, validates them, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut opts: ConnectionOpts =
            serde_yaml::from_str(&s).context("failed to parse connection options YAML")?;
        opts.validate_and_normalize()?;
        Ok(opts)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.host.is_empty(), "host must not be empty");
        ensure!(self.port != 0, "port must be nonzero");
        if let Some(db) = &self.db {
            ensure!(!db.is_empty(), "db, if set, must not be empty");
        }
        ensure!(!self.timeout.is_zero(), "timeout must be greater than zero");
        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
