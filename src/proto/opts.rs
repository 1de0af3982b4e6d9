// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-query option handling (spec §3 "PerTokenOpts", §6 "Per-query
//! recognized options").

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DriverError, Result};

/// `raw` or `native` — the two accepted values for `time_format`,
/// `group_format`, and `binary_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPref {
    Raw,
    Native,
}

impl FormatPref {
    fn parse(value: &Value, key: &str) -> Result<Self> {
        match value.as_str() {
            Some("raw") => Ok(FormatPref::Raw),
            Some("native") => Ok(FormatPref::Native),
            _ => Err(DriverError::argument(format!(
                "{key} must be \"raw\" or \"native\", got {value}"
            ))),
        }
    }
}

/// The request-time option map, retained per token so the response can be
/// shaped according to the preferences supplied at dispatch time.
#[derive(Debug, Clone, Default)]
pub struct PerTokenOpts {
    pub noreply: bool,
    pub db: Option<Value>,
    pub time_format: Option<FormatPref>,
    pub group_format: Option<FormatPref>,
    pub binary_format: Option<FormatPref>,
    pub include_states: bool,
    /// Anything else passed through verbatim to the server.
    pub extra: Map<String, Value>,
}

impl PerTokenOpts {
    /// Merge driver-level defaults with call-site options (spec §4.5 step
    /// 3), validating the recognized keys along the way.
    pub fn merge(defaults: &Map<String, Value>, call_site: &Map<String, Value>) -> Result<Self> {
        let mut merged = defaults.clone();
        for (k, v) in call_site {
            merged.insert(k.clone(), v.clone());
        }

        let mut opts = PerTokenOpts::default();
        for (key, value) in merged {
            match key.as_str() {
                "noreply" => {
                    opts.noreply = value.as_bool().ok_or_else(|| {
                        DriverError::argument("noreply must be a boolean")
                    })?;
                },
                "db" => opts.db = Some(value),
                "time_format" => opts.time_format = Some(FormatPref::parse(&value, "time_format")?),
                "group_format" => {
                    opts.group_format = Some(FormatPref::parse(&value, "group_format")?)
                },
                "binary_format" => {
                    opts.binary_format = Some(FormatPref::parse(&value, "binary_format")?)
                },
                "include_states" => {
                    opts.include_states = value.as_bool().unwrap_or(false);
                },
                _ => {
                    opts.extra.insert(key, value);
                },
            }
        }

        Ok(opts)
    }

    /// Render back into the JSON object sent as the third element of the
    /// request payload triple.
    pub fn to_json(&self) -> Value {
        let mut map = self.extra.clone();
        if self.noreply {
            map.insert("noreply".into(), Value::Bool(true));
        }
        if let Some(db) = &self.db {
            map.insert("db".into(), db.clone());
        }
        if let Some(f) = self.time_format {
            map.insert("time_format".into(), format_pref_json(f));
        }
        if let Some(f) = self.group_format {
            map.insert("group_format".into(), format_pref_json(f));
        }
        if let Some(f) = self.binary_format {
            map.insert("binary_format".into(), format_pref_json(f));
        }
        if self.include_states {
            map.insert("include_states".into(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

fn format_pref_json(f: FormatPref) -> Value {
    Value::String(
        match f {
            FormatPref::Raw => "raw",
            FormatPref::Native => "native",
        }
        .to_string(),
    )
}
