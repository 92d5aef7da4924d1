//! Collection-level write settings.
//!
//! # Environment
//! - `DOCKET_ASSIGN_ID_ON_INSERT`: `true`/`false` (default `true`)
//! - `DOCKET_WRITE_CONCERN`: `majority`, a node count, or a tag set name
//! - `DOCKET_JOURNAL`: `true`/`false`
//! - `DOCKET_MAX_BATCH_COUNT`: statements per server command (default 100000)

use std::str::FromStr;

use docket_common::{DocketError, Result};
use mongodb::options::{Acknowledgment, WriteConcern};
use serde::{Deserialize, Serialize};

/// Default number of statements per insert/update/delete command
pub const DEFAULT_MAX_BATCH_COUNT: usize = 100_000;

/// Settings applied to every write against one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Generate ids for inserted documents that have none (default: true)
    pub assign_id_on_insert: bool,
    /// Write concern sent with every batch (default: server default, acknowledged)
    pub write_concern: WriteConcern,
    /// Maximum statements per server command (default: 100000)
    pub max_batch_count: usize,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            assign_id_on_insert: true,
            write_concern: WriteConcern::default(),
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
        }
    }
}

impl CollectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from `DOCKET_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(value) = std::env::var("DOCKET_ASSIGN_ID_ON_INSERT") {
            settings.assign_id_on_insert = parse_flag("DOCKET_ASSIGN_ID_ON_INSERT", &value)?;
        }
        if let Ok(value) = std::env::var("DOCKET_WRITE_CONCERN") {
            settings.write_concern.w = Some(parse_acknowledgment(&value));
        }
        if let Ok(value) = std::env::var("DOCKET_JOURNAL") {
            settings.write_concern.journal = Some(parse_flag("DOCKET_JOURNAL", &value)?);
        }
        if let Ok(value) = std::env::var("DOCKET_MAX_BATCH_COUNT") {
            let count = usize::from_str(value.trim()).map_err(|e| {
                DocketError::Configuration(format!(
                    "Invalid DOCKET_MAX_BATCH_COUNT '{}': {}",
                    value, e
                ))
            })?;
            settings = settings.max_batch_count(count);
        }

        Ok(settings)
    }

    pub fn assign_id_on_insert(mut self, assign: bool) -> Self {
        self.assign_id_on_insert = assign;
        self
    }

    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    /// Set the per-command statement limit (minimum 1)
    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = count.max(1);
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        is_acknowledged(&self.write_concern)
    }
}

/// `w: 0` without journaling is the only unacknowledged write concern
pub fn is_acknowledged(write_concern: &WriteConcern) -> bool {
    let unacknowledged = matches!(write_concern.w, Some(Acknowledgment::Nodes(0)))
        && write_concern.journal != Some(true);
    !unacknowledged
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(DocketError::Configuration(format!(
            "Invalid {} '{}': expected true or false",
            name, other
        ))),
    }
}

fn parse_acknowledgment(value: &str) -> Acknowledgment {
    let value = value.trim();
    if value.eq_ignore_ascii_case("majority") {
        return Acknowledgment::Majority;
    }
    match u32::from_str(value) {
        Ok(nodes) => Acknowledgment::Nodes(nodes),
        Err(_) => Acknowledgment::Custom(value.to_string()),
    }
}
