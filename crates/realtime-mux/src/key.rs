use std::fmt;

use serde::{Deserialize, Serialize};

const ALL_ROWS: &str = "all";

/// Identity of a shared channel: one per `(table, filter)` pair.
///
/// Table and filter are kept as separate fields, so separator characters
/// inside either part can never make two different pairs compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    table: String,
    filter: String,
}

impl ChannelKey {
    pub fn new(table: &str, filter: Option<&str>) -> Self {
        Self {
            table: table.to_string(),
            filter: filter.unwrap_or(ALL_ROWS).to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The filter, or `"all"` when the channel carries every row.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.filter)
    }
}
