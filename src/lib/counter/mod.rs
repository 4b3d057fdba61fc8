pub mod manager;

use serde::{Deserialize, Serialize};

use crate::source::SourceId;

pub use manager::CounterManager;

/// What a query or an administrative operation applies to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Source(SourceId),
    Global,
}

impl Scope {
    /// `"all"` is how dashboards ask for every source at once.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "all" => Scope::Global,
            id => Scope::Source(id.to_string()),
        }
    }
}
