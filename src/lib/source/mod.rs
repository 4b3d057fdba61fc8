use serde::{Deserialize, Serialize};

pub type SourceId = String;

/// A camera source as configured outside of the counter. The id is immutable.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_of: Option<SourceId>,
}

impl Source {
    pub fn new(id: impl Into<String>, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            mirror_of: None,
        }
    }

    pub fn mirroring(mut self, original: impl Into<String>) -> Self {
        self.mirror_of = Some(original.into());
        self
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror_of.is_some()
    }
}
