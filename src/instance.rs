use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A cloud instance snapshotted at some point during the run. Tags are kept
/// as an ordered map so iteration order is deterministic in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub launch_time: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, launch_time: DateTime<Utc>, tags: BTreeMap<String, String>) -> Self {
        Instance {
            id: id.into(),
            launch_time,
            tags,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }
}

/// A named filter as the cloud's paged-list API expects it: a key plus one
/// or more acceptable values, AND-ed together with every other filter in the
/// request.
#[derive(Debug, Clone)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Filter {
            name: name.into(),
            values: vec![value.into()],
        }
    }

    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Filter::new(format!("tag:{key}"), value)
    }
}
