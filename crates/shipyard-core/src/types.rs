use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const GROUP_SEPARATOR: &str = ".";

/// Unique identifier for a scheduled job (UUIDv7, time-sortable for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a serialization group from the subjects it covers.
///
/// Parts are sorted first so `group(&["b", "a"])` and `group(&["a", "b"])`
/// name the same group.
pub fn group<S: AsRef<str>>(parts: &[S]) -> String {
    let mut parts: Vec<&str> = parts.iter().map(AsRef::as_ref).collect();
    parts.sort_unstable();
    parts.join(GROUP_SEPARATOR)
}

/// One page of a larger result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub page: u32,
    #[serde(rename = "first_page")]
    pub is_first_page: bool,
    #[serde(rename = "last_page")]
    pub is_last_page: bool,
    pub per_page: u32,
    pub total: u64,
}

impl<T> Paginated<T> {
    /// `page` is 1-based.
    pub fn new(data: Vec<T>, page: u32, per_page: u32, total: u64) -> Self {
        let seen = u64::from(page) * u64::from(per_page);
        Self {
            data,
            page,
            is_first_page: page <= 1,
            is_last_page: seen >= total,
            per_page,
            total,
        }
    }
}
