//! Explanation of a filter-list block.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One blocked key and the lists it was found in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMatch {
    /// The observed key: a domain, IP, AS number or country code.
    pub entity: String,

    /// Lists that are enforced and contain the key.
    pub active_lists: Vec<String>,

    /// Lists that contain the key but are not enforced.
    pub inactive_lists: Vec<String>,
}

impl fmt::Display for ListMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in activated filter lists {}",
            self.entity,
            self.active_lists.join(",")
        )?;
        if !self.inactive_lists.is_empty() {
            write!(f, " (also in {})", self.inactive_lists.join(","))?;
        }
        Ok(())
    }
}

/// Why an entity was blocked by filter lists, one entry per blocked key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListBlockReason(pub Vec<ListMatch>);

impl ListBlockReason {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListMatch> {
        self.0.iter()
    }

    /// Every distinct active list across all matches.
    pub fn active_lists(&self) -> Vec<String> {
        let all = self
            .0
            .iter()
            .flat_map(|m| m.active_lists.iter().cloned())
            .collect();
        super::domain::make_distinct(all)
    }

    /// Per-key descriptions for UI layers.
    pub fn contexts(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for ListBlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [only] => write!(f, "{}", only),
            [first, rest @ ..] => write!(f, "{} and {} more", first, rest.len()),
        }
    }
}
