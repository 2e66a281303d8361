use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The tag naming the logical service an inbound belongs to.
pub const SERVICE_TAG: &str = "service";

/// The tag naming the zone a workload runs in.
pub const ZONE_TAG: &str = "zone";

pub const PROTOCOL_TAG: &str = "protocol";

/// The selector value that matches any value for its key.
pub const MATCH_ALL: &str = "*";

/// A set of tags describing an inbound, a gateway, an external service, or an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

/// Selects tag sets by key, either by exact value or by the `*` wildcard.
///
/// A selector matches a tag set iff every key in the selector is present in the tag set with a
/// matching value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSelector(BTreeMap<String, String>);

/// The specificity of a selector.
///
/// Ranks compare by the number of exact keys first and by the number of wildcard keys second,
/// so `{service: web}` outranks `{service: *}`, which outranks `{}`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectorRank {
    pub exact: usize,
    pub wildcard: usize,
}

// === impl Tags ===

impl Tags {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn service(&self) -> Option<&str> {
        self.get(SERVICE_TAG)
    }

    pub fn zone(&self) -> Option<&str> {
        self.get(ZONE_TAG)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Tags {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

// === impl TagSelector ===

impl TagSelector {
    /// Builds a selector that matches a service by name.
    pub fn service(name: impl Into<String>) -> Self {
        Self(std::iter::once((SERVICE_TAG.to_string(), name.into())).collect())
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        self.0.iter().all(|(key, value)| match tags.get(key) {
            Some(actual) => value == MATCH_ALL || value == actual,
            None => false,
        })
    }

    pub fn rank(&self) -> SelectorRank {
        let wildcard = self.0.values().filter(|v| *v == MATCH_ALL).count();
        SelectorRank {
            exact: self.0.len() - wildcard,
            wildcard,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the exact service this selector targets, if any.
    pub fn service_name(&self) -> Option<&str> {
        self.get(SERVICE_TAG).filter(|s| *s != MATCH_ALL)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for TagSelector {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<&Tags> for TagSelector {
    fn from(tags: &Tags) -> Self {
        tags.iter().collect()
    }
}

impl fmt::Display for TagSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}:{v}")?;
            first = false;
        }
        f.write_str("}")
    }
}

// === impl SelectorRank ===

impl SelectorRank {
    pub fn combined_with(self, other: Self) -> Self {
        Self {
            exact: self.exact + other.exact,
            wildcard: self.wildcard + other.wildcard,
        }
    }
}
