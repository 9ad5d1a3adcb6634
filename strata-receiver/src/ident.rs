use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// The tag holding the metric name.
pub const NAME_TAG: &str = "name";

/// The identity of a metric: a set of string tags.
///
/// Tags are kept sorted by key, so equality, hashing and display are independent of the order in
/// which they were inserted. An identity without any tags is considered malformed.
///
/// ```
/// use strata_receiver::Ident;
///
/// let ident = Ident::named("cpu.load").with_tag("host", "a");
/// assert_eq!(ident.to_string(), "host=a,name=cpu.load");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ident(BTreeMap<String, String>);

impl Ident {
    /// Creates an empty identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an identity with only the [`NAME_TAG`] set.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new().with_tag(NAME_TAG, name)
    }

    /// Adds a tag, replacing a previous value for the same key.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a tag and returns the previous value of this key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Returns the value of a tag.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the metric name, if the identity has one.
    pub fn name(&self) -> Option<&str> {
        self.get(NAME_TAG)
    }

    /// Returns the number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the identity carries no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over tags in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Returns a stable 64-bit hash of the identity.
    ///
    /// The hash does not depend on process state, so it can be used to assign identities to
    /// workers and cluster nodes consistently across restarts.
    pub fn hash64(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Maps the identity to one of `shards` partitions.
    pub fn shard(&self, shards: usize) -> usize {
        (self.hash64() % shards.max(1) as u64) as usize
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for Ident
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for Ident {
    fn from(tags: BTreeMap<String, String>) -> Self {
        Self(tags)
    }
}

impl<'a> IntoIterator for &'a Ident {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent() {
        let a: Ident = [("name", "foo"), ("host", "a")].into_iter().collect();
        let b: Ident = [("host", "a"), ("name", "foo")].into_iter().collect();

        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
        assert_eq!(a.to_string(), "host=a,name=foo");
    }

    #[test]
    fn test_hash_is_stable() {
        let ident = Ident::named("stats.foo");
        assert_eq!(ident.hash64(), Ident::named("stats.foo").hash64());
        assert_ne!(ident.hash64(), Ident::named("stats.bar").hash64());
    }

    #[test]
    fn test_shard_in_range() {
        for index in 0..100 {
            let ident = Ident::named(format!("metric.{index}"));
            assert!(ident.shard(4) < 4);
            assert_eq!(ident.shard(4), ident.shard(4));
        }
        assert_eq!(Ident::named("x").shard(0), 0);
    }

    #[test]
    fn test_serde_plain_object() {
        let ident = Ident::named("foo").with_tag("dc", "eu");
        let json = serde_json::to_string(&ident).unwrap();
        assert_eq!(json, r#"{"dc":"eu","name":"foo"}"#);

        let parsed: Ident = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ident);
        assert_eq!(parsed.name(), Some("foo"));
    }
}
