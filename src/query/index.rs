//! Index contract consumed by the planner.
//!
//! Concrete index structures live outside this crate; the planner only calls
//! through [`Index`]. Keys are ordered tuples of [`Value`]s, one component per
//! declared field. Single-field indexes use one-element keys.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use smallvec::SmallVec;

use crate::query::value::Value;
use crate::types::{Result, Rid};

/// Composite key parameters. Most keys have at most a handful of components.
pub type KeyParams = SmallVec<[Value; 4]>;

/// Index algorithm and uniqueness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Ordered tree, unique keys.
    Unique,
    /// Ordered tree, duplicate keys allowed.
    NotUnique,
    /// Hash table, unique keys.
    UniqueHash,
    /// Hash table, duplicate keys allowed.
    NotUniqueHash,
    /// Full-text word index.
    Fulltext,
    /// Dictionary (last write wins).
    Dictionary,
    /// Hash-backed dictionary.
    DictionaryHash,
    /// Geospatial index.
    Spatial,
    /// Virtual view over other indexes.
    Proxy,
}

impl IndexKind {
    /// True for hash-backed unique and non-unique indexes.
    pub fn is_hash(&self) -> bool {
        matches!(self, IndexKind::UniqueHash | IndexKind::NotUniqueHash)
    }

    /// True for ordered unique and non-unique tree indexes.
    pub fn is_tree(&self) -> bool {
        matches!(self, IndexKind::Unique | IndexKind::NotUnique)
    }

    /// Implementation family, used to avoid proposing two indexes of the same kind.
    pub fn family(&self) -> IndexFamily {
        match self {
            IndexKind::Unique | IndexKind::NotUnique => IndexFamily::Tree,
            IndexKind::UniqueHash | IndexKind::NotUniqueHash => IndexFamily::Hash,
            IndexKind::Fulltext => IndexFamily::Fulltext,
            IndexKind::Dictionary => IndexFamily::Dictionary,
            IndexKind::DictionaryHash => IndexFamily::DictionaryHash,
            IndexKind::Spatial => IndexFamily::Spatial,
            IndexKind::Proxy => IndexFamily::Proxy,
        }
    }

    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Unique => "UNIQUE",
            IndexKind::NotUnique => "NOTUNIQUE",
            IndexKind::UniqueHash => "UNIQUE_HASH_INDEX",
            IndexKind::NotUniqueHash => "NOTUNIQUE_HASH_INDEX",
            IndexKind::Fulltext => "FULLTEXT",
            IndexKind::Dictionary => "DICTIONARY",
            IndexKind::DictionaryHash => "DICTIONARY_HASH_INDEX",
            IndexKind::Spatial => "SPATIAL",
            IndexKind::Proxy => "PROXY",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage implementation family of an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexFamily {
    /// Ordered tree.
    Tree,
    /// Hash table.
    Hash,
    /// Full-text.
    Fulltext,
    /// Dictionary.
    Dictionary,
    /// Hash dictionary.
    DictionaryHash,
    /// Spatial.
    Spatial,
    /// Virtual.
    Proxy,
}

/// Which part of a map-valued field an index stores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MapIndexBy {
    /// Map keys (serves `CONTAINSKEY`).
    #[default]
    Key,
    /// Map values (serves `CONTAINSVALUE`).
    Value,
}

/// Declared shape of an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Class the index is declared on; it also covers subclass records.
    pub class: String,
    /// Indexed fields in key order.
    pub fields: Vec<String>,
    /// Whether records whose key contains null are left out.
    pub ignore_nulls: bool,
    /// Map field indexing mode.
    pub map_by: MapIndexBy,
}

impl IndexDefinition {
    /// Definition over `fields` of `class` that keeps null keys.
    pub fn new<I, S>(class: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            class: class.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            ignore_nulls: false,
            map_by: MapIndexBy::Key,
        }
    }

    /// Sets the null handling flag.
    pub fn ignoring_nulls(mut self, ignore: bool) -> Self {
        self.ignore_nulls = ignore;
        self
    }

    /// Sets the map indexing mode.
    pub fn by(mut self, map_by: MapIndexBy) -> Self {
        self.map_by = map_by;
        self
    }

    /// Number of key components.
    pub fn param_count(&self) -> usize {
        self.fields.len()
    }

    /// True when the key has two or more components.
    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }
}

/// Lookup request understood by every index.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexQuery {
    /// Entries whose leading key components equal the given prefix.
    Exact(KeyParams),
    /// Union of several exact prefixes, visited in key order.
    In(Vec<KeyParams>),
    /// Entries matching `prefix` whose next component lies within the bounds.
    Range {
        /// Equality prefix.
        prefix: KeyParams,
        /// Lower bound on the component after the prefix.
        lower: Bound<Value>,
        /// Upper bound on the component after the prefix.
        upper: Bound<Value>,
    },
    /// Entries whose key lies within the bounds, comparing only as many
    /// leading components as each bound carries.
    KeyRange {
        /// Lower key bound.
        lower: Bound<KeyParams>,
        /// Upper key bound.
        upper: Bound<KeyParams>,
    },
}

/// Compares the leading components of `key` with a possibly shorter `bound`.
/// `None` when a compared component is null.
pub fn compare_key_prefix(key: &[Value], bound: &[Value]) -> Option<Ordering> {
    let len = key.len().min(bound.len());
    let (key, bound) = (&key[..len], &bound[..len]);
    if key.iter().chain(bound).any(Value::is_null) {
        return None;
    }
    Some(key.cmp(bound))
}

/// True when `key` satisfies both bounds under [`compare_key_prefix`].
pub fn key_within(key: &[Value], lower: &Bound<KeyParams>, upper: &Bound<KeyParams>) -> bool {
    let above = match lower {
        Bound::Included(bound) => compare_key_prefix(key, bound).is_some_and(Ordering::is_ge),
        Bound::Excluded(bound) => compare_key_prefix(key, bound).is_some_and(Ordering::is_gt),
        Bound::Unbounded => !key.iter().all(Value::is_null),
    };
    let below = match upper {
        Bound::Included(bound) => compare_key_prefix(key, bound).is_some_and(Ordering::is_le),
        Bound::Excluded(bound) => compare_key_prefix(key, bound).is_some_and(Ordering::is_lt),
        Bound::Unbounded => !key.iter().all(Value::is_null),
    };
    above && below
}

impl fmt::Display for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn key(f: &mut fmt::Formatter<'_>, params: &[Value]) -> fmt::Result {
            write!(f, "[")?;
            for (i, value) in params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{value}")?;
            }
            write!(f, "]")
        }
        match self {
            IndexQuery::Exact(params) => {
                write!(f, "= ")?;
                key(f, params)
            }
            IndexQuery::In(keys) => {
                write!(f, "IN ")?;
                for (i, params) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    key(f, params)?;
                }
                Ok(())
            }
            IndexQuery::Range {
                prefix,
                lower,
                upper,
            } => {
                key(f, prefix)?;
                match lower {
                    Bound::Included(v) => write!(f, " [{v}")?,
                    Bound::Excluded(v) => write!(f, " ({v}")?,
                    Bound::Unbounded => write!(f, " (-inf")?,
                }
                match upper {
                    Bound::Included(v) => write!(f, "..{v}]"),
                    Bound::Excluded(v) => write!(f, "..{v})"),
                    Bound::Unbounded => write!(f, "..+inf)"),
                }
            }
            IndexQuery::KeyRange { lower, upper } => {
                match lower {
                    Bound::Included(params) => {
                        write!(f, ">= ")?;
                        key(f, params)?;
                    }
                    Bound::Excluded(params) => {
                        write!(f, "> ")?;
                        key(f, params)?;
                    }
                    Bound::Unbounded => write!(f, "> -inf")?,
                }
                match upper {
                    Bound::Included(params) => {
                        write!(f, " <= ")?;
                        key(f, params)
                    }
                    Bound::Excluded(params) => {
                        write!(f, " < ")?;
                        key(f, params)
                    }
                    Bound::Unbounded => write!(f, " < +inf"),
                }
            }
        }
    }
}

/// One key/RID pair.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    /// Full key of the entry.
    pub key: KeyParams,
    /// Indexed record.
    pub rid: Rid,
}

/// Stream of index entries.
pub type IndexCursor<'a> = Box<dyn Iterator<Item = Result<IndexEntry>> + 'a>;

/// Opaque index handle.
pub trait Index: Send + Sync {
    /// Index name, unique within the catalog.
    fn name(&self) -> &str;
    /// Algorithm and uniqueness.
    fn kind(&self) -> IndexKind;
    /// Declared fields and flags.
    fn definition(&self) -> &IndexDefinition;
    /// Whether full streams come back in key order.
    fn supports_ordered_iteration(&self) -> bool;
    /// Looks up entries, in ascending or descending key order when supported.
    fn query(&self, query: &IndexQuery, ascending: bool) -> Result<IndexCursor<'_>>;
    /// Streams every non-null entry.
    fn stream(&self, ascending: bool) -> Result<IndexCursor<'_>>;
    /// Streams entries stored under the null key.
    fn null_entries(&self) -> Result<IndexCursor<'_>>;
    /// Number of entries, nulls included.
    fn size(&self) -> Result<u64>;

    /// Whether keys are unique.
    fn is_unique(&self) -> bool {
        matches!(self.kind(), IndexKind::Unique | IndexKind::UniqueHash)
    }

    /// Converts a record reached on a neighbouring hop into this index's key type.
    fn coerce_key(&self, rid: Rid) -> Value {
        Value::Link(rid)
    }

    /// Adds an entry.
    fn put(&self, key: KeyParams, rid: Rid) -> Result<()>;
    /// Removes an entry.
    fn remove(&self, key: &[Value], rid: Rid) -> Result<bool>;
    /// Drops every entry.
    fn clear(&self) -> Result<()>;
    /// Rebuilds the index from its source data; returns the entry count.
    fn rebuild(&self) -> Result<u64>;
}

impl fmt::Debug for dyn Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("fields", &self.definition().fields)
            .finish()
    }
}

/// Drains a cursor into its RIDs.
pub fn collect_rids(cursor: IndexCursor<'_>) -> Result<Vec<Rid>> {
    cursor.map(|entry| entry.map(|e| e.rid)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn range_queries_render_their_bounds() {
        let query = IndexQuery::Range {
            prefix: smallvec![Value::from("Doe")],
            lower: Bound::Excluded(Value::Int(30)),
            upper: Bound::Unbounded,
        };
        assert_eq!(query.to_string(), "['Doe'] (30..+inf)");
    }

    #[test]
    fn key_bounds_compare_only_their_own_length() {
        let key: KeyParams = smallvec![Value::from("b"), Value::Int(2)];
        let short: KeyParams = smallvec![Value::from("b")];
        let full: KeyParams = smallvec![Value::from("b"), Value::Int(3)];
        assert_eq!(compare_key_prefix(&key, &short), Some(Ordering::Equal));
        assert_eq!(compare_key_prefix(&key, &full), Some(Ordering::Less));
        assert!(key_within(&key, &Bound::Included(short.clone()), &Bound::Unbounded));
        assert!(!key_within(&key, &Bound::Excluded(short), &Bound::Unbounded));
        assert!(key_within(&key, &Bound::Unbounded, &Bound::Excluded(full)));

        let partial: KeyParams = smallvec![Value::Null, Value::Int(2)];
        let lower: KeyParams = smallvec![Value::from("a")];
        assert!(!key_within(&partial, &Bound::Unbounded, &Bound::Included(lower)));
        let query = IndexQuery::KeyRange {
            lower: Bound::Included(smallvec![Value::from("b"), Value::Int(2)]),
            upper: Bound::Unbounded,
        };
        assert_eq!(query.to_string(), ">= ['b', 2] < +inf");
    }

    #[test]
    fn kinds_group_into_families() {
        assert_eq!(IndexKind::UniqueHash.family(), IndexKind::NotUniqueHash.family());
        assert_ne!(IndexKind::Unique.family(), IndexKind::UniqueHash.family());
        assert!(IndexKind::NotUnique.is_tree());
        assert!(!IndexKind::Dictionary.is_hash());
    }
}
