//! Read-only index view over a multi-hop field chain.
//!
//! For `address.city.name = 'Rome'` on `Person` the proxy holds one index per
//! hop: `Person.address`, `Address.city`, and `City.name`. A lookup probes
//! the last index with the caller's key and walks the chain back to the
//! first hop, turning each hop's matches into keys for the previous one.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::smallvec;
use tracing::{debug, trace};

use crate::query::condition::FieldChain;
use crate::query::errors::QueryError;
use crate::query::index::{
    collect_rids, Index, IndexCursor, IndexDefinition, IndexEntry, IndexKind, IndexQuery,
    KeyParams,
};
use crate::query::metadata::{IndexCatalog, SchemaCatalog};
use crate::query::value::Value;
use crate::types::{Result, Rid, SombraError};

/// Rank of an index as an intermediate (base) hop. Higher wins; values
/// `<= 0` mean unusable.
pub fn priority_of_usage(index: Option<&dyn Index>) -> i32 {
    let Some(index) = index else {
        return -1;
    };
    let definition = index.definition();
    if definition.is_composite() && definition.ignore_nulls {
        return -1;
    }
    let mut priority = 1;
    if !definition.is_composite() {
        priority += 10;
    }
    match index.kind() {
        IndexKind::UniqueHash | IndexKind::NotUniqueHash => {
            if definition.is_composite() {
                return -1;
            }
            priority += 10;
        }
        IndexKind::Unique | IndexKind::NotUnique => priority += 5,
        IndexKind::Proxy
        | IndexKind::Fulltext
        | IndexKind::Dictionary
        | IndexKind::DictionaryHash
        | IndexKind::Spatial => return -1,
    }
    priority
}

/// Whether an index can serve an intermediate hop.
pub fn is_appropriate_as_base(index: &dyn Index) -> bool {
    priority_of_usage(Some(index)) > 0
}

fn find_best_index(candidates: Vec<Arc<dyn Index>>) -> Option<Arc<dyn Index>> {
    let mut best: Option<(i32, Arc<dyn Index>)> = None;
    for index in candidates {
        let priority = priority_of_usage(Some(index.as_ref()));
        if priority <= 0 {
            continue;
        }
        if best.as_ref().map_or(true, |(current, _)| priority > *current) {
            best = Some((priority, index));
        }
    }
    best.map(|(_, index)| index)
}

/// Virtual index answering lookups on a field chain.
pub struct ChainedIndexProxy {
    name: String,
    index_chain: Vec<Arc<dyn Index>>,
    definition: IndexDefinition,
}

impl ChainedIndexProxy {
    /// Wraps an explicit per-hop index list, first hop first.
    pub fn new(index_chain: Vec<Arc<dyn Index>>) -> Result<Self> {
        if index_chain.len() < 2 {
            let chain = index_chain
                .iter()
                .map(|i| i.name().to_owned())
                .collect::<Vec<_>>()
                .join(".");
            return Err(QueryError::ChainTooShort { chain }.into());
        }
        let first = &index_chain[0];
        let last = &index_chain[index_chain.len() - 1];
        let definition = IndexDefinition {
            class: first.definition().class.clone(),
            fields: last.definition().fields.clone(),
            ignore_nulls: last.definition().ignore_nulls,
            map_by: last.definition().map_by,
        };
        let name = format!(
            "IndexChain{{{}}}",
            index_chain
                .iter()
                .map(|i| i.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self {
            name,
            index_chain,
            definition,
        })
    }

    /// Builds one proxy per distinct index family available on the chain's
    /// last property. Returns nothing when some intermediate hop has no
    /// eligible base index.
    pub fn create_proxies(
        schema: &dyn SchemaCatalog,
        indexes: &dyn IndexCatalog,
        class: &str,
        chain: &FieldChain,
    ) -> Vec<ChainedIndexProxy> {
        if !chain.is_long() {
            return Vec::new();
        }
        let Some((base, last_class)) = prepare_base_indexes(schema, indexes, class, chain) else {
            debug!(class, chain = %chain, "no base index for chain hop");
            return Vec::new();
        };
        let mut proxies = Vec::new();
        for last in prepare_last_index_variants(indexes, &last_class, chain.last()) {
            let mut hops = base.clone();
            hops.push(last);
            match ChainedIndexProxy::new(hops) {
                Ok(proxy) => proxies.push(proxy),
                Err(err) => debug!(error = %err, "skipping chained index variant"),
            }
        }
        proxies
    }

    /// Index used for the first hop.
    pub fn first_index(&self) -> &Arc<dyn Index> {
        &self.index_chain[0]
    }

    /// Index probed with the caller's key.
    pub fn last_index(&self) -> &Arc<dyn Index> {
        &self.index_chain[self.index_chain.len() - 1]
    }

    /// Every hop, first hop first.
    pub fn index_chain(&self) -> &[Arc<dyn Index>] {
        &self.index_chain
    }

    fn apply_tail_indexes(&self, last_rids: Vec<Rid>) -> Result<Vec<IndexEntry>> {
        let n = self.index_chain.len();
        let mut keys = prepare_keys(self.index_chain[n - 2].as_ref(), &last_rids);
        for hop in (1..=n - 2).rev() {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let index = self.index_chain[hop].as_ref();
            let rids = collect_rids(lookup(index, &keys)?)?;
            trace!(index = index.name(), keys = keys.len(), matches = rids.len(), "chain hop");
            keys = prepare_keys(self.index_chain[hop - 1].as_ref(), &rids);
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for entry in lookup(self.first_index().as_ref(), &keys)? {
            let entry = entry?;
            if seen.insert(entry.rid) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn unsupported(&self, operation: &'static str) -> SombraError {
        SombraError::UnsupportedForView {
            view: self.name.clone(),
            operation,
        }
    }
}

fn prepare_base_indexes(
    schema: &dyn SchemaCatalog,
    indexes: &dyn IndexCatalog,
    class: &str,
    chain: &FieldChain,
) -> Option<(Vec<Arc<dyn Index>>, String)> {
    let mut hops = Vec::with_capacity(chain.item_count());
    let mut current = class.to_owned();
    for item in &chain.items()[..chain.item_count() - 1] {
        let best = find_best_index(indexes.indexes_for_property(&current, item))?;
        hops.push(best);
        current = schema.linked_class(&current, item)?;
    }
    Some((hops, current))
}

fn prepare_last_index_variants(
    indexes: &dyn IndexCatalog,
    class: &str,
    property: &str,
) -> Vec<Arc<dyn Index>> {
    let mut candidates = indexes.indexes_for_property(class, property);
    candidates.sort_by_key(|index| index.definition().param_count());
    let mut families = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|index| families.insert(index.kind().family()))
        .collect()
}

fn prepare_keys(index: &dyn Index, rids: &[Rid]) -> BTreeSet<Value> {
    rids.iter().map(|rid| index.coerce_key(*rid)).collect()
}

fn lookup<'a>(index: &'a dyn Index, keys: &BTreeSet<Value>) -> Result<IndexCursor<'a>> {
    if index.definition().is_composite() {
        let mut entries = Vec::new();
        for key in keys {
            let params: KeyParams = smallvec![key.clone()];
            for entry in index.query(&IndexQuery::Exact(params), true)? {
                entries.push(entry?);
            }
        }
        Ok(Box::new(entries.into_iter().map(Ok)))
    } else {
        let params = keys.iter().map(|key| smallvec![key.clone()]).collect();
        index.query(&IndexQuery::In(params), true)
    }
}

impl Index for ChainedIndexProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Proxy
    }

    fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    fn supports_ordered_iteration(&self) -> bool {
        false
    }

    fn is_unique(&self) -> bool {
        self.first_index().is_unique()
    }

    fn query(&self, query: &IndexQuery, _ascending: bool) -> Result<IndexCursor<'_>> {
        let last_rids = collect_rids(self.last_index().query(query, true)?)?;
        let entries = self.apply_tail_indexes(last_rids)?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn stream(&self, _ascending: bool) -> Result<IndexCursor<'_>> {
        Err(self.unsupported("stream"))
    }

    fn null_entries(&self) -> Result<IndexCursor<'_>> {
        let last_rids = collect_rids(self.last_index().null_entries()?)?;
        let entries = self.apply_tail_indexes(last_rids)?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn size(&self) -> Result<u64> {
        Err(self.unsupported("size"))
    }

    fn put(&self, _key: KeyParams, _rid: Rid) -> Result<()> {
        Err(self.unsupported("put"))
    }

    fn remove(&self, _key: &[Value], _rid: Rid) -> Result<bool> {
        Err(self.unsupported("remove"))
    }

    fn clear(&self) -> Result<()> {
        Err(self.unsupported("clear"))
    }

    fn rebuild(&self) -> Result<u64> {
        Err(self.unsupported("rebuild"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::memory::MemoryDatabase;

    fn chain_db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_class("City", None).unwrap();
        db.create_class("Address", None).unwrap();
        db.create_class("Person", None).unwrap();
        db.link_property("Person", "address", "Address").unwrap();
        db.link_property("Address", "city", "City").unwrap();
        db.create_index("City.name", IndexKind::NotUnique, IndexDefinition::new("City", ["name"]))
            .unwrap();
        db.create_index(
            "Address.city",
            IndexKind::NotUniqueHash,
            IndexDefinition::new("Address", ["city"]),
        )
        .unwrap();
        db.create_index(
            "Person.address",
            IndexKind::NotUnique,
            IndexDefinition::new("Person", ["address"]),
        )
        .unwrap();
        db
    }

    #[test]
    fn priorities_rank_hash_over_tree_over_composite() {
        let db = MemoryDatabase::new();
        db.create_class("T", None).unwrap();
        let hash = db
            .create_index("h", IndexKind::UniqueHash, IndexDefinition::new("T", ["a"]))
            .unwrap();
        let tree = db
            .create_index("t", IndexKind::NotUnique, IndexDefinition::new("T", ["a"]))
            .unwrap();
        let composite = db
            .create_index("c", IndexKind::Unique, IndexDefinition::new("T", ["a", "b"]))
            .unwrap();
        let composite_nulls = db
            .create_index(
                "cn",
                IndexKind::Unique,
                IndexDefinition::new("T", ["a", "b"]).ignoring_nulls(true),
            )
            .unwrap();
        let composite_hash = db
            .create_index("ch", IndexKind::UniqueHash, IndexDefinition::new("T", ["a", "b"]))
            .unwrap();
        let fulltext = db
            .create_index("ft", IndexKind::Fulltext, IndexDefinition::new("T", ["a"]))
            .unwrap();
        assert_eq!(priority_of_usage(Some(hash.as_ref())), 21);
        assert_eq!(priority_of_usage(Some(tree.as_ref())), 16);
        assert_eq!(priority_of_usage(Some(composite.as_ref())), 6);
        assert_eq!(priority_of_usage(Some(composite_nulls.as_ref())), -1);
        assert_eq!(priority_of_usage(Some(composite_hash.as_ref())), -1);
        assert_eq!(priority_of_usage(Some(fulltext.as_ref())), -1);
        assert_eq!(priority_of_usage(None), -1);
    }

    #[test]
    fn three_hop_chain_walks_back_to_first_class() {
        let db = chain_db();
        let rome = db.insert("City", |r| r.with("name", "Rome")).unwrap();
        let oslo = db.insert("City", |r| r.with("name", "Oslo")).unwrap();
        let a1 = db.insert("Address", |r| r.with("city", rome)).unwrap();
        let a2 = db.insert("Address", |r| r.with("city", oslo)).unwrap();
        let a3 = db.insert("Address", |r| r.with("city", rome)).unwrap();
        let p1 = db.insert("Person", |r| r.with("address", a1)).unwrap();
        let _p2 = db.insert("Person", |r| r.with("address", a2)).unwrap();
        let p3 = db.insert("Person", |r| r.with("address", a3)).unwrap();

        let proxies =
            ChainedIndexProxy::create_proxies(&db, &db, "Person", &FieldChain::parse("address.city.name"));
        assert_eq!(proxies.len(), 1);
        let proxy = &proxies[0];
        assert_eq!(proxy.name(), "IndexChain{Person.address, Address.city, City.name}");
        let rids = collect_rids(
            proxy
                .query(&IndexQuery::Exact(smallvec![Value::from("Rome")]), true)
                .unwrap(),
        )
        .unwrap();
        let mut rids = rids;
        rids.sort();
        assert_eq!(rids, vec![p1, p3]);

        let none = collect_rids(
            proxy
                .query(&IndexQuery::Exact(smallvec![Value::from("Lima")]), true)
                .unwrap(),
        )
        .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn missing_base_index_yields_no_proxy() {
        let db = MemoryDatabase::new();
        db.create_class("City", None).unwrap();
        db.create_class("Person", None).unwrap();
        db.link_property("Person", "city", "City").unwrap();
        db.create_index("City.name", IndexKind::NotUnique, IndexDefinition::new("City", ["name"]))
            .unwrap();
        db.create_index(
            "Person.city.ft",
            IndexKind::Fulltext,
            IndexDefinition::new("Person", ["city"]),
        )
        .unwrap();
        let proxies =
            ChainedIndexProxy::create_proxies(&db, &db, "Person", &FieldChain::parse("city.name"));
        assert!(proxies.is_empty());
    }

    #[test]
    fn last_hop_variants_are_deduplicated_by_family() {
        let db = chain_db();
        db.create_index("City.name.2", IndexKind::Unique, IndexDefinition::new("City", ["name"]))
            .unwrap();
        db.create_index(
            "City.name.hash",
            IndexKind::NotUniqueHash,
            IndexDefinition::new("City", ["name"]),
        )
        .unwrap();
        let proxies =
            ChainedIndexProxy::create_proxies(&db, &db, "Person", &FieldChain::parse("address.city.name"));
        assert_eq!(proxies.len(), 2);
        let families: BTreeSet<_> = proxies
            .iter()
            .map(|p| p.last_index().kind().family())
            .collect();
        assert_eq!(families.len(), 2);
    }

    #[test]
    fn mutations_are_rejected() {
        let db = chain_db();
        let proxies =
            ChainedIndexProxy::create_proxies(&db, &db, "Person", &FieldChain::parse("address.city.name"));
        let proxy = &proxies[0];
        let err = proxy.put(smallvec![Value::Int(1)], Rid::new(1, 1)).unwrap_err();
        assert_eq!(err.code(), "UnsupportedForView");
        assert!(proxy.remove(&[Value::Int(1)], Rid::new(1, 1)).is_err());
        assert!(proxy.clear().is_err());
        assert!(proxy.rebuild().is_err());
        assert!(proxy.stream(true).is_err());
        assert!(!proxy.supports_ordered_iteration());
        assert_eq!(proxy.kind(), IndexKind::Proxy);
    }

    #[test]
    fn chains_need_two_hops() {
        let db = chain_db();
        let only = db.index("City.name").unwrap();
        let err = ChainedIndexProxy::new(vec![only]).err().unwrap();
        assert_eq!(err.code(), "ChainTooShort");
    }
}
