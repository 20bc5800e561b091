//! In-memory schema, indexes and record store.
//!
//! [`MemoryDatabase`] implements every collaborator trait the engine needs so
//! queries can run without a storage engine. Indexes are kept in sync on
//! insert and delete. Fault injection hooks let callers make an index or a
//! cluster scan fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::query::errors::QueryError;
use crate::query::index::{
    Index, IndexCursor, IndexDefinition, IndexEntry, IndexKind, IndexQuery, KeyParams, MapIndexBy,
    key_within,
};
use crate::query::metadata::{IndexCatalog, SchemaCatalog};
use crate::query::record::Record;
use crate::query::storage::{RecordCursor, RecordStore, RidRange, ScanDirection};
use crate::query::value::Value;
use crate::types::{ClusterId, Result, Rid, SombraError};

/// Ordered index held in memory.
pub struct MemoryIndex {
    name: String,
    kind: IndexKind,
    definition: IndexDefinition,
    entries: RwLock<BTreeMap<Vec<Value>, BTreeSet<Rid>>>,
    failing: AtomicBool,
}

impl MemoryIndex {
    /// Empty index.
    pub fn new(name: &str, kind: IndexKind, definition: IndexDefinition) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            definition,
            entries: RwLock::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every read fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SombraError::Index {
                index: self.name.clone(),
                message: "index unavailable".to_owned(),
            });
        }
        Ok(())
    }

    /// Keys a record contributes. List fields contribute one key per element
    /// and map fields one key per map key or value.
    pub fn keys_for(&self, record: &Record) -> Vec<Vec<Value>> {
        let mut keys: Vec<Vec<Value>> = vec![Vec::new()];
        for field in &self.definition.fields {
            let components = match record.get(field) {
                Value::List(items) if !items.is_empty() => items,
                Value::Map(entries) if !entries.is_empty() => match self.definition.map_by {
                    MapIndexBy::Key => entries.into_keys().map(Value::String).collect(),
                    MapIndexBy::Value => entries.into_values().collect(),
                },
                Value::List(_) | Value::Map(_) => vec![Value::Null],
                other => vec![other],
            };
            keys = keys
                .into_iter()
                .flat_map(|prefix| {
                    components.iter().map(move |component| {
                        let mut key = prefix.clone();
                        key.push(component.clone());
                        key
                    })
                })
                .collect();
        }
        if self.definition.ignore_nulls {
            keys.retain(|key| !key.iter().any(Value::is_null));
        }
        keys.sort();
        keys.dedup();
        keys
    }

    fn conflicts(&self, key: &[Value], rid: Rid) -> bool {
        if !self.is_unique() || key.iter().all(Value::is_null) {
            return false;
        }
        self.entries
            .read()
            .get(key)
            .is_some_and(|rids| rids.iter().any(|existing| *existing != rid))
    }

    fn collect<F>(&self, ascending: bool, mut select: F) -> Result<IndexCursor<'_>>
    where
        F: FnMut(&BTreeMap<Vec<Value>, BTreeSet<Rid>>, &mut Vec<IndexEntry>),
    {
        self.check_failing()?;
        let mut out = Vec::new();
        let entries = self.entries.read();
        select(&*entries, &mut out);
        drop(entries);
        if !ascending {
            out.reverse();
        }
        Ok(Box::new(out.into_iter().map(Ok)))
    }
}

fn push_entries(out: &mut Vec<IndexEntry>, key: &[Value], rids: &BTreeSet<Rid>) {
    for rid in rids {
        out.push(IndexEntry {
            key: KeyParams::from(key),
            rid: *rid,
        });
    }
}

fn prefix_entries(
    entries: &BTreeMap<Vec<Value>, BTreeSet<Rid>>,
    prefix: &[Value],
    out: &mut Vec<IndexEntry>,
) {
    for (key, rids) in entries.range(prefix.to_vec()..) {
        if !key.starts_with(prefix) {
            break;
        }
        push_entries(out, key, rids);
    }
}

fn within(value: &Value, lower: &std::ops::Bound<Value>, upper: &std::ops::Bound<Value>) -> bool {
    use std::ops::Bound;
    if value.is_null() {
        return false;
    }
    let above = match lower {
        Bound::Included(bound) => value >= bound,
        Bound::Excluded(bound) => value > bound,
        Bound::Unbounded => true,
    };
    let below = match upper {
        Bound::Included(bound) => value <= bound,
        Bound::Excluded(bound) => value < bound,
        Bound::Unbounded => true,
    };
    above && below
}

impl Index for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        self.kind
    }

    fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    fn supports_ordered_iteration(&self) -> bool {
        !self.kind.is_hash() && self.kind != IndexKind::DictionaryHash
    }

    fn query(&self, query: &IndexQuery, ascending: bool) -> Result<IndexCursor<'_>> {
        match query {
            IndexQuery::Exact(prefix) => {
                self.collect(ascending, |entries, out| prefix_entries(entries, prefix, out))
            }
            IndexQuery::In(keys) => {
                let mut keys: Vec<&KeyParams> = keys.iter().collect();
                keys.sort();
                keys.dedup();
                self.collect(ascending, |entries, out| {
                    for key in &keys {
                        prefix_entries(entries, key, out);
                    }
                })
            }
            IndexQuery::Range {
                prefix,
                lower,
                upper,
            } => self.collect(ascending, |entries, out| {
                for (key, rids) in entries.range(prefix.to_vec()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if key
                        .get(prefix.len())
                        .is_some_and(|component| within(component, lower, upper))
                    {
                        push_entries(out, key, rids);
                    }
                }
            }),
            IndexQuery::KeyRange { lower, upper } => self.collect(ascending, |entries, out| {
                for (key, rids) in entries {
                    if key_within(key, lower, upper) {
                        push_entries(out, key, rids);
                    }
                }
            }),
        }
    }

    fn stream(&self, ascending: bool) -> Result<IndexCursor<'_>> {
        self.collect(ascending, |entries, out| {
            for (key, rids) in entries {
                if !key.iter().all(Value::is_null) {
                    push_entries(out, key, rids);
                }
            }
        })
    }

    fn null_entries(&self) -> Result<IndexCursor<'_>> {
        self.collect(true, |entries, out| {
            for (key, rids) in entries {
                if key.iter().all(Value::is_null) {
                    push_entries(out, key, rids);
                }
            }
        })
    }

    fn size(&self) -> Result<u64> {
        self.check_failing()?;
        Ok(self.entries.read().values().map(|rids| rids.len() as u64).sum())
    }

    fn put(&self, key: KeyParams, rid: Rid) -> Result<()> {
        if self.conflicts(&key, rid) {
            return Err(SombraError::Invalid("duplicate key in unique index"));
        }
        self.entries.write().entry(key.to_vec()).or_default().insert(rid);
        Ok(())
    }

    fn remove(&self, key: &[Value], rid: Rid) -> Result<bool> {
        let mut entries = self.entries.write();
        let Some(rids) = entries.get_mut(key) else {
            return Ok(false);
        };
        let removed = rids.remove(&rid);
        if rids.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn rebuild(&self) -> Result<u64> {
        self.size()
    }
}

#[derive(Debug, Default)]
struct ClassDef {
    superclass: Option<String>,
    subclasses: Vec<String>,
    clusters: Vec<ClusterId>,
    is_abstract: bool,
    links: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Cluster {
    class: String,
    records: BTreeMap<u64, Record>,
    next_position: u64,
}

#[derive(Default)]
struct Inner {
    classes: BTreeMap<String, ClassDef>,
    clusters: BTreeMap<ClusterId, Cluster>,
    next_cluster: u32,
    inserted: u64,
    indexes: Vec<Arc<MemoryIndex>>,
    failing_cluster: Option<ClusterId>,
}

impl Inner {
    fn ancestors(&self, class: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = Some(class.to_owned());
        while let Some(name) = current {
            current = self.classes.get(&name).and_then(|c| c.superclass.clone());
            out.push(name);
        }
        out
    }

    fn indexes_of(&self, class: &str) -> Vec<Arc<MemoryIndex>> {
        let ancestors = self.ancestors(class);
        self.indexes
            .iter()
            .filter(|index| ancestors.contains(&index.definition.class))
            .cloned()
            .collect()
    }
}

/// Schema, indexes and records held in memory.
#[derive(Default)]
pub struct MemoryDatabase {
    inner: RwLock<Inner>,
}

impl MemoryDatabase {
    /// Empty database. Cluster ids start at 1.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_cluster: 1,
                ..Inner::default()
            }),
        }
    }

    /// Declares a concrete class with one cluster.
    pub fn create_class(&self, name: &str, superclass: Option<&str>) -> Result<()> {
        self.create_class_with(name, superclass, 1, false)
    }

    /// Declares a class with `clusters` clusters. Abstract classes get none.
    pub fn create_class_with(
        &self,
        name: &str,
        superclass: Option<&str>,
        clusters: usize,
        is_abstract: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.classes.contains_key(name) {
            return Err(SombraError::Invalid("class already exists"));
        }
        if let Some(parent) = superclass {
            let Some(parent_def) = inner.classes.get_mut(parent) else {
                return Err(QueryError::UnknownClass {
                    class: parent.to_owned(),
                }
                .into());
            };
            parent_def.subclasses.push(name.to_owned());
        }
        let count = if is_abstract { 0 } else { clusters.max(1) };
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = ClusterId(inner.next_cluster);
            inner.next_cluster += 1;
            inner.clusters.insert(
                id,
                Cluster {
                    class: name.to_owned(),
                    ..Cluster::default()
                },
            );
            ids.push(id);
        }
        inner.classes.insert(
            name.to_owned(),
            ClassDef {
                superclass: superclass.map(str::to_owned),
                clusters: ids,
                is_abstract,
                ..ClassDef::default()
            },
        );
        debug!(class = name, clusters = count, "memory class created");
        Ok(())
    }

    /// Declares `class.property` as a link to `target` records.
    pub fn link_property(&self, class: &str, property: &str, target: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.classes.contains_key(target) {
            return Err(QueryError::UnknownClass {
                class: target.to_owned(),
            }
            .into());
        }
        let def = inner
            .classes
            .get_mut(class)
            .ok_or_else(|| QueryError::UnknownClass {
                class: class.to_owned(),
            })?;
        def.links.insert(property.to_owned(), target.to_owned());
        Ok(())
    }

    /// Declares an index and fills it from existing records of the class tree.
    pub fn create_index(
        &self,
        name: &str,
        kind: IndexKind,
        definition: IndexDefinition,
    ) -> Result<Arc<dyn Index>> {
        let mut inner = self.inner.write();
        if !inner.classes.contains_key(&definition.class) {
            return Err(QueryError::UnknownClass {
                class: definition.class.clone(),
            }
            .into());
        }
        if inner.indexes.iter().any(|index| index.name == name) {
            return Err(SombraError::Invalid("index already exists"));
        }
        let index = Arc::new(MemoryIndex::new(name, kind, definition));
        for cluster in inner.clusters.values() {
            if !inner.ancestors(&cluster.class).contains(&index.definition.class) {
                continue;
            }
            for record in cluster.records.values() {
                for key in index.keys_for(record) {
                    index.put(KeyParams::from_vec(key), record.rid)?;
                }
            }
        }
        inner.indexes.push(Arc::clone(&index));
        Ok(index)
    }

    /// Index by name.
    pub fn index(&self, name: &str) -> Option<Arc<dyn Index>> {
        self.memory_index(name).map(|index| index as Arc<dyn Index>)
    }

    /// Concrete index by name, for fault injection.
    pub fn memory_index(&self, name: &str) -> Option<Arc<MemoryIndex>> {
        self.inner
            .read()
            .indexes
            .iter()
            .find(|index| index.name == name)
            .cloned()
    }

    /// Makes scans of `cluster` fail halfway through; `None` clears it.
    pub fn set_failing_cluster(&self, cluster: Option<ClusterId>) {
        self.inner.write().failing_cluster = cluster;
    }

    /// Inserts a record built by `build` and indexes it. Records of a class
    /// with several clusters are spread round-robin.
    pub fn insert<F>(&self, class: &str, build: F) -> Result<Rid>
    where
        F: FnOnce(Record) -> Record,
    {
        let mut inner = self.inner.write();
        let def = inner.classes.get(class).ok_or_else(|| QueryError::UnknownClass {
            class: class.to_owned(),
        })?;
        if def.is_abstract || def.clusters.is_empty() {
            return Err(SombraError::Invalid("cannot insert into an abstract class"));
        }
        let cluster_id = def.clusters[(inner.inserted % def.clusters.len() as u64) as usize];
        let position = inner
            .clusters
            .get(&cluster_id)
            .map(|c| c.next_position)
            .ok_or(SombraError::Corruption("class cluster missing"))?;
        let rid = Rid {
            cluster: cluster_id,
            position,
        };
        let mut record = build(Record::new(rid, class));
        record.rid = rid;
        record.class = class.to_owned();

        let indexes = inner.indexes_of(class);
        let keyed: Vec<(Arc<MemoryIndex>, Vec<Vec<Value>>)> = indexes
            .into_iter()
            .map(|index| {
                let keys = index.keys_for(&record);
                (index, keys)
            })
            .collect();
        if keyed
            .iter()
            .any(|(index, keys)| keys.iter().any(|key| index.conflicts(key, rid)))
        {
            return Err(SombraError::Invalid("duplicate key in unique index"));
        }
        for (index, keys) in keyed {
            for key in keys {
                index.put(KeyParams::from_vec(key), rid)?;
            }
        }
        let cluster = inner
            .clusters
            .get_mut(&cluster_id)
            .ok_or(SombraError::Corruption("class cluster missing"))?;
        cluster.records.insert(position, record);
        cluster.next_position += 1;
        inner.inserted += 1;
        Ok(rid)
    }

    /// Deletes a record and its index entries.
    pub fn delete(&self, rid: Rid) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(record) = inner
            .clusters
            .get_mut(&rid.cluster)
            .and_then(|cluster| cluster.records.remove(&rid.position))
        else {
            return Ok(false);
        };
        for index in inner.indexes_of(&record.class) {
            for key in index.keys_for(&record) {
                index.remove(&key, rid)?;
            }
        }
        Ok(true)
    }

    /// Snapshot of one record.
    pub fn record(&self, rid: Rid) -> Option<Record> {
        self.inner
            .read()
            .clusters
            .get(&rid.cluster)
            .and_then(|cluster| cluster.records.get(&rid.position))
            .cloned()
    }

    /// Every cluster id, ascending.
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.inner.read().clusters.keys().copied().collect()
    }
}

impl SchemaCatalog for MemoryDatabase {
    fn class_exists(&self, class: &str) -> bool {
        self.inner.read().classes.contains_key(class)
    }

    fn is_abstract(&self, class: &str) -> bool {
        self.inner
            .read()
            .classes
            .get(class)
            .is_some_and(|def| def.is_abstract)
    }

    fn superclass(&self, class: &str) -> Option<String> {
        self.inner
            .read()
            .classes
            .get(class)
            .and_then(|def| def.superclass.clone())
    }

    fn subclasses(&self, class: &str) -> Vec<String> {
        self.inner
            .read()
            .classes
            .get(class)
            .map(|def| def.subclasses.clone())
            .unwrap_or_default()
    }

    fn clusters(&self, class: &str) -> Vec<ClusterId> {
        self.inner
            .read()
            .classes
            .get(class)
            .map(|def| def.clusters.clone())
            .unwrap_or_default()
    }

    fn cluster_exists(&self, cluster: ClusterId) -> bool {
        self.inner.read().clusters.contains_key(&cluster)
    }

    fn linked_class(&self, class: &str, property: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .ancestors(class)
            .iter()
            .find_map(|name| inner.classes.get(name)?.links.get(property).cloned())
    }
}

impl IndexCatalog for MemoryDatabase {
    fn class_indexes(&self, class: &str) -> Vec<Arc<dyn Index>> {
        self.inner
            .read()
            .indexes_of(class)
            .into_iter()
            .map(|index| index as Arc<dyn Index>)
            .collect()
    }

    fn index_by_name(&self, name: &str) -> Option<Arc<dyn Index>> {
        self.index(name)
    }
}

impl RecordStore for MemoryDatabase {
    fn load(&self, rid: Rid) -> Result<Option<Record>> {
        Ok(self.record(rid))
    }

    fn scan_cluster(
        &self,
        cluster: ClusterId,
        direction: ScanDirection,
        range: &RidRange,
    ) -> Result<RecordCursor<'_>> {
        let inner = self.inner.read();
        let data = inner
            .clusters
            .get(&cluster)
            .ok_or(QueryError::UnknownCluster { cluster: cluster.0 })?;
        let mut records: Vec<Result<Record>> = data
            .records
            .values()
            .filter(|record| range.contains(record.rid))
            .cloned()
            .map(Ok)
            .collect();
        if direction == ScanDirection::Descending {
            records.reverse();
        }
        if inner.failing_cluster == Some(cluster) {
            let cut = records.len() / 2;
            records.truncate(cut);
            records.push(Err(SombraError::Corruption("cluster scan failed")));
        }
        Ok(Box::new(records.into_iter()))
    }

    fn cluster_count(&self, cluster: ClusterId) -> Result<u64> {
        let inner = self.inner.read();
        let data = inner
            .clusters
            .get(&cluster)
            .ok_or(QueryError::UnknownCluster { cluster: cluster.0 })?;
        Ok(data.records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::index::collect_rids;
    use smallvec::smallvec;
    use std::ops::Bound;

    #[test]
    fn indexes_follow_inserts_and_deletes() {
        let db = MemoryDatabase::new();
        db.create_class("Person", None).unwrap();
        let index = db
            .create_index("Person.age", IndexKind::NotUnique, IndexDefinition::new("Person", ["age"]))
            .unwrap();
        let a = db.insert("Person", |r| r.with("age", 30i64)).unwrap();
        let b = db.insert("Person", |r| r.with("age", 40i64)).unwrap();
        let _c = db.insert("Person", |r| r).unwrap();
        let range = IndexQuery::Range {
            prefix: KeyParams::new(),
            lower: Bound::Excluded(Value::Int(20)),
            upper: Bound::Unbounded,
        };
        assert_eq!(collect_rids(index.query(&range, true).unwrap()).unwrap(), vec![a, b]);
        assert_eq!(collect_rids(index.query(&range, false).unwrap()).unwrap(), vec![b, a]);
        assert_eq!(collect_rids(index.null_entries().unwrap()).unwrap().len(), 1);
        assert_eq!(index.size().unwrap(), 3);
        assert!(db.delete(a).unwrap());
        assert_eq!(collect_rids(index.query(&range, true).unwrap()).unwrap(), vec![b]);
    }

    #[test]
    fn unique_indexes_reject_duplicates() {
        let db = MemoryDatabase::new();
        db.create_class("Person", None).unwrap();
        db.create_index("Person.ssn", IndexKind::Unique, IndexDefinition::new("Person", ["ssn"]))
            .unwrap();
        db.insert("Person", |r| r.with("ssn", "1")).unwrap();
        assert!(db.insert("Person", |r| r.with("ssn", "1")).is_err());
        assert_eq!(db.count(&db.clusters("Person")).unwrap(), 1);
    }

    #[test]
    fn list_fields_index_each_element() {
        let db = MemoryDatabase::new();
        db.create_class("Post", None).unwrap();
        let index = db
            .create_index("Post.tags", IndexKind::NotUnique, IndexDefinition::new("Post", ["tags"]))
            .unwrap();
        let post = db.insert("Post", |r| r.with("tags", vec!["a", "b"])).unwrap();
        let hits = collect_rids(index.query(&IndexQuery::Exact(smallvec![Value::from("b")]), true).unwrap())
            .unwrap();
        assert_eq!(hits, vec![post]);
    }

    #[test]
    fn subclasses_and_clusters() {
        let db = MemoryDatabase::new();
        db.create_class_with("Animal", None, 0, true).unwrap();
        db.create_class_with("Dog", Some("Animal"), 2, false).unwrap();
        db.create_class("Cat", Some("Animal")).unwrap();
        assert!(db.is_abstract("Animal"));
        assert_eq!(db.class_tree("Animal"), vec!["Animal", "Dog", "Cat"]);
        assert_eq!(db.target_clusters("Animal", true).len(), 3);
        assert!(db.insert("Animal", |r| r).is_err());
        let first = db.insert("Dog", |r| r).unwrap();
        let second = db.insert("Dog", |r| r).unwrap();
        assert_ne!(first.cluster, second.cluster);
    }

    #[test]
    fn failing_hooks_surface_errors() {
        let db = MemoryDatabase::new();
        db.create_class("T", None).unwrap();
        db.create_index("T.a", IndexKind::NotUnique, IndexDefinition::new("T", ["a"]))
            .unwrap();
        for i in 0..4i64 {
            db.insert("T", |r| r.with("a", i)).unwrap();
        }
        db.memory_index("T.a").unwrap().set_failing(true);
        assert!(db.index("T.a").unwrap().stream(true).is_err());
        let cluster = db.clusters("T")[0];
        db.set_failing_cluster(Some(cluster));
        let results: Vec<_> = db
            .scan_cluster(cluster, ScanDirection::Ascending, &RidRange::all())
            .unwrap()
            .collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }
}
