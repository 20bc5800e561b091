//! Schema and index catalog collaborators.
//!
//! The planner asks these traits which classes exist, how they inherit and
//! where their records live, and which indexes can serve a set of fields.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::query::index::Index;
use crate::types::ClusterId;

/// Natural ordering of an index's full stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOrder {
    /// Streams in ascending key order.
    Ascending,
    /// Streams in descending key order.
    Descending,
    /// No usable order (hash based).
    None,
}

/// Class hierarchy and physical layout.
pub trait SchemaCatalog: Send + Sync {
    /// Whether the class is defined.
    fn class_exists(&self, class: &str) -> bool;
    /// Abstract classes hold no records of their own.
    fn is_abstract(&self, class: &str) -> bool;
    /// Direct superclass, if any.
    fn superclass(&self, class: &str) -> Option<String>;
    /// Direct subclasses in declaration order.
    fn subclasses(&self, class: &str) -> Vec<String>;
    /// Clusters that hold the class's own records.
    fn clusters(&self, class: &str) -> Vec<ClusterId>;
    /// Whether the cluster exists.
    fn cluster_exists(&self, cluster: ClusterId) -> bool;
    /// Class reached by following a link property.
    fn linked_class(&self, class: &str, property: &str) -> Option<String>;

    /// True when `class` equals `ancestor` or inherits from it.
    fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        let mut current = Some(class.to_owned());
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.superclass(&name);
        }
        false
    }

    /// The class followed by every transitive subclass, depth first.
    fn class_tree(&self, class: &str) -> Vec<String> {
        let mut out = vec![class.to_owned()];
        let mut idx = 0;
        while idx < out.len() {
            let children = self.subclasses(&out[idx]);
            out.extend(children);
            idx += 1;
        }
        out
    }

    /// Clusters of the class, plus those of every subclass when `polymorphic`,
    /// in ascending id order.
    fn target_clusters(&self, class: &str, polymorphic: bool) -> Vec<ClusterId> {
        let classes = if polymorphic {
            self.class_tree(class)
        } else {
            vec![class.to_owned()]
        };
        let set: BTreeSet<ClusterId> = classes.iter().flat_map(|c| self.clusters(c)).collect();
        set.into_iter().collect()
    }
}

/// Index lookup by class and field set.
pub trait IndexCatalog: Send + Sync {
    /// Indexes declared on the class or any of its superclasses.
    fn class_indexes(&self, class: &str) -> Vec<Arc<dyn Index>>;
    /// Index registered under `name`.
    fn index_by_name(&self, name: &str) -> Option<Arc<dyn Index>>;

    /// Indexes whose leading declared fields are exactly the given field set,
    /// in any order.
    fn indexes_covering_fields(&self, class: &str, fields: &[String]) -> Vec<Arc<dyn Index>> {
        let wanted: BTreeSet<&str> = fields.iter().map(String::as_str).collect();
        if wanted.len() != fields.len() || wanted.is_empty() {
            return Vec::new();
        }
        self.class_indexes(class)
            .into_iter()
            .filter(|index| {
                let declared = &index.definition().fields;
                declared.len() >= fields.len()
                    && declared[..fields.len()]
                        .iter()
                        .map(String::as_str)
                        .collect::<BTreeSet<_>>()
                        == wanted
            })
            .collect()
    }

    /// Whether some index covers the field set.
    fn are_indexed(&self, class: &str, fields: &[String]) -> bool {
        !self.indexes_covering_fields(class, fields).is_empty()
    }

    /// Indexes whose first declared field is `property`.
    fn indexes_for_property(&self, class: &str, property: &str) -> Vec<Arc<dyn Index>> {
        self.indexes_covering_fields(class, &[property.to_owned()])
    }

    /// Natural stream order of an index.
    fn declared_order(&self, index: &dyn Index) -> IndexOrder {
        if index.supports_ordered_iteration() {
            IndexOrder::Ascending
        } else {
            IndexOrder::None
        }
    }
}
