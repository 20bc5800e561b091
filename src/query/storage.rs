//! Record storage and result delivery collaborators.

use crate::query::context::QueryStats;
use crate::query::record::{Record, Row};
use crate::types::{ClusterId, Result, Rid};

/// Physical iteration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanDirection {
    /// Ascending RID order.
    #[default]
    Ascending,
    /// Descending RID order.
    Descending,
}

/// Inclusive RID bounds handed to scans as a hint. Stores may return records
/// outside the range; the filter still decides membership.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RidRange {
    /// Lowest RID of interest.
    pub from: Option<Rid>,
    /// Highest RID of interest.
    pub to: Option<Rid>,
}

impl RidRange {
    /// Unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether `rid` lies within the bounds.
    pub fn contains(&self, rid: Rid) -> bool {
        self.from.map_or(true, |from| rid >= from) && self.to.map_or(true, |to| rid <= to)
    }

    /// Whether the range can hold any record of `cluster`.
    pub fn touches(&self, cluster: ClusterId) -> bool {
        self.from.map_or(true, |from| cluster >= from.cluster)
            && self.to.map_or(true, |to| cluster <= to.cluster)
    }

    /// True when neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Stream of records.
pub type RecordCursor<'a> = Box<dyn Iterator<Item = Result<Record>> + 'a>;

/// Live record access used by scans and chain traversal.
pub trait RecordStore: Send + Sync {
    /// Loads one record; deleted or unknown RIDs yield `None`.
    fn load(&self, rid: Rid) -> Result<Option<Record>>;
    /// Iterates the live records of one cluster.
    fn scan_cluster(
        &self,
        cluster: ClusterId,
        direction: ScanDirection,
        range: &RidRange,
    ) -> Result<RecordCursor<'_>>;
    /// Number of live records in a cluster.
    fn cluster_count(&self, cluster: ClusterId) -> Result<u64>;

    /// Iterates several clusters back to back so the combined stream stays in
    /// RID order for the requested direction.
    fn scan_clusters(
        &self,
        clusters: &[ClusterId],
        direction: ScanDirection,
        range: &RidRange,
    ) -> Result<RecordCursor<'_>> {
        let mut ordered: Vec<ClusterId> = clusters
            .iter()
            .copied()
            .filter(|c| range.touches(*c))
            .collect();
        ordered.sort_unstable();
        ordered.dedup();
        if direction == ScanDirection::Descending {
            ordered.reverse();
        }
        let mut cursors = Vec::with_capacity(ordered.len());
        for cluster in ordered {
            cursors.push(self.scan_cluster(cluster, direction, range)?);
        }
        Ok(Box::new(cursors.into_iter().flatten()))
    }

    /// Total live records across clusters.
    fn count(&self, clusters: &[ClusterId]) -> Result<u64> {
        let mut total = 0u64;
        for cluster in clusters {
            total = total.saturating_add(self.cluster_count(*cluster)?);
        }
        Ok(total)
    }
}

/// Consumer of result rows.
pub trait ResultSink {
    /// Receives one row; returning `false` stops the query.
    fn push(&mut self, row: Row) -> bool;

    /// Called once after the last row.
    fn finish(&mut self, _stats: &QueryStats) {}
}

/// Sink that keeps every row, optionally stopping after `cap` rows.
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// Rows received so far.
    pub rows: Vec<Row>,
    cap: Option<usize>,
    finished: bool,
}

impl CollectingSink {
    /// Unbounded collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector that asks the executor to stop after `cap` rows.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: Some(cap),
            ..Self::default()
        }
    }

    /// Whether `finish` was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl ResultSink for CollectingSink {
    fn push(&mut self, row: Row) -> bool {
        self.rows.push(row);
        self.cap.map_or(true, |cap| self.rows.len() < cap)
    }

    fn finish(&mut self, _stats: &QueryStats) {
        self.finished = true;
    }
}
