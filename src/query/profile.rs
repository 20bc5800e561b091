use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of planner and executor profiling metrics.
///
/// Profiling is enabled via the `SOMBRA_PROFILE` environment variable and
/// accumulates across every query run by the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent planning.
    pub plan_ns: u64,
    /// Number of plans built.
    pub plan_count: u64,
    /// Total nanoseconds spent opening index cursors.
    pub index_probe_ns: u64,
    /// Number of index probes.
    pub index_probe_count: u64,
    /// Total nanoseconds spent in storage scans.
    pub scan_ns: u64,
    /// Number of scans.
    pub scan_count: u64,
    /// Total nanoseconds spent evaluating filters.
    pub filter_ns: u64,
    /// Number of filter evaluations.
    pub filter_count: u64,
    /// Total nanoseconds spent sorting buffered rows.
    pub sort_ns: u64,
    /// Number of sorts, partial sorts included.
    pub sort_count: u64,
    /// Total nanoseconds spent merging polymorphic streams.
    pub merge_ns: u64,
    /// Number of merges.
    pub merge_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    plan_ns: AtomicU64,
    plan_count: AtomicU64,
    index_probe_ns: AtomicU64,
    index_probe_count: AtomicU64,
    scan_ns: AtomicU64,
    scan_count: AtomicU64,
    filter_ns: AtomicU64,
    filter_count: AtomicU64,
    sort_ns: AtomicU64,
    sort_count: AtomicU64,
    merge_ns: AtomicU64,
    merge_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("SOMBRA_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    Plan,
    IndexProbe,
    Scan,
    Filter,
    Sort,
    Merge,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Plan => (&counters.plan_ns, &counters.plan_count),
        QueryProfileKind::IndexProbe => (&counters.index_probe_ns, &counters.index_probe_count),
        QueryProfileKind::Scan => (&counters.scan_ns, &counters.scan_count),
        QueryProfileKind::Filter => (&counters.filter_ns, &counters.filter_count),
        QueryProfileKind::Sort => (&counters.sort_ns, &counters.sort_count),
        QueryProfileKind::Merge => (&counters.merge_ns, &counters.merge_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current query profiling metrics.
///
/// Returns `None` unless `SOMBRA_PROFILE` is set. With `reset`, counters are
/// zeroed as they are read.
///
/// ```no_run
/// use sombra_sql::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(true) {
///     println!("index probes: {}", snapshot.index_probe_count);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        plan_ns: load(&counters.plan_ns),
        plan_count: load(&counters.plan_count),
        index_probe_ns: load(&counters.index_probe_ns),
        index_probe_count: load(&counters.index_probe_count),
        scan_ns: load(&counters.scan_ns),
        scan_count: load(&counters.scan_count),
        filter_ns: load(&counters.filter_ns),
        filter_count: load(&counters.filter_count),
        sort_ns: load(&counters.sort_ns),
        sort_count: load(&counters.sort_count),
        merge_ns: load(&counters.merge_ns),
        merge_count: load(&counters.merge_count),
    })
}
