//! Parallel cluster scan: one scoped worker per cluster feeding a bounded queue
//! drained by the calling thread.
//!
//! Workers evaluate LET and the filter themselves and only ship qualifying
//! records. The consumer stops everything by returning `false`; workers notice
//! through the shared running flag or a closed queue. Worker metrics are merged
//! into the caller's context after every worker has been joined, and the first
//! failure (consumer first, then workers in cluster order) is returned.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;

use tracing::{debug, trace};

use crate::query::condition::EvalScope;
use crate::query::context::ExecutionContext;
use crate::query::executor::{LetBindings, RecordEvaluator};
use crate::query::planner::ScanPlan;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::record::Record;
use crate::query::storage::RecordStore;
use crate::types::{ClusterId, Result, SombraError};

type Item = (Record, LetBindings);

pub(crate) struct ParallelScan<'a> {
    store: &'a dyn RecordStore,
    scan: &'a ScanPlan,
    capacity: usize,
}

struct Worker<'a> {
    store: &'a dyn RecordStore,
    scan: &'a ScanPlan,
    cluster: ClusterId,
    running: &'a AtomicBool,
    queue_full: &'a AtomicBool,
}

impl<'a> ParallelScan<'a> {
    pub(crate) fn new(store: &'a dyn RecordStore, scan: &'a ScanPlan, capacity: usize) -> Self {
        Self {
            store,
            scan,
            capacity: capacity.max(1),
        }
    }

    /// Scans every cluster concurrently, handing each qualifying record to
    /// `consume` on the calling thread.
    pub(crate) fn run<F>(
        &self,
        ctx: &mut ExecutionContext,
        evaluator: &RecordEvaluator<'_>,
        mut consume: F,
    ) -> Result<()>
    where
        F: FnMut(Record, LetBindings, &mut ExecutionContext) -> Result<bool>,
    {
        let timer = profile_timer();
        let running = AtomicBool::new(true);
        let queue_full = AtomicBool::new(false);
        let tasks = self.scan.clusters.len();
        debug!(tasks, capacity = self.capacity, "parallel scan starting");

        let (consumer_result, joined) = thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<Item>(self.capacity);
            let mut handles = Vec::with_capacity(tasks);
            for &cluster in &self.scan.clusters {
                let tx = tx.clone();
                let mut child = ctx.fork();
                let worker = Worker {
                    store: self.store,
                    scan: self.scan,
                    cluster,
                    running: &running,
                    queue_full: &queue_full,
                };
                handles.push(scope.spawn(move || {
                    let result = worker.run(&mut child, evaluator, tx);
                    (child, result)
                }));
            }
            drop(tx);

            let mut consumer_result = Ok(());
            while let Ok((record, lets)) = rx.recv() {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match consume(record, lets, ctx) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        consumer_result = Err(err);
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            drop(rx);
            let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
            (consumer_result, joined)
        });

        ctx.stats.parallel_tasks += tasks as u64;
        let mut first_err = consumer_result.err();
        for outcome in joined {
            match outcome {
                Ok((child, result)) => {
                    ctx.merge(child);
                    if let Err(err) = result {
                        first_err.get_or_insert(err);
                    }
                }
                Err(payload) => {
                    first_err.get_or_insert(SombraError::Task(panic_message(payload.as_ref())));
                }
            }
        }
        record_profile_timer(QueryProfileKind::Scan, timer);
        match first_err {
            Some(err) => {
                debug!(code = err.code(), "parallel scan failed");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl Worker<'_> {
    /// Scans the cluster; a failure stops the consumer and every sibling.
    fn run(
        &self,
        ctx: &mut ExecutionContext,
        evaluator: &RecordEvaluator<'_>,
        tx: SyncSender<Item>,
    ) -> Result<()> {
        let result = self.scan(ctx, evaluator, tx);
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    fn scan(
        &self,
        ctx: &mut ExecutionContext,
        evaluator: &RecordEvaluator<'_>,
        tx: SyncSender<Item>,
    ) -> Result<()> {
        trace!(cluster = %self.cluster, "parallel worker started");
        let variables = ctx.variables().clone();
        let scope = EvalScope::new(self.store, &variables);
        let cursor = self
            .store
            .scan_cluster(self.cluster, self.scan.direction, &self.scan.range)?;
        for record in cursor {
            if !self.running.load(Ordering::SeqCst) || !ctx.check_timeout()? {
                break;
            }
            let record = record?;
            let Some(lets) = evaluator.evaluate(&record, &scope, &mut ctx.stats)? else {
                continue;
            };
            match tx.try_send((record, lets)) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    if !self.queue_full.swap(true, Ordering::SeqCst) {
                        ctx.stats.queue_full_tip = true;
                        debug!(
                            cluster = %self.cluster,
                            "parallel result queue is full; consumer is slower than the scan"
                        );
                    }
                    if tx.send(item).is_err() {
                        break;
                    }
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        trace!(cluster = %self.cluster, "parallel worker finished");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_owned()
    }
}
