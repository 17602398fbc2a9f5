//! The transaction-scoped scheduler.
//!
//! A transaction that mutates several source collections emits one change
//! batch per collection, each tagged with the transaction's context id.
//! Subscriptions deposit the resulting deltas into graph input buffers and
//! *schedule* a run job here instead of running the graph themselves. When
//! the transaction flushes, the queued jobs run once, in order, followed by
//! any load-more callbacks the run produced — repeating until the context's
//! queues are empty. The net effect: an N-collection transaction triggers
//! exactly one graph run per live query.
//!
//! Jobs are idempotent (running a job with no pending input is a no-op) and
//! deduplicated per context by job id, so a live query subscribed to three
//! collections of one transaction still runs once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// A scheduled unit of work.
pub type Job = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SchedulerInner {
    next_context: u64,
    /// Per-context run jobs, deduplicated by job id.
    jobs: HashMap<u64, Vec<(String, Job)>>,
    /// Per-context load-more callbacks, run after the jobs of a pass.
    load_more: HashMap<u64, Vec<Job>>,
}

/// Coalesces graph runs across the mutations of one transaction.
#[derive(Clone, Default)]
pub struct TransactionScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

static GLOBAL: OnceLock<TransactionScheduler> = OnceLock::new();

impl TransactionScheduler {
    /// A fresh, private scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default scheduler.
    pub fn global() -> &'static TransactionScheduler {
        GLOBAL.get_or_init(TransactionScheduler::new)
    }

    /// Allocate an opaque transaction context id.
    pub fn allocate_context(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_context += 1;
        inner.next_context
    }

    /// Queue a run job for `context`. A job id already queued for this
    /// context is not queued again.
    pub fn schedule(&self, context: u64, job_id: &str, job: Job) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.jobs.entry(context).or_default();
        if queue.iter().any(|(id, _)| id == job_id) {
            return;
        }
        queue.push((job_id.to_string(), job));
    }

    /// Queue a load-more callback for `context`, run after the current
    /// pass's jobs.
    pub fn schedule_load_more(&self, context: u64, job: Job) {
        let mut inner = self.inner.lock().unwrap();
        inner.load_more.entry(context).or_default().push(job);
    }

    /// True if any work is queued for `context`. Exposed for tests.
    pub fn has_pending_jobs(&self, context: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&context).map(|q| !q.is_empty()).unwrap_or(false)
            || inner.load_more.get(&context).map(|q| !q.is_empty()).unwrap_or(false)
    }

    /// Drop all queued work for `context` (transaction rollback).
    pub fn discard(&self, context: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.remove(&context);
        inner.load_more.remove(&context);
    }

    /// Run all queued jobs for `context` in order, then the load-more
    /// callbacks they produced, repeating until both queues are empty.
    /// Idempotent: flushing a context with no work is a no-op.
    pub fn flush(&self, context: u64) {
        loop {
            let jobs: Vec<(String, Job)> = {
                let mut inner = self.inner.lock().unwrap();
                inner.jobs.remove(&context).unwrap_or_default()
            };
            let had_jobs = !jobs.is_empty();
            for (_, job) in jobs {
                job();
            }

            let load_more: Vec<Job> = {
                let mut inner = self.inner.lock().unwrap();
                inner.load_more.remove(&context).unwrap_or_default()
            };
            let had_load_more = !load_more.is_empty();
            for job in load_more {
                job();
            }

            if !had_jobs && !had_load_more {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_are_deduplicated_by_id() {
        let scheduler = TransactionScheduler::new();
        let ctx = scheduler.allocate_context();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = Arc::clone(&counter);
            scheduler.schedule(ctx, "live-query-1", Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(scheduler.has_pending_jobs(ctx));
        scheduler.flush(ctx);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending_jobs(ctx));
    }

    #[test]
    fn flush_is_idempotent_and_discard_clears() {
        let scheduler = TransactionScheduler::new();
        let ctx = scheduler.allocate_context();
        scheduler.flush(ctx);

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        scheduler.schedule(ctx, "job", Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler.discard(ctx);
        scheduler.flush(ctx);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn load_more_runs_after_jobs_and_requeues() {
        let scheduler = TransactionScheduler::new();
        let ctx = scheduler.allocate_context();
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let o = Arc::clone(&order);
        let s = scheduler.clone();
        scheduler.schedule(ctx, "run", Arc::new(move || {
            o.lock().unwrap().push("run");
            let o2 = Arc::clone(&o);
            s.schedule_load_more(ctx, Arc::new(move || {
                o2.lock().unwrap().push("load-more");
            }));
        }));

        scheduler.flush(ctx);
        assert_eq!(*order.lock().unwrap(), vec!["run", "load-more"]);
    }
}
