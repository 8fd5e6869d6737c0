//! Training worker pool.
//!
//! Each worker loops on the input queue:
//!
//! 1. pop a filled [`BatchUnit`] (blocking; `None` means shutdown)
//! 2. let the [`ScoringStrategy`] compute violations and gradients
//! 3. merge the gradients straight into the shared matrices (Hogwild)
//! 4. add the unit's counters to the worker's [`ThreadOutput`]
//! 5. push the stale unit to the output queue for refilling
//!
//! Merging bumps the row's version stamp. If the stamp moved since the
//! strategy read the row, another worker wrote it in between and the merge
//! counts one conflict. Conflicts are telemetry; the update is applied anyway.

use crate::batch::BatchUnit;
use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};
use crate::gradient::GradientAccumulator;
use crate::optimizer::{OptimizerState, UpdateRule};
use crate::queue::BoundedQueue;
use crate::scoring::ScoringStrategy;
use crate::tracer::{GradientEvent, GradientTracer, ParamKind};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, Scope, ScopedJoinHandle};
use tracing::debug;

/// Per-worker running totals for the current epoch.
#[derive(Debug, Default)]
pub struct ThreadOutput {
    violations: AtomicU64,
    conflicts: AtomicU64,
    batches: AtomicU64,
    rows: AtomicU64,
    corruptions: AtomicU64,
}

/// Plain copy of a [`ThreadOutput`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTotals {
    pub violations: u64,
    pub conflicts: u64,
    pub batches: u64,
    pub rows: u64,
    pub corruptions: u64,
}

impl Add for ThreadTotals {
    type Output = Self;

    fn add(self, o: Self) -> Self {
        Self {
            violations: self.violations + o.violations,
            conflicts: self.conflicts + o.conflicts,
            batches: self.batches + o.batches,
            rows: self.rows + o.rows,
            corruptions: self.corruptions + o.corruptions,
        }
    }
}

impl ThreadOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, io: &BatchUnit) {
        self.violations.fetch_add(io.violations, Ordering::Relaxed);
        self.conflicts.fetch_add(io.conflicts, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(io.len() as u64, Ordering::Relaxed);
        self.corruptions.fetch_add(io.num_corruptions(), Ordering::Relaxed);
    }

    pub fn totals(&self) -> ThreadTotals {
        ThreadTotals {
            violations: self.violations.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters. Called at epoch boundaries while workers are idle.
    pub fn reset(&self) {
        self.violations.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
        self.batches.store(0, Ordering::Relaxed);
        self.rows.store(0, Ordering::Relaxed);
        self.corruptions.store(0, Ordering::Relaxed);
    }
}

/// Sum of several workers' totals.
pub fn aggregate(outputs: &[ThreadOutput]) -> ThreadTotals {
    outputs.iter().map(ThreadOutput::totals).fold(ThreadTotals::default(), Add::add)
}

/// Everything a worker borrows from the orchestrator for the run.
#[derive(Clone, Copy)]
pub struct Shared<'a> {
    pub entities: &'a EmbeddingMatrix,
    pub relations: &'a EmbeddingMatrix,
    pub optimizer: Option<&'a OptimizerState>,
    pub rule: UpdateRule,
    pub strategy: &'a dyn ScoringStrategy,
    pub margin: f32,
    pub tracer: Option<&'a dyn GradientTracer>,
}

/// Score one unit and merge its gradients. Adds the merge conflicts to
/// `io.conflicts`. `ge` and `gr` are scratch space, cleared here.
pub fn process_unit(
    shared: &Shared<'_>,
    io: &mut BatchUnit,
    ge: &mut GradientAccumulator,
    gr: &mut GradientAccumulator,
) {
    ge.clear();
    gr.clear();
    let epoch = io.epoch;
    shared
        .strategy
        .process_batch(io, shared.entities, shared.relations, shared.margin, epoch, ge, gr);

    let (acc_e, acc_r) = match shared.optimizer {
        Some(state) => (Some(&state.entities), Some(&state.relations)),
        None => (None, None),
    };
    let mut conflicts = merge(shared, shared.entities, acc_e, ge, ParamKind::Entity, epoch);
    conflicts += merge(shared, shared.relations, acc_r, gr, ParamKind::Relation, epoch);
    io.conflicts += conflicts;
}

fn merge(
    shared: &Shared<'_>,
    params: &EmbeddingMatrix,
    accumulators: Option<&EmbeddingMatrix>,
    grads: &GradientAccumulator,
    kind: ParamKind,
    epoch: u32,
) -> u64 {
    let mut conflicts = 0;
    for c in grads.iter() {
        let previous = params.bump_version(c.id);
        let conflict = previous != c.seen_version;
        conflicts += conflict as u64;
        shared.rule.apply(params, accumulators, c.id, &c.dimensions);
        if let Some(tracer) = shared.tracer {
            tracer.record(&GradientEvent {
                epoch,
                kind,
                id: c.id,
                n: c.n,
                norm: c.norm(),
                conflict,
            });
        }
    }
    conflicts
}

/// Worker body: runs until `input` is closed and drained.
pub fn batch_processor(
    shared: Shared<'_>,
    input: &BoundedQueue<BatchUnit>,
    output: &BoundedQueue<BatchUnit>,
    totals: &ThreadOutput,
) {
    let dim = shared.entities.dim();
    let mut ge = GradientAccumulator::new(dim);
    let mut gr = GradientAccumulator::new(dim);
    while let Some(mut io) = input.pop() {
        process_unit(&shared, &mut io, &mut ge, &mut gr);
        totals.record(&io);
        if output.push(io).is_err() {
            debug!("output queue closed, dropping batch unit");
        }
    }
}

/// Fixed pool of training workers living for one training run.
pub struct WorkerPool<'scope> {
    handles: Vec<ScopedJoinHandle<'scope, ()>>,
}

impl<'scope> WorkerPool<'scope> {
    /// Spawn one worker per entry of `outputs`.
    pub fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        shared: Shared<'scope>,
        input: &'scope BoundedQueue<BatchUnit>,
        output: &'scope BoundedQueue<BatchUnit>,
        outputs: &'scope [ThreadOutput],
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(outputs.len());
        for (i, totals) in outputs.iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("learn-worker-{i}"))
                .spawn_scoped(scope, move || batch_processor(shared, input, output, totals));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Let the workers already running see shutdown.
                    input.close();
                    return Err(e.into());
                }
            }
        }
        debug!(workers = handles.len(), "training workers started");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// True if any worker has exited. Before shutdown this means it panicked.
    pub fn any_finished(&self) -> bool {
        self.handles.iter().any(|h| h.is_finished())
    }

    /// Join every worker. The input queue must already be closed.
    pub fn join(self) -> Result<()> {
        let mut panicked = 0;
        for handle in self.handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(Error::WorkerPanic(format!("{panicked} training worker(s) panicked")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchRow;
    use crate::scoring::TransE;
    use crate::tracer::MemoryTracer;

    fn shared<'a>(
        e: &'a EmbeddingMatrix,
        r: &'a EmbeddingMatrix,
        strategy: &'a TransE,
        tracer: Option<&'a dyn GradientTracer>,
    ) -> Shared<'a> {
        Shared {
            entities: e,
            relations: r,
            optimizer: None,
            rule: UpdateRule::Sgd { learning_rate: 0.1 },
            strategy,
            margin: 1.0,
            tracer,
        }
    }

    #[test]
    fn test_stale_version_counts_conflict() {
        let e = EmbeddingMatrix::from_vec(2, 1, vec![0.0, 1.0]).unwrap();
        let r = EmbeddingMatrix::from_vec(1, 1, vec![0.0]).unwrap();
        let strategy = TransE::squared_l2();
        let s = shared(&e, &r, &strategy, None);

        let mut ge = GradientAccumulator::new(1);
        let mut gr = GradientAccumulator::new(1);
        ge.add(0, 0, 1.0, &[1.0]);
        e.bump_version(0); // someone else merged row 0 after we read it
        let conflicts = merge(&s, &e, None, &ge, ParamKind::Entity, 0);
        assert_eq!(conflicts, 1);

        ge.clear();
        ge.add(1, e.version(1), 1.0, &[1.0]);
        assert_eq!(merge(&s, &e, None, &ge, ParamKind::Entity, 0), 0);
        gr.clear();
        assert_eq!(merge(&s, &r, None, &gr, ParamKind::Relation, 0), 0);
    }

    #[test]
    fn test_pool_processes_and_recycles() {
        let e = EmbeddingMatrix::new(4, 2);
        e.init_uniform(1);
        let r = EmbeddingMatrix::new(1, 2);
        r.init_uniform(2);
        let strategy = TransE::l1();
        let tracer = MemoryTracer::new();
        let s = shared(&e, &r, &strategy, Some(&tracer));

        let input = BoundedQueue::new(2);
        let output = BoundedQueue::new(8);
        let outputs: Vec<ThreadOutput> = (0..2).map(|_| ThreadOutput::new()).collect();

        std::thread::scope(|scope| {
            let pool = WorkerPool::spawn(scope, s, &input, &output, &outputs).unwrap();
            assert_eq!(pool.len(), 2);
            for i in 0..6u64 {
                let mut unit = BatchUnit::new(2, 2);
                unit.push(BatchRow::new(i % 4, 0, (i + 1) % 4).with_neg_tail((i + 2) % 4));
                unit.push(BatchRow::new((i + 1) % 4, 0, i % 4).with_neg_head((i + 3) % 4));
                input.push(unit).unwrap();
            }
            input.close();
            pool.join().unwrap();
        });

        let totals = aggregate(&outputs);
        assert_eq!(totals.batches, 6);
        assert_eq!(totals.rows, 12);
        assert_eq!(totals.corruptions, 12);
        assert!(totals.violations <= 12);
        assert_eq!(output.len(), 6);
        if totals.violations > 0 {
            assert!(!tracer.is_empty());
        }

        for o in &outputs {
            o.reset();
        }
        assert_eq!(aggregate(&outputs), ThreadTotals::default());
    }
}
