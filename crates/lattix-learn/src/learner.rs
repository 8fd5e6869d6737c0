//! Training orchestrator.
//!
//! A [`Learner`] owns the embedding matrices for the length of one run and
//! lends them to every thread it starts:
//!
//! ```text
//!              free list (2 x nthreads units)
//!                 |  clear + fill from BatchSource
//!                 v
//!   orchestrator --push--> input queue --> workers (Hogwild merge)
//!        ^                                     |
//!        +--------pop------- output queue <----+
//! ```
//!
//! An epoch is over when every unit dispatched in it came back through the
//! output queue. The orchestrator then aggregates the per-worker counters,
//! validates and checkpoints on their cadences, and consults the early stop.
//! All threads run inside one `std::thread::scope` and are joined before
//! the matrices are handed back as a [`TrainedModel`].

use crate::batch::BatchUnit;
use crate::checkpoint::{CheckpointManager, CheckpointReport, CheckpointRequest, CheckpointSettings, CheckpointTargets};
use crate::config::LearnParams;
use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};
use crate::feedback::{violation_rate, EarlyStopPolicy, StopDecision};
use crate::model::TrainedModel;
use crate::optimizer::{OptimizerState, UpdateRule};
use crate::queue::{BoundedQueue, Popped, Pushed};
use crate::scoring::{strategy_for, ScoringStrategy};
use crate::source::BatchSource;
use crate::tracer::{FileTracer, GradientTracer};
use crate::validation::{ValidationReport, Validator};
use crate::worker::{aggregate, Shared, ThreadOutput, WorkerPool};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Where the learner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initializing,
    Training { epoch: u32 },
    Finalizing,
    Done,
}

/// Counters of one completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: u32,
    pub violations: u64,
    pub conflicts: u64,
    pub batches: u64,
    pub rows: u64,
    /// Corrupted triples scored.
    pub corruptions: u64,
    pub elapsed: Duration,
    pub validation: Option<ValidationReport>,
    /// A periodic checkpoint was requested after this epoch.
    pub checkpoint_requested: bool,
}

impl EpochStats {
    pub fn violation_rate(&self) -> f64 {
        violation_rate(self.violations, self.corruptions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// Every configured epoch ran.
    Completed,
    /// The violation rate stopped improving.
    EarlyStop { epoch: u32, improvement: f64 },
}

/// Summary of a training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
    pub stop: StopReason,
    /// Every checkpoint, periodic and final, in completion order.
    pub checkpoints: Vec<CheckpointReport>,
    pub elapsed: Duration,
}

impl TrainingReport {
    pub fn epochs_run(&self) -> u32 {
        self.epochs.last().map_or(0, |s| s.epoch)
    }

    pub fn total_violations(&self) -> u64 {
        self.epochs.iter().map(|s| s.violations).sum()
    }

    pub fn total_conflicts(&self) -> u64 {
        self.epochs.iter().map(|s| s.conflicts).sum()
    }

    pub fn failed_checkpoints(&self) -> usize {
        self.checkpoints.iter().filter(|c| !c.is_ok()).count()
    }
}

type EpochCallback = Box<dyn FnMut(&EpochStats) + Send>;

/// Multi-threaded margin-ranking trainer.
pub struct Learner {
    params: LearnParams,
    strategy: Box<dyn ScoringStrategy>,
    warm_start: Option<TrainedModel>,
    tracer: Option<Arc<dyn GradientTracer>>,
    validator: Option<Box<dyn Validator>>,
    on_epoch: Option<EpochCallback>,
    phase: Phase,
}

impl Learner {
    /// Validate `params` and pick the scoring strategy it names.
    pub fn new(params: LearnParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            strategy: strategy_for(params.model),
            params,
            warm_start: None,
            tracer: None,
            validator: None,
            on_epoch: None,
            phase: Phase::Idle,
        })
    }

    /// Replace the configured strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn ScoringStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Continue from stored embeddings instead of a random init. Prior
    /// AdaGrad state is kept only when AdaGrad is configured.
    pub fn with_warm_start(mut self, model: TrainedModel) -> Result<Self> {
        let p = &self.params;
        if model.num_entities() != p.ne || model.num_relations() != p.nr || model.dim() != p.dim {
            return Err(Error::Shape(format!(
                "warm start is {}x{}x{}, configuration is {}x{}x{}",
                model.num_entities(),
                model.num_relations(),
                model.dim(),
                p.ne,
                p.nr,
                p.dim
            )));
        }
        self.warm_start = Some(model);
        Ok(self)
    }

    /// Install a gradient tracer. Overrides `filetrace`.
    pub fn with_tracer(mut self, tracer: Arc<dyn GradientTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Called on the orchestrator thread after each epoch.
    pub fn on_epoch(mut self, callback: impl FnMut(&EpochStats) + Send + 'static) -> Self {
        self.on_epoch = Some(Box::new(callback));
        self
    }

    pub fn params(&self) -> &LearnParams {
        &self.params
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(phase: &mut Phase, next: Phase) {
        match next {
            Phase::Training { epoch } => debug!(epoch, "training epoch"),
            _ => info!(from = ?*phase, to = ?next, "learner phase"),
        }
        *phase = next;
    }

    /// Run training to completion (or early stop) and hand back the model.
    pub fn train(&mut self, source: &mut dyn BatchSource) -> Result<(TrainedModel, TrainingReport)> {
        let started = Instant::now();
        let Self {
            params,
            strategy,
            warm_start,
            tracer,
            validator,
            on_epoch,
            phase,
        } = self;
        let params: &LearnParams = params;
        Self::enter(phase, Phase::Initializing);
        info!("learning parameters: {}", params);

        let (entities, relations, optimizer) = initial_state(params, warm_start.take());
        let rule = if params.adagrad {
            UpdateRule::AdaGrad {
                learning_rate: params.learning_rate,
                epsilon: params.adagrad_epsilon,
            }
        } else {
            UpdateRule::Sgd {
                learning_rate: params.learning_rate,
            }
        };
        let tracer: Option<Arc<dyn GradientTracer>> = match (tracer.clone(), &params.filetrace) {
            (Some(t), _) => Some(t),
            (None, Some(path)) => Some(Arc::new(FileTracer::create(path)?)),
            (None, None) => None,
        };

        let pool_size = 2 * params.nthreads;
        let input = BoundedQueue::new(params.input_capacity());
        let output = BoundedQueue::new(pool_size);
        let outputs: Vec<ThreadOutput> = (0..params.nthreads).map(|_| ThreadOutput::new()).collect();
        let free: Vec<BatchUnit> = (0..pool_size).map(|_| BatchUnit::new(params.batch_size, params.dim)).collect();
        let strategy: &dyn ScoringStrategy = &**strategy;
        info!(
            model = strategy.name(),
            ne = params.ne,
            nr = params.nr,
            dim = params.dim,
            threads = params.nthreads,
            units = pool_size,
            "starting training"
        );

        let (run, stats, checkpoints) = thread::scope(|scope| -> Result<_> {
            let shared = Shared {
                entities: &entities,
                relations: &relations,
                optimizer: optimizer.as_ref(),
                rule,
                strategy,
                margin: params.margin,
                tracer: tracer.as_deref(),
            };
            let workers = WorkerPool::spawn(scope, shared, &input, &output, &outputs)?;

            let checkpointer = match &params.storefolder {
                Some(_) => {
                    let targets = CheckpointTargets {
                        entities: &entities,
                        relations: &relations,
                        optimizer: optimizer.as_ref(),
                    };
                    match CheckpointManager::spawn(scope, targets, CheckpointSettings::from_params(params)) {
                        Ok(manager) => Some(manager),
                        Err(e) => {
                            input.close();
                            if let Err(join) = workers.join() {
                                warn!("while stopping after a checkpoint setup failure: {}", join);
                            }
                            return Err(e);
                        }
                    }
                }
                None => None,
            };

            let mut epochs = EpochLoop {
                params,
                strategy,
                validator: validator.as_deref(),
                on_epoch: on_epoch.as_mut(),
                phase: &mut *phase,
                entities: &entities,
                relations: &relations,
                input: &input,
                output: &output,
                outputs: &outputs,
                workers: &workers,
                checkpointer: checkpointer.as_ref(),
                free,
                stats: Vec::new(),
            };
            let run = epochs.run(source);
            let stats = std::mem::take(&mut epochs.stats);
            drop(epochs);

            Self::enter(phase, Phase::Finalizing);
            input.close();
            let joined = workers.join();

            let mut checkpoints = Vec::new();
            if let Some(manager) = checkpointer {
                manager.wait_idle();
                if let (Ok(_), Ok(()), Some(folder)) = (&run, &joined, &params.storefolder) {
                    let last = stats.last().map_or(0, |s| s.epoch);
                    manager.request(CheckpointRequest::last(folder.clone(), last));
                }
                checkpoints = manager.shutdown()?;
            }
            joined?;
            Ok((run, stats, checkpoints))
        })?;
        let stop = run?;

        if let Some(t) = &tracer {
            if let Err(e) = t.flush() {
                warn!("gradient trace flush failed: {}", e);
            }
        }

        let report = TrainingReport {
            epochs: stats,
            stop,
            checkpoints,
            elapsed: started.elapsed(),
        };
        info!(
            epochs = report.epochs_run(),
            violations = report.total_violations(),
            conflicts = report.total_conflicts(),
            failed_checkpoints = report.failed_checkpoints(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "training finished"
        );
        Self::enter(phase, Phase::Done);

        let model = TrainedModel {
            entities,
            relations,
            optimizer,
        };
        Ok((model, report))
    }
}

fn initial_state(
    params: &LearnParams,
    warm_start: Option<TrainedModel>,
) -> (EmbeddingMatrix, EmbeddingMatrix, Option<OptimizerState>) {
    let zeros = || OptimizerState::zeros(params.ne, params.nr, params.dim);
    match warm_start {
        Some(model) => {
            info!(ne = model.num_entities(), nr = model.num_relations(), "warm start");
            let optimizer = if params.adagrad {
                Some(model.optimizer.unwrap_or_else(zeros))
            } else {
                if model.optimizer.is_some() {
                    debug!("dropping stored AdaGrad state, plain SGD is configured");
                }
                None
            };
            (model.entities, model.relations, optimizer)
        }
        None => {
            let entities = EmbeddingMatrix::new(params.ne, params.dim);
            entities.init_uniform(params.seed);
            let relations = EmbeddingMatrix::new(params.nr, params.dim);
            relations.init_uniform(params.seed.wrapping_add(1));
            (entities, relations, params.adagrad.then(zeros))
        }
    }
}

/// State the orchestrator needs while epochs run.
struct EpochLoop<'a, 'scope> {
    params: &'a LearnParams,
    strategy: &'a dyn ScoringStrategy,
    validator: Option<&'a dyn Validator>,
    on_epoch: Option<&'a mut EpochCallback>,
    phase: &'a mut Phase,
    entities: &'a EmbeddingMatrix,
    relations: &'a EmbeddingMatrix,
    input: &'a BoundedQueue<BatchUnit>,
    output: &'a BoundedQueue<BatchUnit>,
    outputs: &'a [ThreadOutput],
    workers: &'a WorkerPool<'scope>,
    checkpointer: Option<&'a CheckpointManager<'scope>>,
    free: Vec<BatchUnit>,
    stats: Vec<EpochStats>,
}

impl EpochLoop<'_, '_> {
    fn run(&mut self, source: &mut dyn BatchSource) -> Result<StopReason> {
        let mut policy = EarlyStopPolicy::from_params(self.params);
        for epoch in 1..=self.params.epochs {
            Learner::enter(self.phase, Phase::Training { epoch });
            let mut stats = self.run_epoch(epoch, source)?;
            info!(
                epoch,
                violations = stats.violations,
                conflicts = stats.conflicts,
                rate = stats.violation_rate(),
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "epoch finished"
            );

            if self.params.evalits > 0 && epoch % self.params.evalits == 0 {
                stats.validation = self.validate(epoch);
            }
            if self.params.storeits > 0 && epoch % self.params.storeits == 0 {
                stats.checkpoint_requested = self.request_checkpoint(epoch);
            }

            let decision = policy
                .as_mut()
                .map_or(StopDecision::Continue, |p| p.observe(epoch, stats.violations, stats.corruptions));
            if let Some(callback) = self.on_epoch.as_deref_mut() {
                callback(&stats);
            }
            self.stats.push(stats);

            if let StopDecision::Stop { improvement } = decision {
                info!(epoch, improvement, "violation rate stopped improving, stopping early");
                return Ok(StopReason::EarlyStop { epoch, improvement });
            }
        }
        Ok(StopReason::Completed)
    }

    /// Feed one epoch through the workers and wait for it to drain.
    fn run_epoch(&mut self, epoch: u32, source: &mut dyn BatchSource) -> Result<EpochStats> {
        let started = Instant::now();
        for out in self.outputs {
            out.reset();
        }
        source.start_epoch(epoch);

        let mut in_flight = 0usize;
        let mut exhausted = false;
        loop {
            while !exhausted {
                let Some(mut unit) = self.free.pop() else { break };
                unit.clear();
                unit.epoch = epoch;
                if source.fill(&mut unit) && !unit.is_empty() {
                    for row in unit.rows() {
                        row.check_ids(self.params.ne, self.params.nr)?;
                    }
                    self.dispatch(unit, epoch)?;
                    in_flight += 1;
                } else {
                    self.free.push(unit);
                    exhausted = true;
                }
            }
            if in_flight == 0 {
                break;
            }
            match self.output.pop_timeout(DRAIN_POLL) {
                Popped::Item(unit) => {
                    in_flight -= 1;
                    self.free.push(unit);
                }
                Popped::TimedOut if self.workers.any_finished() => {
                    return Err(Error::WorkerPanic(format!("a training worker died during epoch {epoch}")));
                }
                Popped::TimedOut => {}
                Popped::Closed => {
                    return Err(Error::WorkerPanic("output queue closed mid-epoch".to_string()));
                }
            }
        }

        let totals = aggregate(self.outputs);
        Ok(EpochStats {
            epoch,
            violations: totals.violations,
            conflicts: totals.conflicts,
            batches: totals.batches,
            rows: totals.rows,
            corruptions: totals.corruptions,
            elapsed: started.elapsed(),
            validation: None,
            checkpoint_requested: false,
        })
    }

    /// Hand a filled unit to the workers, noticing if they all died while
    /// the input queue is full.
    fn dispatch(&self, mut unit: BatchUnit, epoch: u32) -> Result<()> {
        loop {
            match self.input.push_timeout(unit, DRAIN_POLL) {
                Pushed::Queued => return Ok(()),
                Pushed::TimedOut(_) if self.workers.any_finished() => {
                    return Err(Error::WorkerPanic(format!("a training worker died during epoch {epoch}")));
                }
                Pushed::TimedOut(back) => unit = back,
                Pushed::Closed(_) => {
                    return Err(Error::WorkerPanic("training queue closed mid-epoch".to_string()));
                }
            }
        }
    }

    fn validate(&self, epoch: u32) -> Option<ValidationReport> {
        let validator = self.validator?;
        match validator.validate(self.entities, self.relations, self.strategy) {
            Ok(report) => {
                info!(epoch, "validation: {}", report.metrics.summary());
                Some(report)
            }
            Err(e) => {
                warn!(epoch, "validation failed: {}", e);
                None
            }
        }
    }

    fn request_checkpoint(&self, epoch: u32) -> bool {
        let (Some(manager), Some(folder)) = (self.checkpointer, &self.params.storefolder) else {
            return false;
        };
        if manager.is_busy() {
            warn!(epoch, "previous checkpoint still running, skipping this one");
            return false;
        }
        manager.request(CheckpointRequest::periodic(folder.join(format!("epoch-{epoch}")), epoch));
        true
    }
}
