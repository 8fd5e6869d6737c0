//! End-to-end training tests: orchestrator, workers, checkpoints, early stop.

use lattix_learn::gradient::GradientAccumulator;
use lattix_learn::{
    load_model, BatchRow, BatchSource, BatchUnit, EmbeddingMatrix, FixedRows, LearnParams, Learner,
    ModelKind, RankValidator, ScoringStrategy, ShuffledBatcher, StopReason, TrainedModel, TransE, Triple,
    TripleSet,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Two interleaved chains over `n` entities and two relations.
fn synthetic_graph(n: u64) -> TripleSet {
    let mut triples = Vec::new();
    for i in 0..n {
        triples.push(Triple::new(i, 0, (i + 1) % n));
        triples.push(Triple::new(i, 1, (i + 3) % n));
    }
    TripleSet::new(triples)
}

fn base_params(set: &TripleSet) -> LearnParams {
    LearnParams::default()
        .with_shape(set.num_entities(), set.num_relations(), 8)
        .with_epochs(4)
        .with_batch_size(5)
        .with_learning_rate(0.05)
        .with_seed(9)
}

fn close(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6)
}

#[test]
fn hand_computed_squared_l2_step() {
    // e0 = [0, 0], e1 = [1, 1], r0 = [0.5, 0]
    // true (0, 0, 1):       x = [-0.5, -1], d = 1.25, slope = [-1, -2]
    // tail corrupted to 0:  x = [ 0.5,  0], d = 0.25, slope = [ 1,  0]
    // 1.25 + 1 > 0.25, so the row violates.
    let entities = EmbeddingMatrix::from_vec(2, 2, vec![0.0, 0.0, 1.0, 1.0]).unwrap();
    let relations = EmbeddingMatrix::from_vec(1, 2, vec![0.5, 0.0]).unwrap();
    let start = TrainedModel::new(entities, relations).unwrap();

    let params = LearnParams::default()
        .with_shape(2, 1, 2)
        .with_epochs(1)
        .with_batch_size(1)
        .with_margin(1.0)
        .with_learning_rate(0.1)
        .with_model(ModelKind::TranseL2);
    let mut source = FixedRows::new(vec![BatchRow::new(0, 0, 1).with_neg_tail(0)]);
    let (model, report) = Learner::new(params)
        .unwrap()
        .with_warm_start(start)
        .unwrap()
        .train(&mut source)
        .unwrap();

    assert_eq!(report.epochs[0].violations, 1);
    assert_eq!(report.epochs[0].corruptions, 1);
    // head: +pos - neg2 = [-2, -2]; nt (= head): +neg2 = [1, 0]; tail: -pos = [1, 2]
    assert!(close(&model.entities.row(0), &[0.1, 0.2]), "{:?}", model.entities.row(0));
    assert!(close(&model.entities.row(1), &[0.9, 0.8]), "{:?}", model.entities.row(1));
    // relation: +pos - neg2 = [-2, -2]
    assert!(close(&model.relations.row(0), &[0.7, 0.2]), "{:?}", model.relations.row(0));
}

#[test]
fn single_thread_runs_are_bit_identical() {
    let set = synthetic_graph(30);
    let run = || {
        let params = base_params(&set).with_adagrad(true);
        let mut source = ShuffledBatcher::new(&set, 2, params.seed);
        Learner::new(params).unwrap().train(&mut source).unwrap()
    };
    let (a, report_a) = run();
    let (b, report_b) = run();

    assert!(a.entities.same_values(&b.entities));
    assert!(a.relations.same_values(&b.relations));
    let (acc_a, acc_b) = (a.optimizer.unwrap(), b.optimizer.unwrap());
    assert!(acc_a.entities.same_values(&acc_b.entities));
    assert_eq!(report_a.total_violations(), report_b.total_violations());
    assert_eq!(report_a.total_conflicts(), 0);
}

/// TransE wrapper that recounts violations on its own before delegating.
struct Recounting {
    inner: TransE,
    margin: f32,
    seen: Arc<AtomicU64>,
}

impl ScoringStrategy for Recounting {
    fn name(&self) -> &'static str {
        "recounting"
    }

    fn distance(&self, head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
        self.inner.distance(head, relation, tail)
    }

    fn process_batch(
        &self,
        io: &mut BatchUnit,
        entities: &EmbeddingMatrix,
        relations: &EmbeddingMatrix,
        margin: f32,
        epoch: u32,
        ge: &mut GradientAccumulator,
        gr: &mut GradientAccumulator,
    ) {
        assert_eq!(margin, self.margin);
        let mut count = 0;
        for row in io.rows() {
            let r = relations.row(row.relation);
            let d_pos = self.distance(&entities.row(row.head), &r, &entities.row(row.tail));
            if let Some(nh) = row.neg_head {
                count += u64::from(d_pos + margin > self.distance(&entities.row(nh), &r, &entities.row(row.tail)));
            }
            if let Some(nt) = row.neg_tail {
                count += u64::from(d_pos + margin > self.distance(&entities.row(row.head), &r, &entities.row(nt)));
            }
        }
        self.seen.fetch_add(count, Ordering::Relaxed);
        self.inner.process_batch(io, entities, relations, margin, epoch, ge, gr);
    }
}

#[test]
fn reported_violations_match_independent_recount() {
    let set = synthetic_graph(25);
    let params = base_params(&set).with_margin(2.0);
    let seen = Arc::new(AtomicU64::new(0));
    let strategy = Recounting {
        inner: TransE::l1(),
        margin: 2.0,
        seen: Arc::clone(&seen),
    };
    let mut source = ShuffledBatcher::new(&set, 1, 4);
    let (_, report) = Learner::new(params)
        .unwrap()
        .with_strategy(Box::new(strategy))
        .train(&mut source)
        .unwrap();

    assert!(report.total_violations() > 0);
    assert_eq!(report.total_violations(), seen.load(Ordering::Relaxed));
}

#[test]
fn final_checkpoint_round_trips_with_shards_and_compression() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("model");
    let set = synthetic_graph(23);
    let mut params = base_params(&set).with_storage(&folder, 1, true);
    params.nstorethreads = 3;
    let mut source = ShuffledBatcher::new(&set, 1, 1);
    let (model, report) = Learner::new(params).unwrap().train(&mut source).unwrap();

    assert_eq!(report.failed_checkpoints(), 0);
    assert!(report.checkpoints.last().unwrap().is_final);

    let loaded = load_model(&folder).unwrap();
    assert!(loaded.entities.same_values(&model.entities));
    assert!(loaded.relations.same_values(&model.relations));
    let meta = lattix_learn::persistence::read_meta(&folder).unwrap();
    assert!(meta.compressed);
    assert_eq!(meta.epoch, 4);
    // 23 entities over 3 shards, 2 relations over 2.
    assert_eq!(meta.shards.len(), 5);
    assert_eq!(meta.model, "transe-l1");

    // The first periodic checkpoint can never be skipped.
    let first = load_model(folder.join("epoch-1")).unwrap();
    assert_eq!(first.num_entities(), 23);
    assert_eq!(first.dim(), 8);
}

#[test]
fn adagrad_state_survives_storage() {
    let dir = tempfile::tempdir().unwrap();
    let set = synthetic_graph(12);
    let params = base_params(&set).with_adagrad(true).with_storage(dir.path(), 0, false);
    let mut source = ShuffledBatcher::new(&set, 1, 2);
    let (model, _) = Learner::new(params).unwrap().train(&mut source).unwrap();

    let loaded = load_model(dir.path()).unwrap();
    let stored = loaded.optimizer.expect("accumulators stored");
    let live = model.optimizer.unwrap();
    assert!(stored.entities.same_values(&live.entities));
    assert!(stored.relations.same_values(&live.relations));
    assert!(live.entities.snapshot().iter().all(|v| *v >= 0.0));
    assert!(live.entities.snapshot().iter().any(|v| *v > 0.0));
}

#[test]
fn early_stop_waits_for_min_full_epochs() {
    let set = synthetic_graph(20);
    // An impossible improvement target stops at the first epoch allowed to.
    let params = base_params(&set).with_epochs(10).with_feedback(10.0, 2);
    let mut source = ShuffledBatcher::new(&set, 1, 3);
    let (_, report) = Learner::new(params).unwrap().train(&mut source).unwrap();

    assert_eq!(report.epochs.len(), 3);
    assert!(matches!(report.stop, StopReason::EarlyStop { epoch: 3, .. }));
}

#[test]
fn without_feedback_every_epoch_runs() {
    let set = synthetic_graph(20);
    let params = base_params(&set).with_epochs(6);
    let mut source = ShuffledBatcher::new(&set, 1, 3);
    let (_, report) = Learner::new(params).unwrap().train(&mut source).unwrap();
    assert_eq!(report.stop, StopReason::Completed);
    assert_eq!(report.epochs_run(), 6);
}

#[test]
fn storage_failure_does_not_stop_training() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let set = synthetic_graph(10);
    let params = base_params(&set).with_storage(&blocker, 2, false);
    let mut source = ShuffledBatcher::new(&set, 1, 5);
    let (_, report) = Learner::new(params).unwrap().train(&mut source).unwrap();

    assert_eq!(report.epochs_run(), 4);
    assert!(report.failed_checkpoints() > 0);
    assert!(report.checkpoints.iter().all(|c| c.error.is_some()));
}

#[test]
fn many_workers_process_every_row() {
    let set = synthetic_graph(200);
    let params = base_params(&set).with_threads(4, 2).with_batch_size(16).with_epochs(3);
    let mut source = ShuffledBatcher::new(&set, 2, 8);
    let expected_rows = source.rows_per_epoch().unwrap() as u64;
    let (model, report) = Learner::new(params).unwrap().train(&mut source).unwrap();

    for s in &report.epochs {
        assert_eq!(s.rows, expected_rows);
        assert_eq!(s.corruptions, 2 * expected_rows);
        assert!(s.violations <= s.corruptions);
    }
    assert!(model.entities.snapshot().iter().all(|v| v.is_finite()));
}

#[test]
fn warm_start_picks_up_stored_model() {
    let dir = tempfile::tempdir().unwrap();
    let set = synthetic_graph(15);
    let params = base_params(&set).with_storage(dir.path(), 0, false);
    let mut source = ShuffledBatcher::new(&set, 1, 6);
    Learner::new(params.clone()).unwrap().train(&mut source).unwrap();

    let loaded = load_model(dir.path()).unwrap();
    let expected = loaded.entities.duplicate();
    let params = LearnParams {
        storefolder: None,
        ..params
    };
    // No rows: the warm-started matrices must come back untouched.
    let (model, _) = Learner::new(params)
        .unwrap()
        .with_warm_start(loaded)
        .unwrap()
        .train(&mut FixedRows::new(Vec::new()))
        .unwrap();
    assert!(model.entities.same_values(&expected));
}

#[test]
fn validation_follows_evalits() {
    let set = synthetic_graph(20);
    let split = set.split(0.2, 0.0, 1).unwrap();
    let params = base_params(&set).with_eval_every(2);
    let mut source = ShuffledBatcher::new(&split.train, 1, 7);
    let (_, report) = Learner::new(params)
        .unwrap()
        .with_validator(RankValidator::new(split.valid.triples().to_vec()))
        .train(&mut source)
        .unwrap();

    let validated: Vec<u32> = report
        .epochs
        .iter()
        .filter(|s| s.validation.is_some())
        .map(|s| s.epoch)
        .collect();
    assert_eq!(validated, vec![2, 4]);
    let metrics = &report.epochs[1].validation.as_ref().unwrap().metrics;
    assert_eq!(metrics.num_ranks, 2 * split.valid.len());
    assert!(metrics.mrr > 0.0 && metrics.mrr <= 1.0);
}

#[test]
fn file_trace_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("grads.csv");
    let set = synthetic_graph(10);
    let params = base_params(&set).with_margin(50.0).with_filetrace(&trace);
    let mut source = ShuffledBatcher::new(&set, 1, 1);
    Learner::new(params).unwrap().train(&mut source).unwrap();

    let text = std::fs::read_to_string(&trace).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("epoch,kind,id,n,norm,conflict"));
    assert!(lines.count() > 0);
}
