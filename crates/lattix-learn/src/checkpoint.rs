//! Asynchronous model checkpoints.
//!
//! The [`CheckpointManager`] owns a coordinator thread and a pool of store
//! threads, all living inside the training thread scope. The orchestrator
//! files [`CheckpointRequest`]s without blocking; the coordinator runs them
//! strictly one at a time. Each checkpoint is split by id range into one
//! shard job per store thread and matrix, and `meta.json` is written last.
//!
//! Checkpoints taken while workers are still training are fuzzy: rows are
//! read while other rows are being updated. A failed checkpoint is logged
//! and recorded in its [`CheckpointReport`]; it never stops training.

use crate::config::LearnParams;
use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};
use crate::optimizer::OptimizerState;
use crate::persistence::{self, MatrixKind, ModelMeta, ShardInfo, FORMAT_VERSION};
use crate::queue::BoundedQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A request to store the current embeddings under `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub path: PathBuf,
    pub epoch: u32,
    /// Taken after the workers were joined.
    pub is_final: bool,
}

impl CheckpointRequest {
    pub fn periodic(path: impl Into<PathBuf>, epoch: u32) -> Self {
        Self {
            path: path.into(),
            epoch,
            is_final: false,
        }
    }

    pub fn last(path: impl Into<PathBuf>, epoch: u32) -> Self {
        Self {
            path: path.into(),
            epoch,
            is_final: true,
        }
    }
}

/// Outcome of one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointReport {
    pub id: u64,
    pub path: PathBuf,
    pub epoch: u32,
    pub is_final: bool,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub shards: usize,
    /// Uncompressed payload bytes.
    pub bytes: u64,
    pub error: Option<String>,
}

impl CheckpointReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration(&self) -> Duration {
        self.finished_at.duration_since(self.started_at)
    }
}

/// Matrices a checkpoint reads.
#[derive(Clone, Copy)]
pub struct CheckpointTargets<'a> {
    pub entities: &'a EmbeddingMatrix,
    pub relations: &'a EmbeddingMatrix,
    pub optimizer: Option<&'a OptimizerState>,
}

impl<'a> CheckpointTargets<'a> {
    fn matrices(&self) -> Vec<(MatrixKind, &'a EmbeddingMatrix)> {
        let mut out = vec![
            (MatrixKind::Entities, self.entities),
            (MatrixKind::Relations, self.relations),
        ];
        if let Some(state) = self.optimizer {
            out.push((MatrixKind::EntityAccumulators, &state.entities));
            out.push((MatrixKind::RelationAccumulators, &state.relations));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    /// Shards per matrix, one store thread each.
    pub store_threads: usize,
    pub compress: bool,
    /// Recorded in `meta.json`.
    pub model: String,
}

impl CheckpointSettings {
    pub fn from_params(params: &LearnParams) -> Self {
        Self {
            store_threads: params.nstorethreads.max(1),
            compress: params.compress_storage,
            model: params.model.as_str().to_string(),
        }
    }
}

struct StoreJob<'a> {
    info: ShardInfo,
    matrix: &'a EmbeddingMatrix,
    path: PathBuf,
    compress: bool,
    reply: mpsc::Sender<(ShardInfo, Result<u64>)>,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<(u64, CheckpointRequest)>,
    active: bool,
    shutdown: bool,
    next_id: u64,
}

impl Pending {
    fn is_idle(&self) -> bool {
        !self.active && self.queue.is_empty()
    }
}

#[derive(Default)]
struct Control {
    pending: Mutex<Pending>,
    changed: Condvar,
    history: Mutex<Vec<CheckpointReport>>,
}

/// Runs checkpoints in the background, one at a time.
pub struct CheckpointManager<'scope> {
    control: Arc<Control>,
    jobs: Arc<BoundedQueue<StoreJob<'scope>>>,
    coordinator: Option<ScopedJoinHandle<'scope, ()>>,
    store_workers: Vec<ScopedJoinHandle<'scope, ()>>,
}

impl<'scope> CheckpointManager<'scope> {
    pub fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        targets: CheckpointTargets<'scope>,
        settings: CheckpointSettings,
    ) -> Result<Self> {
        let control = Arc::new(Control::default());
        let nstore = settings.store_threads.max(1);
        let jobs: Arc<BoundedQueue<StoreJob<'scope>>> = Arc::new(BoundedQueue::new(2 * nstore));

        let mut store_workers = Vec::with_capacity(nstore);
        for i in 0..nstore {
            let queue = Arc::clone(&jobs);
            let spawned = thread::Builder::new()
                .name(format!("store-worker-{i}"))
                .spawn_scoped(scope, move || store_loop(&queue));
            match spawned {
                Ok(handle) => store_workers.push(handle),
                Err(e) => {
                    jobs.close();
                    return Err(e.into());
                }
            }
        }

        let coordinator = {
            let control = Arc::clone(&control);
            let queue = Arc::clone(&jobs);
            thread::Builder::new()
                .name("checkpoint-coordinator".to_string())
                .spawn_scoped(scope, move || coordinate(&control, &queue, targets, &settings))
        };
        let coordinator = match coordinator {
            Ok(handle) => handle,
            Err(e) => {
                jobs.close();
                return Err(e.into());
            }
        };

        debug!(store_threads = nstore, "checkpoint manager started");
        Ok(Self {
            control,
            jobs,
            coordinator: Some(coordinator),
            store_workers,
        })
    }

    /// Queue a checkpoint and return its id. Never waits for storage.
    pub fn request(&self, request: CheckpointRequest) -> u64 {
        let mut pending = self.control.pending.lock();
        let id = pending.next_id;
        pending.next_id += 1;
        debug!(id, epoch = request.epoch, "checkpoint queued");
        pending.queue.push_back((id, request));
        drop(pending);
        self.control.changed.notify_all();
        id
    }

    /// True while a checkpoint is running or queued.
    pub fn is_busy(&self) -> bool {
        !self.control.pending.lock().is_idle()
    }

    /// Block until every queued checkpoint has finished.
    pub fn wait_idle(&self) {
        let mut pending = self.control.pending.lock();
        while !pending.is_idle() {
            if self.coordinator.as_ref().map_or(true, |h| h.is_finished()) {
                break;
            }
            self.control.changed.wait_for(&mut pending, Duration::from_millis(50));
        }
    }

    /// Reports of every finished checkpoint, in completion order.
    pub fn reports(&self) -> Vec<CheckpointReport> {
        self.control.history.lock().clone()
    }

    /// Finish queued checkpoints, stop every thread and return all reports.
    pub fn shutdown(mut self) -> Result<Vec<CheckpointReport>> {
        let panicked = self.stop();
        if panicked > 0 {
            return Err(Error::WorkerPanic(format!("{panicked} checkpoint thread(s) panicked")));
        }
        Ok(self.reports())
    }

    fn stop(&mut self) -> usize {
        self.control.pending.lock().shutdown = true;
        self.control.changed.notify_all();

        let mut panicked = 0;
        if let Some(handle) = self.coordinator.take() {
            panicked += usize::from(handle.join().is_err());
        }
        // The coordinator closes the job queue on exit; repeat in case it died.
        self.jobs.close();
        for handle in self.store_workers.drain(..) {
            panicked += usize::from(handle.join().is_err());
        }
        panicked
    }
}

impl Drop for CheckpointManager<'_> {
    fn drop(&mut self) {
        if self.coordinator.is_some() {
            self.stop();
        }
    }
}

fn coordinate<'a>(
    control: &Control,
    jobs: &BoundedQueue<StoreJob<'a>>,
    targets: CheckpointTargets<'a>,
    settings: &CheckpointSettings,
) {
    loop {
        let (id, request) = {
            let mut pending = control.pending.lock();
            loop {
                if let Some(next) = pending.queue.pop_front() {
                    pending.active = true;
                    break next;
                }
                if pending.shutdown {
                    drop(pending);
                    jobs.close();
                    debug!("checkpoint coordinator stopped");
                    return;
                }
                control.changed.wait(&mut pending);
            }
        };

        let report = run_checkpoint(id, request, jobs, &targets, settings);
        control.history.lock().push(report);
        control.pending.lock().active = false;
        control.changed.notify_all();
    }
}

fn run_checkpoint<'a>(
    id: u64,
    request: CheckpointRequest,
    jobs: &BoundedQueue<StoreJob<'a>>,
    targets: &CheckpointTargets<'a>,
    settings: &CheckpointSettings,
) -> CheckpointReport {
    let started_at = Instant::now();
    let outcome = write_checkpoint(&request, jobs, targets, settings);
    let finished_at = Instant::now();
    let elapsed_ms = finished_at.duration_since(started_at).as_millis() as u64;

    let (shards, bytes, error) = match outcome {
        Ok((shards, bytes)) => {
            info!(
                id,
                epoch = request.epoch,
                path = %request.path.display(),
                shards,
                bytes,
                elapsed_ms,
                "checkpoint written"
            );
            (shards, bytes, None)
        }
        Err(e) => {
            warn!(id, epoch = request.epoch, path = %request.path.display(), "checkpoint failed: {}", e);
            (0, 0, Some(e.to_string()))
        }
    };

    CheckpointReport {
        id,
        path: request.path,
        epoch: request.epoch,
        is_final: request.is_final,
        started_at,
        finished_at,
        shards,
        bytes,
        error,
    }
}

fn write_checkpoint<'a>(
    request: &CheckpointRequest,
    jobs: &BoundedQueue<StoreJob<'a>>,
    targets: &CheckpointTargets<'a>,
    settings: &CheckpointSettings,
) -> Result<(usize, u64)> {
    fs::create_dir_all(&request.path)?;

    let (tx, rx) = mpsc::channel();
    let mut dispatched = 0usize;
    let mut pool_closed = false;
    'dispatch: for (kind, matrix) in targets.matrices() {
        for (part, range) in persistence::shard_ranges(matrix.len(), settings.store_threads).into_iter().enumerate() {
            let file = kind.file_name(part, settings.compress);
            let job = StoreJob {
                path: persistence::staging_path(&request.path.join(&file)),
                info: ShardInfo {
                    kind,
                    file,
                    start: range.start,
                    end: range.end,
                },
                matrix,
                compress: settings.compress,
                reply: tx.clone(),
            };
            if jobs.push(job).is_err() {
                pool_closed = true;
                break 'dispatch;
            }
            dispatched += 1;
        }
    }
    drop(tx);

    // Collect every reply, even after a failure, so no shard of this
    // checkpoint is still being written when the next one starts.
    let mut shards = Vec::with_capacity(dispatched);
    let mut bytes = 0u64;
    let mut first_error = None;
    for _ in 0..dispatched {
        match rx.recv() {
            Ok((info, Ok(n))) => {
                bytes += n;
                shards.push(info);
            }
            Ok((info, Err(e))) => {
                first_error.get_or_insert_with(|| Error::Checkpoint(format!("{}: {e}", info.file)));
            }
            Err(_) => {
                first_error.get_or_insert_with(|| Error::Checkpoint("store thread exited early".to_string()));
                break;
            }
        }
    }
    if pool_closed {
        first_error.get_or_insert_with(|| Error::Checkpoint("store pool is shut down".to_string()));
    }
    if let Some(e) = first_error {
        discard_staged(request, targets, settings);
        return Err(e);
    }

    // Every shard is on disk; only now replace the previous ones.
    for shard in &shards {
        let target = request.path.join(&shard.file);
        fs::rename(persistence::staging_path(&target), &target)?;
    }

    shards.sort_by_key(|s| (s.kind, s.start));
    let meta = ModelMeta {
        format_version: FORMAT_VERSION,
        ne: targets.entities.len(),
        nr: targets.relations.len(),
        dim: targets.entities.dim(),
        compressed: settings.compress,
        epoch: request.epoch,
        model: settings.model.clone(),
        shards,
    };
    persistence::write_meta(&request.path, &meta)?;
    Ok((meta.shards.len(), bytes))
}

fn discard_staged(request: &CheckpointRequest, targets: &CheckpointTargets<'_>, settings: &CheckpointSettings) {
    for (kind, matrix) in targets.matrices() {
        for part in 0..persistence::shard_ranges(matrix.len(), settings.store_threads).len() {
            let staged = persistence::staging_path(&request.path.join(kind.file_name(part, settings.compress)));
            if staged.is_file() {
                if let Err(e) = fs::remove_file(&staged) {
                    debug!(path = %staged.display(), "could not remove staged shard: {}", e);
                }
            }
        }
    }
}

fn store_loop(jobs: &BoundedQueue<StoreJob<'_>>) {
    while let Some(job) = jobs.pop() {
        let result = persistence::write_shard(&job.path, job.matrix, job.info.start..job.info.end, job.compress);
        if job.reply.send((job.info, result)).is_err() {
            debug!("shard finished after its checkpoint was abandoned");
        }
    }
}
