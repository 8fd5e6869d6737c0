//! On-disk model layout.
//!
//! A stored model is a directory:
//!
//! ```text
//! meta.json          ModelMeta (written last, via rename)
//! E.0.bin ... E.k.bin      entity shards
//! R.0.bin ... R.k.bin      relation shards
//! PE.*.bin, PR.*.bin       AdaGrad accumulators (optional)
//! ```
//!
//! Shards get a `.gz` suffix when compressed. Each shard is a sequence of
//! records `id: u64 LE` followed by `dim` x `f32 LE`, covering one contiguous
//! id range, in ascending id order. Shards can be written in parallel, one
//! per store thread, to [staging paths](staging_path) that are renamed into
//! place once every shard of a checkpoint is on disk.

use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};
use crate::model::TrainedModel;
use crate::optimizer::OptimizerState;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const META_FILE: &str = "meta.json";
pub const FORMAT_VERSION: u32 = 1;

/// Which matrix a shard belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MatrixKind {
    #[serde(rename = "E")]
    Entities,
    #[serde(rename = "R")]
    Relations,
    #[serde(rename = "PE")]
    EntityAccumulators,
    #[serde(rename = "PR")]
    RelationAccumulators,
}

impl MatrixKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Entities => "E",
            Self::Relations => "R",
            Self::EntityAccumulators => "PE",
            Self::RelationAccumulators => "PR",
        }
    }

    pub fn file_name(&self, part: usize, compressed: bool) -> String {
        if compressed {
            format!("{}.{part}.bin.gz", self.prefix())
        } else {
            format!("{}.{part}.bin", self.prefix())
        }
    }
}

/// One shard file and the id range it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub kind: MatrixKind,
    pub file: String,
    pub start: u64,
    pub end: u64,
}

/// Shape and file list of a stored model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub format_version: u32,
    pub ne: usize,
    pub nr: usize,
    pub dim: usize,
    pub compressed: bool,
    /// Epoch the snapshot was requested at (0 = before training).
    pub epoch: u32,
    /// Scoring strategy the embeddings were trained with.
    pub model: String,
    pub shards: Vec<ShardInfo>,
}

impl ModelMeta {
    pub fn has_optimizer_state(&self) -> bool {
        self.shards.iter().any(|s| s.kind == MatrixKind::EntityAccumulators)
    }
}

/// Split `0..count` into at most `parts` contiguous, non-empty ranges.
pub fn shard_ranges(count: usize, parts: usize) -> Vec<Range<u64>> {
    let parts = parts.max(1).min(count.max(1));
    let base = count / parts;
    let extra = count % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0u64;
    for p in 0..parts {
        let len = (base + usize::from(p < extra)) as u64;
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

fn write_records<W: Write>(out: &mut W, matrix: &EmbeddingMatrix, range: Range<u64>) -> Result<u64> {
    let mut row = vec![0.0f32; matrix.dim()];
    let mut bytes = 0u64;
    for id in range {
        matrix.read(id, &mut row);
        out.write_all(&id.to_le_bytes())?;
        for v in &row {
            out.write_all(&v.to_le_bytes())?;
        }
        bytes += 8 + 4 * row.len() as u64;
    }
    Ok(bytes)
}

/// Write rows `range` of `matrix` to `path`. Returns the uncompressed size.
pub fn write_shard(path: &Path, matrix: &EmbeddingMatrix, range: Range<u64>, compress: bool) -> Result<u64> {
    let file = File::create(path)?;
    let bytes = if compress {
        let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
        let bytes = write_records(&mut enc, matrix, range)?;
        enc.finish()?.flush()?;
        bytes
    } else {
        let mut out = BufWriter::new(file);
        let bytes = write_records(&mut out, matrix, range)?;
        out.flush()?;
        bytes
    };
    debug!(path = %path.display(), bytes, "shard written");
    Ok(bytes)
}

/// Where a shard is written before the whole checkpoint succeeds.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Read a shard into `matrix`, checking every id against `expected`.
pub fn read_shard(path: &Path, matrix: &EmbeddingMatrix, expected: Range<u64>, compressed: bool) -> Result<usize> {
    let mut file = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    if compressed {
        GzDecoder::new(&mut file).read_to_end(&mut buf)?;
    } else {
        file.read_to_end(&mut buf)?;
    }

    let dim = matrix.dim();
    let record = 8 + 4 * dim;
    if buf.len() % record != 0 {
        return Err(Error::Format(format!(
            "{}: {} bytes is not a whole number of {}-byte records",
            path.display(),
            buf.len(),
            record
        )));
    }

    let mut row = vec![0.0f32; dim];
    let mut rows = 0;
    for chunk in buf.chunks_exact(record) {
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&chunk[..8]);
        let id = u64::from_le_bytes(id_bytes);
        let next = expected.start + rows as u64;
        if id != next || !expected.contains(&id) || id as usize >= matrix.len() {
            return Err(Error::Format(format!(
                "{}: found id {id} where {next} was expected (shard range {:?})",
                path.display(),
                expected
            )));
        }
        for (j, v) in chunk[8..].chunks_exact(4).enumerate() {
            row[j] = f32::from_le_bytes([v[0], v[1], v[2], v[3]]);
        }
        matrix.write_row(id, &row)?;
        rows += 1;
    }
    if rows as u64 != expected.end - expected.start {
        return Err(Error::Format(format!(
            "{}: expected {} rows, found {rows}",
            path.display(),
            expected.end - expected.start
        )));
    }
    Ok(rows)
}

/// Write `meta.json` atomically (temp file + rename).
pub fn write_meta(dir: &Path, meta: &ModelMeta) -> Result<()> {
    let tmp = dir.join(format!("{META_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
    fs::rename(&tmp, dir.join(META_FILE))?;
    Ok(())
}

pub fn read_meta(dir: &Path) -> Result<ModelMeta> {
    let text = fs::read_to_string(dir.join(META_FILE))?;
    let meta: ModelMeta = serde_json::from_str(&text)?;
    if meta.format_version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported format version {} (expected {FORMAT_VERSION})",
            meta.format_version
        )));
    }
    Ok(meta)
}

fn load_matrix(dir: &Path, meta: &ModelMeta, kind: MatrixKind, count: usize) -> Result<EmbeddingMatrix> {
    let matrix = EmbeddingMatrix::new(count, meta.dim);
    let mut covered = 0u64;
    for shard in meta.shards.iter().filter(|s| s.kind == kind) {
        read_shard(&dir.join(&shard.file), &matrix, shard.start..shard.end, meta.compressed)?;
        covered += shard.end - shard.start;
    }
    if covered != count as u64 {
        return Err(Error::Format(format!(
            "{} shards cover {covered} of {count} ids",
            kind.prefix()
        )));
    }
    Ok(matrix)
}

/// Load a stored model, reconstructing the shape recorded in `meta.json`.
pub fn load_model(dir: impl AsRef<Path>) -> Result<TrainedModel> {
    let dir = dir.as_ref();
    let meta = read_meta(dir)?;
    let entities = load_matrix(dir, &meta, MatrixKind::Entities, meta.ne)?;
    let relations = load_matrix(dir, &meta, MatrixKind::Relations, meta.nr)?;
    let mut model = TrainedModel::new(entities, relations)?;
    if meta.has_optimizer_state() {
        let pe = load_matrix(dir, &meta, MatrixKind::EntityAccumulators, meta.ne)?;
        let pr = load_matrix(dir, &meta, MatrixKind::RelationAccumulators, meta.nr)?;
        model = model.with_optimizer(OptimizerState::from_matrices(pe, pr)?)?;
    }
    debug!(dir = %dir.display(), ne = meta.ne, nr = meta.nr, dim = meta.dim, "model loaded");
    Ok(model)
}
