//! Optional gradient tracing.
//!
//! Workers report every merged [`GradientContribution`](crate::gradient::GradientContribution)
//! to the tracer when one is installed. Tracers observe; they never influence
//! training.

use crate::error::Result;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Which matrix an update went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Entity,
    Relation,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "E",
            Self::Relation => "R",
        }
    }
}

/// One merged gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientEvent {
    pub epoch: u32,
    pub kind: ParamKind,
    pub id: u64,
    /// Row contributions summed into this update.
    pub n: u32,
    /// L2 norm of the summed gradient.
    pub norm: f32,
    pub conflict: bool,
}

/// Sink for gradient events. Called concurrently from every worker.
pub trait GradientTracer: Send + Sync {
    fn record(&self, event: &GradientEvent);

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends events as CSV lines: `epoch,kind,id,n,norm,conflict`.
pub struct FileTracer {
    out: Mutex<BufWriter<File>>,
}

impl FileTracer {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        writeln!(out, "epoch,kind,id,n,norm,conflict")?;
        Ok(Self { out: Mutex::new(out) })
    }
}

impl GradientTracer for FileTracer {
    fn record(&self, e: &GradientEvent) {
        let mut out = self.out.lock();
        if let Err(err) = writeln!(
            out,
            "{},{},{},{},{},{}",
            e.epoch,
            e.kind.as_str(),
            e.id,
            e.n,
            e.norm,
            e.conflict as u8
        ) {
            warn!("gradient trace write failed: {}", err);
        }
    }

    fn flush(&self) -> Result<()> {
        self.out.lock().flush()?;
        Ok(())
    }
}

impl Drop for FileTracer {
    fn drop(&mut self) {
        let _ = self.out.get_mut().flush();
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct MemoryTracer {
    events: Mutex<Vec<GradientEvent>>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GradientEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GradientTracer for MemoryTracer {
    fn record(&self, event: &GradientEvent) {
        self.events.lock().push(event.clone());
    }
}
