//! Concrete `ExportSink`/`CheckpointSink` implementations: bincode-serialize
//! onto a background worker thread so a slow disk never stalls the
//! timestep loop.

use crate::errors::*;
use crate::output::path::OutputPath;
use stochasticpic::output::{CheckpointMeta, CheckpointSink, EnsembleCheckpoint, ExportSink, ExportSnapshot};

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

struct WriteJob {
    path: PathBuf,
    bytes: Vec<u8>,
}

/// Owns an `mpsc` queue and a single writer thread; `append` never blocks on
/// disk I/O, `quit` drains the queue and joins the thread.
pub struct Worker {
    tx: Sender<WriteJob>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new() -> Worker {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let handle = std::thread::spawn(move || {
            for job in rx {
                if let Err(e) = write_file(&job.path, &job.bytes) {
                    log::error!("output worker: failed to write {}: {}", job.path.display(), e);
                }
            }
        });
        Worker { tx, handle: Some(handle) }
    }

    fn append(&self, path: PathBuf, bytes: Vec<u8>) {
        // The receiver only drops once `quit` joins the thread, so this send
        // cannot fail in practice.
        let _ = self.tx.send(WriteJob { path, bytes });
    }

    /// Drains the queue and joins the writer thread. Called once at the end
    /// of the run so every queued write has actually landed on disk before
    /// the process exits.
    pub fn quit(mut self) {
        let handle = self.handle.take();
        drop(self);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_file(path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)
}

/// Writes one export snapshot per call, bincode-serialized, named by its
/// timestep.
pub struct FileExportSink {
    path: OutputPath,
    worker: std::rc::Rc<Worker>,
}

impl FileExportSink {
    pub fn new(path: OutputPath, worker: std::rc::Rc<Worker>) -> FileExportSink {
        FileExportSink { path, worker }
    }
}

impl ExportSink for FileExportSink {
    fn write_export(&mut self, snapshot: &ExportSnapshot) -> std::io::Result<()> {
        let bytes = serde_bincode_export(snapshot);
        let file = self.path.with_extension(&format!("{:010}.export", snapshot.timestep));
        self.worker.append(file, bytes);
        Ok(())
    }
}

/// Writes one checkpoint per call, bincode-serialized, named by its
/// timestep.
pub struct FileCheckpointSink {
    path: OutputPath,
    worker: std::rc::Rc<Worker>,
}

impl FileCheckpointSink {
    pub fn new(path: OutputPath, worker: std::rc::Rc<Worker>) -> FileCheckpointSink {
        FileCheckpointSink { path, worker }
    }
}

impl CheckpointSink for FileCheckpointSink {
    fn write_checkpoint(&mut self, meta: &CheckpointMeta, parts: &[EnsembleCheckpoint]) -> std::io::Result<()> {
        let bytes = bincode::serialize(&(meta, parts)).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let file = self.path.with_extension(&format!("{:010}.ckpt", meta.timestep));
        self.worker.append(file, bytes);
        Ok(())
    }
}

/// `ExportSnapshot` is not itself `Serialize` (its arrays carry no stable
/// wire-format requirement beyond what this binary needs), so the sink
/// flattens it into a bincode-friendly tuple of its fields rather than
/// deriving on the library type.
fn serde_bincode_export(snapshot: &ExportSnapshot) -> Vec<u8> {
    bincode::serialize(&(
        snapshot.timestep,
        snapshot.downsample_ratio,
        &snapshot.e.components,
        &snapshot.b.components,
        &snapshot.j4x.components,
        &snapshot.e_para_b,
        &snapshot.e_dot_j,
        &snapshot.flux,
        &snapshot.pair_creation_rate,
        &snapshot.volume_scale,
        snapshot.skin_depth,
        &snapshot.j_by_species,
    ))
    .expect("export snapshot serializes")
}

/// Reads a checkpoint written by [`FileCheckpointSink`] back off disk, for
/// `--resume`.
pub fn load_checkpoint(file: &PathBuf) -> Result<(CheckpointMeta, Vec<EnsembleCheckpoint>)> {
    let bytes = std::fs::read(file).chain_err(|| format!("Unable to read checkpoint file '{}'", file.display()))?;
    let (meta, parts): (CheckpointMeta, Vec<EnsembleCheckpoint>) =
        bincode::deserialize(&bytes).chain_err(|| "Unable to deserialize checkpoint file.")?;
    Ok((meta, parts))
}
