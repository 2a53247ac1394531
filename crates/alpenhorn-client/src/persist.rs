//! Atomic state persistence.
//!
//! Two blobs, two lifetimes. The client state (friends, queues, configs)
//! is long-term and backup-eligible. The keywheel is ephemeral and must
//! never be backed up: restoring an old wheel would resurrect erased
//! rounds and break forward secrecy. Both are written with the same
//! primitive: serialize under a version byte, write to a temp file, fsync,
//! rename over the canonical path.
//!
//! Writes are serialized on one worker so fsyncs never overlap. A failed
//! write is fatal: continuing would let the in-memory state diverge from
//! what a restart will load, so after running the application's pre-exit
//! hook the worker panics.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc;

/// Version byte leading the client-state blob.
pub(crate) const STATE_VERSION: u8 = 1;

/// Hook run just before the engine aborts on a persistence failure, so
/// the embedding application can flush logs.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Write `bytes` to `path` atomically.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

struct Job {
    path: PathBuf,
    bytes: Vec<u8>,
}

/// Handle for queueing persistence writes.
#[derive(Clone)]
pub(crate) struct PersistHandle {
    tx: Option<mpsc::UnboundedSender<Job>>,
}

impl PersistHandle {
    /// A handle that drops every write; used when no path is configured.
    pub(crate) fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a write. Returns immediately; the worker performs the I/O.
    pub(crate) fn write(&self, path: &Path, bytes: Vec<u8>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Job { path: path.to_path_buf(), bytes });
        }
    }
}

/// Start the persistence worker.
pub(crate) fn start_worker(exit_hook: Option<ExitHook>) -> (PersistHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let task = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = tokio::task::spawn_blocking(move || write_atomic(&job.path, &job.bytes))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));

            if let Err(err) = result {
                tracing::error!(error = %err, "state persistence failed");
                if let Some(hook) = &exit_hook {
                    hook();
                }
                panic!("failed to persist state: {err}");
            }
        }
    });
    (PersistHandle { tx: Some(tx) }, task)
}
