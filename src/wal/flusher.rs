//! Buffer Flusher: a single long-lived thread draining a shared queue of
//! frozen buffers, one `Flusher` instance servicing any number of `Wal`
//! directories.
//!
//! A dedicated `std::thread` is used rather than a tokio task because the
//! loop performs blocking file I/O (`write_vectored`, `fdatasync`) that must
//! not starve the async executors servicing RPCs.

use crate::error::Result;
use crate::wal::buffer::Buffer;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, warn};

/// Anything a `Buffer` can be flushed into. Implemented by `Wal`
/// (`src/wal/mod.rs`); kept as a trait so the Flusher has no upward
/// dependency on the concrete WAL type and so tests can use a fake target.
pub trait FlushTarget: Send + Sync {
    /// Write `buf`'s records to the active file, sync if configured, and
    /// rotate if the file has grown past `policy.file_size`. A write
    /// failure here is fatal to the owning partition.
    fn flush_buffer(&self, buf: Buffer) -> Result<()>;

    /// Human-readable id for log correlation.
    fn id_str(&self) -> String;
}

struct FlushJob {
    target: Arc<dyn FlushTarget>,
    buffer: Buffer,
}

/// Handle to the flusher thread. Cloning is cheap (it clones the sender);
/// dropping every clone closes the channel and joins the thread.
#[derive(Clone)]
pub struct Flusher {
    tx: Sender<FlushJob>,
}

pub struct FlusherGuard {
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Spawn the dedicated flush thread. Returns the handle used to enqueue
    /// buffers and a guard that joins the thread on drop.
    pub fn spawn() -> (Flusher, FlusherGuard) {
        let (tx, rx) = mpsc::channel::<FlushJob>();
        let handle = std::thread::Builder::new()
            .name("wal-flusher".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if let Err(e) = job.target.flush_buffer(job.buffer) {
                        error!(wal = %job.target.id_str(), error = %e, "flush failed, partition will stop");
                    }
                }
            })
            .expect("failed to spawn wal-flusher thread");

        (Flusher { tx }, FlusherGuard { handle: Some(handle) })
    }

    /// Enqueue a frozen buffer for `target` to be flushed. Non-blocking;
    /// backpressure on the buffer chain (`num_buffers` cap) is enforced by
    /// the caller before this point, not by the flusher's queue depth.
    pub fn enqueue(&self, target: Arc<dyn FlushTarget>, buffer: Buffer) {
        if self.tx.send(FlushJob { target, buffer }).is_err() {
            warn!("flusher thread has shut down; buffer dropped");
        }
    }
}

impl Drop for FlusherGuard {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
