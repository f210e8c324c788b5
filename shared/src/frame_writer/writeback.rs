//! Write-back sink.
//!
//! Frames are written either inline on the capture thread or by a fixed pool
//! of worker threads fed through a bounded channel. In detached mode at most
//! `queue_depth + workers` frames are in flight; what happens when the queue
//! is full is chosen by [`SaturationPolicy`]. [`WriteBackSink::drain`] is the
//! shutdown barrier: it returns only after every accepted frame has been
//! written or has failed.

use super::{FrameEncoder, FrameHeader, FrameRecord, OutputLayout, WriteError};
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Behaviour of a detached sink whose queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// Capture waits for a free slot
    #[default]
    Block,
    /// The frame is discarded and counted as rejected
    Drop,
}

/// Worker pool sizing for a detached sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub when_full: SaturationPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 16,
            when_full: SaturationPolicy::Block,
        }
    }
}

/// Result of handing one frame to the sink
#[derive(Debug)]
pub enum Submission {
    /// Written inline to this path
    Written(PathBuf),
    /// Inline write failed; already logged and counted
    Failed(WriteError),
    /// Accepted by the worker pool
    Queued,
    /// Not accepted; already logged and counted
    Rejected,
}

/// Write-side accounting, shared between workers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteStats {
    pub frames_written: u64,
    pub write_failures: u64,
    pub frames_rejected: u64,
    /// Time spent inside the encoder, summed over all writers
    pub elapsed_writeback: Duration,
    /// Path of the written frame with the highest sequence
    pub last_written_path: Option<PathBuf>,
    pub last_written_sequence: Option<u64>,
}

struct Job {
    record: FrameRecord,
    header: FrameHeader,
}

struct WriterCore {
    encoder: Arc<dyn FrameEncoder>,
    layout: OutputLayout,
    stats: Mutex<WriteStats>,
}

impl WriterCore {
    fn write(&self, job: Job) -> Result<PathBuf, WriteError> {
        let Job { record, header } = job;
        let started = Instant::now();
        let result = self
            .layout
            .path_for(record.sequence, self.encoder.extension())
            .and_then(|path| {
                record.validate()?;
                self.encoder.write(
                    &path,
                    &record,
                    &header,
                    self.layout.compression,
                    self.layout.overwrite,
                )?;
                Ok(path)
            });
        let elapsed = started.elapsed();

        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.elapsed_writeback += elapsed;
        match &result {
            Ok(path) => {
                stats.frames_written += 1;
                if stats
                    .last_written_sequence
                    .map_or(true, |last| record.sequence > last)
                {
                    stats.last_written_sequence = Some(record.sequence);
                    stats.last_written_path = Some(path.clone());
                }
                debug!("Wrote frame {} to {}", record.sequence, path.display());
            }
            Err(e) => {
                stats.write_failures += 1;
                error!("Failed to write frame {}: {}", record.sequence, e);
            }
        }
        result
    }

    fn reject(&self, sequence: u64, reason: &str) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.frames_rejected += 1;
        warn!("Frame {} rejected by write-back: {}", sequence, reason);
    }

    fn snapshot(&self) -> WriteStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

enum Mode {
    Synchronous,
    Detached {
        sender: Option<Sender<Job>>,
        workers: Vec<JoinHandle<()>>,
        when_full: SaturationPolicy,
    },
}

/// Destination for captured frames
pub struct WriteBackSink {
    core: Arc<WriterCore>,
    mode: Mode,
}

impl WriteBackSink {
    /// Write every frame on the submitting thread
    pub fn synchronous(encoder: Arc<dyn FrameEncoder>, layout: OutputLayout) -> Self {
        Self {
            core: Arc::new(WriterCore {
                encoder,
                layout,
                stats: Mutex::new(WriteStats::default()),
            }),
            mode: Mode::Synchronous,
        }
    }

    /// Write frames on a pool of `pool.workers` threads
    ///
    /// Fails only if a worker thread cannot be spawned.
    pub fn detached(
        encoder: Arc<dyn FrameEncoder>,
        layout: OutputLayout,
        pool: PoolConfig,
    ) -> Result<Self, WriteError> {
        let core = Arc::new(WriterCore {
            encoder,
            layout,
            stats: Mutex::new(WriteStats::default()),
        });
        let (sender, receiver) = bounded::<Job>(pool.queue_depth);

        let mut workers = Vec::with_capacity(pool.workers.max(1));
        for index in 0..pool.workers.max(1) {
            let receiver = receiver.clone();
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("writeback-{index}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        // Errors are counted and logged inside the core
                        let _ = core.write(job);
                    }
                    debug!("Write-back worker {} exiting", index);
                })?;
            workers.push(handle);
        }

        debug!(
            "Started {} write-back workers, queue depth {}, {:?} when full",
            workers.len(),
            pool.queue_depth,
            pool.when_full
        );

        Ok(Self {
            core,
            mode: Mode::Detached {
                sender: Some(sender),
                workers,
                when_full: pool.when_full,
            },
        })
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.mode, Mode::Detached { .. })
    }

    /// Hand one frame over. Never fails the caller; problems are counted.
    pub fn submit(&self, record: FrameRecord, header: FrameHeader) -> Submission {
        match &self.mode {
            Mode::Synchronous => match self.core.write(Job { record, header }) {
                Ok(path) => Submission::Written(path),
                Err(e) => Submission::Failed(e),
            },
            Mode::Detached {
                sender, when_full, ..
            } => {
                let Some(sender) = sender else {
                    self.core.reject(record.sequence, "sink already drained");
                    return Submission::Rejected;
                };
                let sequence = record.sequence;
                let job = Job { record, header };
                match when_full {
                    SaturationPolicy::Block => match sender.send(job) {
                        Ok(()) => Submission::Queued,
                        Err(_) => {
                            self.core.reject(sequence, "no write-back workers left");
                            Submission::Rejected
                        }
                    },
                    SaturationPolicy::Drop => match sender.try_send(job) {
                        Ok(()) => Submission::Queued,
                        Err(TrySendError::Full(_)) => {
                            self.core.reject(sequence, "queue full");
                            Submission::Rejected
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            self.core.reject(sequence, "no write-back workers left");
                            Submission::Rejected
                        }
                    },
                }
            }
        }
    }

    /// Current counters without waiting for outstanding writes
    pub fn stats(&self) -> WriteStats {
        self.core.snapshot()
    }

    /// Close the queue, wait for every worker and return the final counters
    pub fn drain(mut self) -> WriteStats {
        self.shutdown();
        self.core.snapshot()
    }

    fn shutdown(&mut self) {
        if let Mode::Detached {
            sender, workers, ..
        } = &mut self.mode
        {
            sender.take();
            for handle in workers.drain(..) {
                let name = handle.thread().name().unwrap_or("writeback").to_string();
                if handle.join().is_err() {
                    error!("Write-back worker {} panicked", name);
                }
            }
        }
    }
}

impl Drop for WriteBackSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
