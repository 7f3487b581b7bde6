//! Off-thread content fingerprinting
//!
//! A bounded set of long-lived workers consumes hash jobs FIFO. Each job
//! streams its input in fixed-size pieces through an incremental SHA-256
//! state, reporting progress and yielding between pieces so the executor
//! stays responsive.

use crate::error::{FcResult, FileChunkError};
use crate::platform::ContentSource;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default piece size fed to the digest (2 MiB)
pub const DEFAULT_PIECE_SIZE: u64 = 2 * 1024 * 1024;

/// Progress callback, invoked with a percentage in 0..=100
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// A contiguous byte range of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

/// Input accepted by [`HashPool::hash`]
#[derive(Clone)]
pub enum HashInput {
    /// Hash the whole source front to back
    Source(Arc<dyn ContentSource>),
    /// Hash a declared ordered chunking of the source
    Ranges {
        source: Arc<dyn ContentSource>,
        ranges: Vec<ByteRange>,
    },
}

impl HashInput {
    fn total_len(&self) -> u64 {
        match self {
            HashInput::Source(source) => source.len(),
            HashInput::Ranges { ranges, .. } => ranges.iter().map(|r| r.len).sum(),
        }
    }
}

/// Options for a single hash job
#[derive(Default, Clone)]
pub struct HashOptions {
    /// Piece size; defaults to [`DEFAULT_PIECE_SIZE`]
    pub chunk_size: Option<u64>,
    /// Progress callback with a percentage after every piece
    pub on_progress: Option<ProgressFn>,
    /// Cancellation, checked between pieces
    pub cancel: Option<CancellationToken>,
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct HashPoolConfig {
    /// Number of long-lived workers. 0 means no background executor exists
    /// on this host and every job fails with `ENVIRONMENT_UNSUPPORTED`.
    pub max_workers: usize,
}

impl Default for HashPoolConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

struct HashJob {
    input: HashInput,
    opts: HashOptions,
    attempt: u32,
    reply: oneshot::Sender<FcResult<String>>,
}

/// Worker pool computing content fingerprints
pub struct HashPool {
    config: HashPoolConfig,
    job_tx: Option<mpsc::UnboundedSender<HashJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl HashPool {
    pub fn new(config: HashPoolConfig) -> Self {
        if config.max_workers == 0 {
            return Self {
                config,
                job_tx: None,
                workers: Vec::new(),
            };
        }

        let (job_tx, job_rx) = mpsc::unbounded_channel::<HashJob>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(config.max_workers);
        for worker_id in 0..config.max_workers {
            let rx = Arc::clone(&job_rx);
            let requeue_tx = job_tx.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, requeue_tx).await;
            }));
        }

        info!(target: "hasher", workers = config.max_workers, "Hash pool started");
        Self {
            config,
            job_tx: Some(job_tx),
            workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Queue a job and wait for its fingerprint.
    pub async fn hash(&self, input: HashInput, opts: HashOptions) -> FcResult<String> {
        let job_tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| FileChunkError::unsupported("no background hash executor available"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        job_tx
            .send(HashJob {
                input,
                opts,
                attempt: 0,
                reply: reply_tx,
            })
            .map_err(|_| FileChunkError::worker("hash pool is shut down"))?;

        reply_rx
            .await
            .map_err(|_| FileChunkError::worker("hash worker dropped the job"))?
    }

    /// Stop all workers. Queued jobs are abandoned.
    pub fn shutdown(&mut self) {
        self.job_tx = None;
        for handle in self.workers.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for HashPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker_loop(
    worker_id: usize,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<HashJob>>>,
    requeue_tx: mpsc::UnboundedSender<HashJob>,
) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!(target: "hasher", worker_id, "Hash worker stopping");
            break;
        };

        // Run the job in its own task so a panic takes down the executor,
        // not the worker loop; the loop is the replacement.
        let input = job.input.clone();
        let opts = job.opts.clone();
        let executor = tokio::spawn(async move { run_hash(input, opts).await });

        match executor.await {
            Ok(result) => {
                let _ = job.reply.send(result);
            }
            Err(join_err) => {
                warn!(
                    target: "hasher",
                    worker_id,
                    attempt = job.attempt,
                    error = %join_err,
                    "Hash executor crashed, replacing"
                );
                if job.attempt == 0 {
                    // Budget: one replacement per job
                    let requeued = requeue_tx.send(HashJob {
                        input: job.input,
                        opts: job.opts,
                        attempt: 1,
                        reply: job.reply,
                    });
                    if let Err(send_err) = requeued {
                        let _ = send_err.0.reply.send(Err(FileChunkError::worker(
                            "hash pool shut down while re-queueing crashed job",
                        )));
                    }
                } else {
                    let _ = job.reply.send(Err(FileChunkError::worker(
                        "hash executor crashed twice for the same job",
                    )));
                }
            }
        }
    }
}

async fn run_hash(input: HashInput, opts: HashOptions) -> FcResult<String> {
    let piece_size = opts.chunk_size.unwrap_or(DEFAULT_PIECE_SIZE).max(1);
    let total = input.total_len();
    let mut hasher = Sha256::new();
    let mut processed: u64 = 0;

    let ranges: Vec<(Arc<dyn ContentSource>, ByteRange)> = match &input {
        HashInput::Source(source) => vec![(
            Arc::clone(source),
            ByteRange {
                offset: 0,
                len: source.len(),
            },
        )],
        HashInput::Ranges { source, ranges } => ranges
            .iter()
            .map(|range| (Arc::clone(source), *range))
            .collect(),
    };

    for (source, range) in ranges {
        let mut offset = range.offset;
        let end = range.offset + range.len;
        while offset < end {
            if let Some(cancel) = &opts.cancel {
                if cancel.is_cancelled() {
                    return Err(FileChunkError::cancelled());
                }
            }

            let piece_len = piece_size.min(end - offset);
            let piece = source.read_range(offset, piece_len).await?;
            hasher.update(&piece);
            offset += piece_len;
            processed += piece_len;

            if let Some(on_progress) = &opts.on_progress {
                let percent = if total == 0 {
                    100.0
                } else {
                    (processed as f64 / total as f64) * 100.0
                };
                on_progress(percent);
            }

            // Cooperative yield so one job cannot monopolise the executor
            tokio::task::yield_now().await;
        }
    }

    if total == 0 {
        if let Some(on_progress) = &opts.on_progress {
            on_progress(100.0);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}
