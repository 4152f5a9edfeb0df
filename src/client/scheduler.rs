//! Adaptive chunk transfer scheduler.
//!
//! Keeps at most `parallelism` chunk sends in flight, retries each failed
//! chunk on its own with exponential backoff and feeds every outcome to the
//! [`AdaptiveTuner`]. A chunk waiting out its backoff does not hold a send
//! slot, so other chunks keep moving meanwhile. Finalization is driven by the server: whatever it
//! reports missing is resent before finalize is tried again.

use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    planner::{ChunkPlan, ChunkSource, ChunkSpan},
    transport::{ChunkTransport, TransferError},
    tuning::{AdaptiveTuner, SpeedSample, Tuning, TuningConfig},
};
use crate::models::api::{ChunkAck, FinalizedFile, InitUploadRequest};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("chunk {chunk_index} of session {session_id} failed: {source}")]
    ChunkFailed {
        session_id: String,
        chunk_index: u64,
        source: TransferError,
    },
    #[error("transfer of session {session_id} cancelled")]
    Cancelled { session_id: String },
    #[error("reading source failed: {0}")]
    Io(#[from] io::Error),
    #[error("session {session_id} still missing {} chunk(s) after finalize retries", missing.len())]
    FinalizeExhausted { session_id: String, missing: Vec<u64> },
    #[error("source splits into {actual} chunks but session {session_id} expects {expected}")]
    SourceMismatch {
        session_id: String,
        expected: u64,
        actual: u64,
    },
}

impl ClientError {
    /// Session the caller can pass to [`Uploader::resume`], when one exists.
    pub fn resumable_session(&self) -> Option<&str> {
        match self {
            ClientError::ChunkFailed { session_id, .. }
            | ClientError::Cancelled { session_id }
            | ClientError::FinalizeExhausted { session_id, .. } => Some(session_id.as_str()),
            _ => None,
        }
    }
}

/// Exponential backoff for retryable failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed`-th failed attempt (1-based).
    pub fn delay_for(&self, failed: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Sending,
    Sent,
    Failed,
}

/// Snapshot published on the progress channel. Counts come from server acks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferProgress {
    pub session_id: String,
    pub uploaded_count: u64,
    pub total_chunks: u64,
    pub progress_percent: f64,
    pub chunk_size: u64,
    pub parallelism: usize,
    /// Bytes per second over the tuner's current sample window.
    pub throughput: u64,
}

#[derive(Clone, Debug)]
pub struct UploaderConfig {
    pub retry: RetryPolicy,
    pub tuning: TuningConfig,
    pub initial: Tuning,
    pub max_finalize_rounds: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            tuning: TuningConfig::default(),
            initial: Tuning {
                chunk_size: 5 * 1024 * 1024,
                parallelism: 2,
            },
            max_finalize_rounds: 3,
        }
    }
}

enum ChunkError {
    Transfer(TransferError),
    Io(io::Error),
}

/// The span, which attempt it was (1-based), and how it went.
type ChunkOutcome = (ChunkSpan, u32, Result<ChunkAck, ChunkError>);

fn lock(tuner: &Mutex<AdaptiveTuner>) -> MutexGuard<'_, AdaptiveTuner> {
    tuner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Uploader<T: ChunkTransport> {
    transport: Arc<T>,
    tuner: Arc<Mutex<AdaptiveTuner>>,
    retry: RetryPolicy,
    max_finalize_rounds: usize,
    cancel: CancellationToken,
    progress: watch::Sender<TransferProgress>,
}

impl<T: ChunkTransport> Uploader<T> {
    pub fn new(transport: Arc<T>, config: UploaderConfig) -> Self {
        let tuner = AdaptiveTuner::new(config.tuning, config.initial);
        let (progress, _) = watch::channel(TransferProgress::default());
        Self {
            transport,
            tuner: Arc::new(Mutex::new(tuner)),
            retry: config.retry,
            max_finalize_rounds: config.max_finalize_rounds,
            cancel: CancellationToken::new(),
            progress,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    pub fn tuning(&self) -> Tuning {
        lock(&self.tuner).current()
    }

    fn tuning_and_throughput(&self) -> (Tuning, u64) {
        let tuner = lock(&self.tuner);
        (tuner.current(), tuner.throughput())
    }

    /// Open a session for `source`, send every chunk and finalize.
    pub async fn upload<S: ChunkSource>(
        &self,
        source: Arc<S>,
        file_name: &str,
        mime_type: &str,
        destination_folder: Option<String>,
    ) -> Result<FinalizedFile, ClientError> {
        let req = InitUploadRequest {
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            total_size: source.total_size(),
            destination_folder,
            chunk_size: Some(self.tuning().chunk_size),
        };
        let init = self.with_retry("init", || self.transport.init(&req)).await?;
        info!(
            session_id = %init.session_id,
            total_chunks = init.total_chunks,
            chunk_size = init.chunk_size,
            "upload session opened"
        );

        let plan = ChunkPlan::new(source.total_size(), init.chunk_size);
        if plan.total_chunks != init.total_chunks {
            return Err(ClientError::SourceMismatch {
                session_id: init.session_id,
                expected: init.total_chunks,
                actual: plan.total_chunks,
            });
        }
        self.publish_start(&init.session_id, 0, plan.total_chunks);
        let all = plan.spans().map(|span| span.index).collect();
        self.drive(&init.session_id, &plan, &source, all).await
    }

    /// Continue an earlier session: send only what the server has not recorded.
    pub async fn resume<S: ChunkSource>(
        &self,
        session_id: &str,
        source: Arc<S>,
    ) -> Result<FinalizedFile, ClientError> {
        let status = match self
            .with_retry("status", || self.transport.status(session_id))
            .await
        {
            Ok(status) => status,
            Err(TransferError::NotFound(msg)) => {
                // finalized by an earlier run whose response was lost
                return match self.transport.lookup_file(session_id).await? {
                    Some(file) => Ok(file),
                    None => Err(TransferError::NotFound(msg).into()),
                };
            }
            Err(err) => return Err(err.into()),
        };

        let plan = ChunkPlan::new(source.total_size(), status.chunk_size);
        if plan.total_chunks != status.total_chunks {
            return Err(ClientError::SourceMismatch {
                session_id: session_id.to_string(),
                expected: status.total_chunks,
                actual: plan.total_chunks,
            });
        }

        let pending = plan.pending(&status.uploaded_indices);
        info!(
            session_id,
            recorded = status.uploaded_count,
            pending = pending.len(),
            "resuming upload"
        );
        self.publish_start(session_id, status.uploaded_count, plan.total_chunks);
        self.drive(session_id, &plan, &source, pending).await
    }

    async fn drive<S: ChunkSource>(
        &self,
        session_id: &str,
        plan: &ChunkPlan,
        source: &Arc<S>,
        mut pending: Vec<u64>,
    ) -> Result<FinalizedFile, ClientError> {
        let mut rounds = 0;
        loop {
            if !pending.is_empty() {
                self.transfer(session_id, plan, source, pending).await?;
            }

            match self
                .with_retry("finalize", || self.transport.finalize(session_id))
                .await
            {
                Ok(file) => {
                    info!(session_id, file_id = %file.file_id, size_bytes = file.size_bytes, "upload finalized");
                    return Ok(file);
                }
                Err(TransferError::Incomplete { missing }) => {
                    rounds += 1;
                    if rounds > self.max_finalize_rounds {
                        return Err(ClientError::FinalizeExhausted {
                            session_id: session_id.to_string(),
                            missing,
                        });
                    }
                    warn!(session_id, missing = ?missing, round = rounds, "server reports missing chunks, resending");
                    pending = missing;
                }
                Err(TransferError::NotFound(msg)) => {
                    // A previous attempt may have finalized before its response was lost.
                    return match self.transport.lookup_file(session_id).await? {
                        Some(file) => {
                            info!(session_id, file_id = %file.file_id, "session already finalized");
                            Ok(file)
                        }
                        None => Err(TransferError::NotFound(msg).into()),
                    };
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send `indices` with bounded parallelism. Stops dispatching on the first
    /// terminal chunk failure or on cancellation, then drains what is in flight.
    ///
    /// A retryable failure parks the chunk in `backoff` until its delay
    /// elapses, then puts it at the front of the queue.
    async fn transfer<S: ChunkSource>(
        &self,
        session_id: &str,
        plan: &ChunkPlan,
        source: &Arc<S>,
        indices: Vec<u64>,
    ) -> Result<(), ClientError> {
        let mut queue: VecDeque<ChunkSpan> =
            indices.iter().filter_map(|&i| plan.span(i)).collect();
        let mut states: BTreeMap<u64, ChunkState> = queue
            .iter()
            .map(|span| (span.index, ChunkState::Pending))
            .collect();
        let mut attempts: HashMap<u64, u32> = HashMap::new();
        let mut in_flight: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut backoff: JoinSet<ChunkSpan> = JoinSet::new();
        let mut failure: Option<ClientError> = None;
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
            }
            let stopping = failure.is_some() || cancelled;
            if stopping && !backoff.is_empty() {
                // chunks waiting for a retry are simply not sent again
                backoff.shutdown().await;
            }

            while !stopping && in_flight.len() < self.tuning().parallelism {
                let Some(span) = queue.pop_front() else {
                    break;
                };
                let attempt = attempts.entry(span.index).or_default();
                *attempt += 1;
                states.insert(span.index, ChunkState::Sending);
                in_flight.spawn(send_chunk(
                    self.transport.clone(),
                    self.tuner.clone(),
                    session_id.to_string(),
                    source.clone(),
                    span,
                    *attempt,
                ));
            }

            if in_flight.is_empty() && backoff.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {
                    info!(session_id, in_flight = in_flight.len(), "transfer cancelled, draining in-flight chunks");
                    cancelled = true;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((span, _, Ok(ack))) => {
                            states.insert(span.index, ChunkState::Sent);
                            self.record_ack(&ack);
                        }
                        Ok((span, attempt, Err(ChunkError::Transfer(err))))
                            if err.is_retryable()
                                && attempt < self.retry.attempts
                                && failure.is_none()
                                && !cancelled =>
                        {
                            let delay = self.retry.delay_for(attempt);
                            debug!(session_id, chunk_index = span.index, attempt, error = %err, ?delay, "retrying chunk");
                            states.insert(span.index, ChunkState::Pending);
                            backoff.spawn(async move {
                                tokio::time::sleep(delay).await;
                                span
                            });
                        }
                        Ok((span, attempt, Err(err))) => {
                            states.insert(span.index, ChunkState::Failed);
                            if failure.is_none() {
                                failure = Some(match err {
                                    ChunkError::Transfer(cause) => {
                                        warn!(session_id, chunk_index = span.index, attempt, error = %cause, "chunk failed");
                                        ClientError::ChunkFailed {
                                            session_id: session_id.to_string(),
                                            chunk_index: span.index,
                                            source: cause,
                                        }
                                    }
                                    ChunkError::Io(err) => ClientError::Io(err),
                                });
                            }
                        }
                        Err(join_err) => {
                            failure.get_or_insert(ClientError::Io(io::Error::other(join_err)));
                        }
                    }
                }
                Some(ready) = backoff.join_next(), if !backoff.is_empty() => {
                    match ready {
                        Ok(span) => queue.push_front(span),
                        Err(join_err) => {
                            failure.get_or_insert(ClientError::Io(io::Error::other(join_err)));
                        }
                    }
                }
            }
        }

        let sent = states.values().filter(|s| **s == ChunkState::Sent).count();
        debug!(session_id, sent, total = states.len(), "transfer pass finished");

        if let Some(err) = failure {
            return Err(err);
        }
        if cancelled {
            return Err(ClientError::Cancelled {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    async fn with_retry<R, F, Fut>(&self, op: &'static str, mut call: F) -> Result<R, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, TransferError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(err) if err.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(op, attempt, error = %err, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn publish_start(&self, session_id: &str, uploaded_count: u64, total_chunks: u64) {
        let (tuning, throughput) = self.tuning_and_throughput();
        self.progress.send_replace(TransferProgress {
            session_id: session_id.to_string(),
            uploaded_count,
            total_chunks,
            progress_percent: percent(uploaded_count, total_chunks),
            chunk_size: tuning.chunk_size,
            parallelism: tuning.parallelism,
            throughput,
        });
    }

    fn record_ack(&self, ack: &ChunkAck) {
        let (tuning, throughput) = self.tuning_and_throughput();
        self.progress.send_modify(|progress| {
            // acks can arrive out of order; keep the highest ledger count
            if ack.uploaded_count >= progress.uploaded_count {
                progress.uploaded_count = ack.uploaded_count;
                progress.progress_percent = ack.progress_percent;
            }
            progress.total_chunks = ack.total_chunks;
            progress.chunk_size = tuning.chunk_size;
            progress.parallelism = tuning.parallelism;
            progress.throughput = throughput;
        });
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 * 10_000.0 / total as f64).round() / 100.0
}

/// One attempt at one chunk: read on dispatch, send, report to the tuner.
async fn send_chunk<T: ChunkTransport, S: ChunkSource>(
    transport: Arc<T>,
    tuner: Arc<Mutex<AdaptiveTuner>>,
    session_id: String,
    source: Arc<S>,
    span: ChunkSpan,
    attempt: u32,
) -> ChunkOutcome {
    let bytes: Bytes = match source.read(span).await {
        Ok(bytes) => bytes,
        Err(err) => return (span, attempt, Err(ChunkError::Io(err))),
    };

    let started = Instant::now();
    match transport.send_chunk(&session_id, span.index, bytes).await {
        Ok(ack) => {
            lock(&tuner).on_success(SpeedSample::new(span.len, started.elapsed()));
            debug!(session_id, chunk_index = span.index, attempt, "chunk sent");
            (span, attempt, Ok(ack))
        }
        Err(err) => {
            lock(&tuner).on_failure();
            (span, attempt, Err(ChunkError::Transfer(err)))
        }
    }
}
