//! Chunk splitter: lazy, index-ordered fingerprinting of a source file.
//!
//! The splitter plans the chunk geometry up front, then hands batches of
//! spans to a digest strategy. The pooled strategy fans contiguous batches
//! out to blocking workers (each emits its `Chunks` batch the moment it
//! finishes, so uploads start before the whole file is fingerprinted); the
//! inline strategy digests sequentially with cooperative yields. Either way
//! the whole-file digest folds the per-chunk digests strictly in index
//! order, and `WholeHash` then `Drained` close the stream.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fingerprint::{digest_bytes, fold_digests};
use crate::models::chunk::{plan_chunks, ChunkDescriptor, ChunkSpan};

/// Spans digested between yields in the inline strategy.
const INLINE_BATCH: usize = 4;

/// What the splitter reports while working through a file.
#[derive(Debug)]
pub enum SplitterEvent {
    /// A batch of fingerprinted descriptors. Batches may arrive out of
    /// index order; each descriptor carries its own index.
    Chunks(Vec<ChunkDescriptor>),
    /// The folded whole-file digest. Emitted once, after every chunk.
    WholeHash(String),
    /// Nothing left to digest.
    Drained,
    /// Reading the source failed; the split is abandoned.
    Failed(std::io::Error),
}

/// A digesting strategy: consume ordered spans, emit splitter events.
trait DigestStrategy: Send + Sync {
    fn run(
        &self,
        source: PathBuf,
        spans: Vec<ChunkSpan>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<SplitterEvent>,
    );
}

pub struct Splitter {
    source: PathBuf,
    file_size: u64,
    chunk_size: u64,
    strategy: Box<dyn DigestStrategy>,
    cancel: CancellationToken,
    started: bool,
}

impl Splitter {
    /// `multi_thread` selects the worker-pool strategy; otherwise digesting
    /// runs inline with cooperative yielding.
    pub fn new(source: PathBuf, file_size: u64, chunk_size: u64, multi_thread: bool) -> Self {
        let strategy: Box<dyn DigestStrategy> = if multi_thread {
            Box::new(PooledDigest)
        } else {
            Box::new(InlineDigest)
        };
        Self {
            source,
            file_size,
            chunk_size,
            strategy,
            cancel: CancellationToken::new(),
            started: false,
        }
    }

    /// Begin digesting. Single-shot: a second call is a no-op.
    pub fn split(&mut self, events: mpsc::UnboundedSender<SplitterEvent>) {
        if self.started {
            return;
        }
        self.started = true;

        let spans = plan_chunks(self.file_size, self.chunk_size);
        debug!(
            "splitting {:?}: {} chunks of up to {} bytes",
            self.source,
            spans.len(),
            self.chunk_size
        );
        if spans.is_empty() {
            let _ = events.send(SplitterEvent::WholeHash(fold_digests::<_, &str>([])));
            let _ = events.send(SplitterEvent::Drained);
            return;
        }

        self.strategy
            .run(self.source.clone(), spans, self.cancel.clone(), events);
    }

    /// Tell in-flight digest workers to stop. Cooperative; already-queued
    /// events may still arrive.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

/// Worker-pool digesting on blocking threads.
struct PooledDigest;

impl DigestStrategy for PooledDigest {
    fn run(
        &self,
        source: PathBuf,
        spans: Vec<ChunkSpan>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<SplitterEvent>,
    ) {
        tokio::spawn(async move {
            let workers = available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(spans.len());
            let batch_len = spans.len().div_ceil(workers);

            let mut handles = Vec::with_capacity(workers);
            for batch in spans.chunks(batch_len) {
                let batch = batch.to_vec();
                let source = source.clone();
                let cancel = cancel.clone();
                let events = events.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    digest_batch(&source, &batch, &cancel, &events)
                }));
            }

            let mut digests: Vec<(usize, String)> = Vec::with_capacity(spans.len());
            for handle in handles {
                match handle.await {
                    Ok(Ok(part)) => digests.extend(part),
                    Ok(Err(err)) => {
                        let _ = events.send(SplitterEvent::Failed(err));
                        return;
                    }
                    Err(join_err) => {
                        let _ = events.send(SplitterEvent::Failed(std::io::Error::other(
                            join_err.to_string(),
                        )));
                        return;
                    }
                }
            }

            if cancel.is_cancelled() || digests.len() != spans.len() {
                return;
            }
            digests.sort_by_key(|(index, _)| *index);
            let whole = fold_digests(digests.iter().map(|(_, digest)| digest.as_str()));
            let _ = events.send(SplitterEvent::WholeHash(whole));
            let _ = events.send(SplitterEvent::Drained);
        });
    }
}

/// Digest one contiguous batch of spans, emitting the batch as soon as it
/// completes. Runs on a blocking thread with its own file handle.
fn digest_batch(
    source: &Path,
    batch: &[ChunkSpan],
    cancel: &CancellationToken,
    events: &mpsc::UnboundedSender<SplitterEvent>,
) -> std::io::Result<Vec<(usize, String)>> {
    let mut file = std::fs::File::open(source)?;
    let mut digests = Vec::with_capacity(batch.len());
    let mut descriptors = Vec::with_capacity(batch.len());

    for span in batch {
        if cancel.is_cancelled() {
            return Ok(digests);
        }
        file.seek(SeekFrom::Start(span.start))?;
        let mut buf = vec![0u8; span.len() as usize];
        file.read_exact(&mut buf)?;
        let digest = digest_bytes(&buf);
        descriptors.push(ChunkDescriptor {
            index: span.index,
            start: span.start,
            end: span.end,
            digest: digest.clone(),
        });
        digests.push((span.index, digest));
    }

    let _ = events.send(SplitterEvent::Chunks(descriptors));
    Ok(digests)
}

/// Sequential digesting with cooperative yields between small batches, for
/// when spinning up workers isn't wanted.
struct InlineDigest;

impl DigestStrategy for InlineDigest {
    fn run(
        &self,
        source: PathBuf,
        spans: Vec<ChunkSpan>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<SplitterEvent>,
    ) {
        tokio::spawn(async move {
            let mut file = match tokio::fs::File::open(&source).await {
                Ok(file) => file,
                Err(err) => {
                    let _ = events.send(SplitterEvent::Failed(err));
                    return;
                }
            };

            let mut digests = Vec::with_capacity(spans.len());
            for batch in spans.chunks(INLINE_BATCH) {
                if cancel.is_cancelled() {
                    return;
                }
                let mut descriptors = Vec::with_capacity(batch.len());
                for span in batch {
                    let read = async {
                        file.seek(SeekFrom::Start(span.start)).await?;
                        let mut buf = vec![0u8; span.len() as usize];
                        file.read_exact(&mut buf).await?;
                        Ok::<_, std::io::Error>(buf)
                    }
                    .await;
                    let buf = match read {
                        Ok(buf) => buf,
                        Err(err) => {
                            let _ = events.send(SplitterEvent::Failed(err));
                            return;
                        }
                    };
                    let digest = digest_bytes(&buf);
                    descriptors.push(ChunkDescriptor {
                        index: span.index,
                        start: span.start,
                        end: span.end,
                        digest: digest.clone(),
                    });
                    digests.push(digest);
                }
                let _ = events.send(SplitterEvent::Chunks(descriptors));
                tokio::task::yield_now().await;
            }

            let whole = fold_digests(digests.iter());
            let _ = events.send(SplitterEvent::WholeHash(whole));
            let _ = events.send(SplitterEvent::Drained);
        });
    }
}
