//! Upload controller: the session state machine.
//!
//! One event-loop task owns all session state. Digest workers, chunk-upload
//! tasks, retry timers and the scheduler all talk to it through messages, so
//! state mutation is confined to the loop and completion can be gated by a
//! one-shot flag even when whole-file dedup races the scheduler's drain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::events::{Progress, UploadError, UploadEvent, UploadStatus};
use super::scheduler::{PoolEvent, TaskPool};
use super::splitter::{Splitter, SplitterEvent};
use super::transport::{FileMeta, ProgressFn, TransportError, UploadTransport};
use crate::models::chunk::{plan_chunks, ChunkDescriptor, ChunkSpan, DEFAULT_CHUNK_SIZE};
use crate::models::protocol::{HashKind, VerifyResponse};

/// Recognized options; every field has a sensible default.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Requested piece size. The server's initiate response wins.
    pub chunk_size: u64,
    /// Max in-flight chunk transfers.
    pub concurrency: usize,
    /// Max retries per chunk.
    pub retry_count: u32,
    /// Base retry delay; backoff doubles it per attempt with half-jitter.
    pub retry_delay: Duration,
    /// Digest on a worker pool instead of inline.
    pub multi_thread_digest: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 3,
            retry_count: 3,
            retry_delay: Duration::from_millis(1000),
            multi_thread_digest: true,
        }
    }
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_multi_thread_digest(mut self, multi_thread: bool) -> Self {
        self.multi_thread_digest = multi_thread;
        self
    }
}

/// Control surface for a running upload.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl ControllerHandle {
    /// Stop dispatching new transfers; in-flight ones finish.
    pub fn pause(&self) {
        let _ = self.tx.send(Msg::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(Msg::Resume);
    }

    /// End the session. Pending work is dropped, the server-side record is
    /// left behind for a later attempt, and no `Complete`/`Error` fires.
    pub fn cancel(&self) {
        let _ = self.tx.send(Msg::Cancel);
    }
}

pub struct UploadController {
    source: PathBuf,
    options: UploadOptions,
    transport: Arc<dyn UploadTransport>,
}

impl UploadController {
    pub fn new(
        source: impl Into<PathBuf>,
        options: UploadOptions,
        transport: Arc<dyn UploadTransport>,
    ) -> Self {
        Self {
            source: source.into(),
            options,
            transport,
        }
    }

    /// Begin the upload. Returns the control handle and the event stream;
    /// the stream closes when the session ends.
    pub fn start(self) -> (ControllerHandle, mpsc::UnboundedReceiver<UploadEvent>) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = ControllerHandle { tx: msg_tx.clone() };
        tokio::spawn(run(self, msg_tx, msg_rx, event_tx));
        (handle, event_rx)
    }
}

enum Msg {
    Pause,
    Resume,
    Cancel,
    ChunkDone { index: usize },
    ChunkFailed { index: usize, error: TransportError },
    RetryReady { index: usize },
    VerifyFile(Result<VerifyResponse, TransportError>),
    MergeDone(Result<String, TransportError>),
}

async fn run(
    controller: UploadController,
    msg_tx: mpsc::UnboundedSender<Msg>,
    mut msg_rx: mpsc::UnboundedReceiver<Msg>,
    event_tx: mpsc::UnboundedSender<UploadEvent>,
) {
    let UploadController {
        source,
        options,
        transport,
    } = controller;

    let _ = event_tx.send(UploadEvent::StatusChange(UploadStatus::Splitting));

    // Gather file metadata and register the session.
    let metadata = match tokio::fs::metadata(&source).await {
        Ok(metadata) => metadata,
        Err(err) => {
            let _ = event_tx.send(UploadEvent::StatusChange(UploadStatus::Error));
            let _ = event_tx.send(UploadEvent::Error(UploadError::Read(err)));
            return;
        }
    };
    let file_meta = FileMeta {
        file_name: source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload.bin")
            .to_string(),
        file_size: metadata.len(),
        file_type: "application/octet-stream".to_string(),
        last_modified: metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
    };

    let initiated = match transport.initiate(&file_meta).await {
        Ok(initiated) => initiated,
        Err(err) => {
            let _ = event_tx.send(UploadEvent::StatusChange(UploadStatus::Error));
            let _ = event_tx.send(UploadEvent::Error(UploadError::Transport(err)));
            return;
        }
    };
    // The server's piece size wins.
    let chunk_size = if initiated.chunk_size > 0 {
        initiated.chunk_size
    } else {
        options.chunk_size
    };
    let spans = plan_chunks(file_meta.file_size, chunk_size);

    let (pool_tx, mut pool_rx) = mpsc::unbounded_channel();
    let pool = TaskPool::spawn(options.concurrency, pool_tx);

    let (split_tx, mut split_rx) = mpsc::unbounded_channel();
    let mut splitter = Splitter::new(
        source.clone(),
        file_meta.file_size,
        chunk_size,
        options.multi_thread_digest,
    );
    splitter.split(split_tx);

    let mut session = Session {
        source,
        options,
        transport,
        msg_tx,
        event_tx,
        pool,
        splitter,
        status: UploadStatus::Splitting,
        token: initiated.upload_token,
        file_size: file_meta.file_size,
        spans,
        descriptors: BTreeMap::new(),
        uploaded: Arc::new(Mutex::new(HashSet::new())),
        retries: HashMap::new(),
        uploaded_bytes: 0,
        whole_hash: None,
        drained: false,
        merging: false,
        finished: false,
        terminated: false,
        last_progress_at: Instant::now(),
        last_progress_bytes: 0,
    };

    while !session.terminated {
        tokio::select! {
            Some(msg) = msg_rx.recv() => session.handle_msg(msg),
            Some(event) = split_rx.recv() => session.handle_splitter(event),
            Some(event) = pool_rx.recv() => session.handle_pool(event),
            else => break,
        }
    }
}

struct Session {
    source: PathBuf,
    options: UploadOptions,
    transport: Arc<dyn UploadTransport>,
    msg_tx: mpsc::UnboundedSender<Msg>,
    event_tx: mpsc::UnboundedSender<UploadEvent>,
    pool: TaskPool,
    splitter: Splitter,

    status: UploadStatus,
    token: String,
    file_size: u64,
    spans: Vec<ChunkSpan>,
    descriptors: BTreeMap<usize, ChunkDescriptor>,
    /// Mutated only by this loop; chunk tasks hold a read-side clone for the
    /// in-session dedup check.
    uploaded: Arc<Mutex<HashSet<usize>>>,
    retries: HashMap<usize, u32>,
    uploaded_bytes: u64,
    whole_hash: Option<String>,
    drained: bool,
    merging: bool,
    /// One-shot completion gate: set by the first of success and failure.
    finished: bool,
    terminated: bool,
    last_progress_at: Instant,
    last_progress_bytes: u64,
}

impl Session {
    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Pause => {
                if self.status == UploadStatus::Uploading {
                    self.pool.pause();
                    self.set_status(UploadStatus::Paused);
                }
            }
            Msg::Resume => {
                if self.status == UploadStatus::Paused {
                    self.pool.start();
                    self.set_status(UploadStatus::Uploading);
                }
            }
            Msg::Cancel => {
                if !matches!(self.status, UploadStatus::Completed | UploadStatus::Error) {
                    self.pool.clear();
                    self.splitter.dispose();
                    self.set_status(UploadStatus::Idle);
                    self.terminated = true;
                }
            }
            Msg::ChunkDone { index } => {
                self.mark_uploaded(index);
                self.maybe_merge();
            }
            Msg::ChunkFailed { index, error } => self.handle_chunk_failure(index, error),
            Msg::RetryReady { index } => {
                if self.finished || self.terminated {
                    return;
                }
                if let Some(descriptor) = self.descriptors.get(&index).cloned() {
                    self.enqueue_chunk(descriptor);
                }
            }
            Msg::VerifyFile(result) => self.handle_file_verify(result),
            Msg::MergeDone(Ok(url)) => self.handle_success(url),
            Msg::MergeDone(Err(err)) => self.fail(UploadError::Transport(err)),
        }
    }

    fn handle_splitter(&mut self, event: SplitterEvent) {
        match event {
            SplitterEvent::Chunks(batch) => {
                for descriptor in batch {
                    self.descriptors.insert(descriptor.index, descriptor.clone());
                    self.enqueue_chunk(descriptor);
                }
                if self.status == UploadStatus::Splitting {
                    self.set_status(UploadStatus::Uploading);
                }
            }
            SplitterEvent::WholeHash(hash) => {
                self.whole_hash = Some(hash.clone());
                // Side-check for an already-known file while chunks upload.
                let transport = Arc::clone(&self.transport);
                let token = self.token.clone();
                let msg_tx = self.msg_tx.clone();
                tokio::spawn(async move {
                    let result = transport.verify(&token, &hash, HashKind::File, None).await;
                    let _ = msg_tx.send(Msg::VerifyFile(result));
                });
                self.maybe_merge();
            }
            SplitterEvent::Drained => {}
            SplitterEvent::Failed(err) => self.fail(UploadError::Read(err)),
        }
    }

    fn handle_pool(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Started => self.drained = false,
            PoolEvent::Paused => {}
            PoolEvent::Drained => {
                self.drained = true;
                self.maybe_merge();
            }
        }
    }

    fn handle_file_verify(&mut self, result: Result<VerifyResponse, TransportError>) {
        match result {
            Ok(response) if response.has_file => {
                if let Some(url) = response.url {
                    self.handle_success(url);
                } else {
                    warn!("file-level dedup hit without a url; continuing normally");
                }
            }
            Ok(response) => {
                // Chunks the server already holds don't need transfers.
                if let Some(rest) = response.rest {
                    let needed: HashSet<&str> = rest.iter().map(String::as_str).collect();
                    let known: Vec<usize> = self
                        .descriptors
                        .values()
                        .filter(|d| !needed.contains(d.digest.as_str()))
                        .map(|d| d.index)
                        .collect();
                    for index in known {
                        self.mark_uploaded(index);
                    }
                    self.maybe_merge();
                }
            }
            Err(err) => {
                // The side-check is an optimization; the per-chunk path still
                // makes progress, so don't kill the session over it.
                warn!("whole-file verify failed: {}", err);
            }
        }
    }

    fn enqueue_chunk(&mut self, descriptor: ChunkDescriptor) {
        let task = self.chunk_task(descriptor);
        if self.status == UploadStatus::Paused {
            self.pool.add(task);
        } else {
            self.pool.add_and_start(task);
        }
    }

    /// Per-chunk upload: session dedup, then server-side verify, then
    /// transfer. Posts the outcome back to the loop.
    fn chunk_task(
        &self,
        descriptor: ChunkDescriptor,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let token = self.token.clone();
        let source = self.source.clone();
        let uploaded = Arc::clone(&self.uploaded);
        let msg_tx = self.msg_tx.clone();

        async move {
            let index = descriptor.index;
            if uploaded.lock().unwrap().contains(&index) {
                let _ = msg_tx.send(Msg::ChunkDone { index });
                return;
            }

            match transport
                .verify(&token, &descriptor.digest, HashKind::Chunk, Some(index))
                .await
            {
                Ok(response) if response.has_file => {
                    let _ = msg_tx.send(Msg::ChunkDone { index });
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    let _ = msg_tx.send(Msg::ChunkFailed { index, error });
                    return;
                }
            }

            let on_progress: ProgressFn = Arc::new(|_| {});
            match transport
                .transfer_chunk(&token, &source, &descriptor, on_progress)
                .await
            {
                Ok(()) => {
                    let _ = msg_tx.send(Msg::ChunkDone { index });
                }
                Err(error) => {
                    let _ = msg_tx.send(Msg::ChunkFailed { index, error });
                }
            }
        }
    }

    fn handle_chunk_failure(&mut self, index: usize, error: TransportError) {
        if self.finished || self.terminated {
            return;
        }
        let current = self.retries.get(&index).copied().unwrap_or(0);
        if !error.is_retryable() || current >= self.options.retry_count {
            self.fail(UploadError::ChunkFailed {
                index,
                attempts: current,
                source: error,
            });
            return;
        }

        self.retries.insert(index, current + 1);
        let delay = backoff_delay(self.options.retry_delay, current);
        debug!(
            "chunk {} failed ({}); retry {}/{} in {:?}",
            index,
            error,
            current + 1,
            self.options.retry_count,
            delay
        );
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = msg_tx.send(Msg::RetryReady { index });
        });
    }

    /// Idempotent: only the first confirmation counts the bytes and emits
    /// progress.
    fn mark_uploaded(&mut self, index: usize) {
        let newly = self.uploaded.lock().unwrap().insert(index);
        if !newly {
            return;
        }
        if let Some(span) = self.spans.get(index) {
            self.uploaded_bytes += span.len();
        }
        self.retries.remove(&index);
        self.emit_progress();
    }

    fn emit_progress(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_progress_at).as_secs_f64();
        let delta = self.uploaded_bytes - self.last_progress_bytes;
        let speed = if elapsed > 0.0 {
            delta as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.file_size.saturating_sub(self.uploaded_bytes);
        let remaining_time = if speed > 0.0 {
            Some(remaining as f64 / speed)
        } else {
            None
        };
        let percentage = if self.file_size > 0 {
            self.uploaded_bytes as f64 * 100.0 / self.file_size as f64
        } else {
            100.0
        };

        let uploaded_chunks = self.uploaded.lock().unwrap().len();
        let _ = self.event_tx.send(UploadEvent::Progress(Progress {
            loaded: self.uploaded_bytes,
            total: self.file_size,
            percentage,
            speed,
            remaining_time,
            uploaded_chunks,
            total_chunks: self.spans.len(),
        }));
        self.last_progress_at = now;
        self.last_progress_bytes = self.uploaded_bytes;
    }

    /// Merge once the queue has drained, every chunk is confirmed and the
    /// whole-file digest is known.
    fn maybe_merge(&mut self) {
        if self.finished || self.merging || self.terminated {
            return;
        }
        let Some(hash) = self.whole_hash.clone() else {
            return;
        };
        let all_uploaded = {
            let uploaded = self.uploaded.lock().unwrap();
            !self.spans.is_empty() && uploaded.len() == self.spans.len()
        };
        if !self.drained || !all_uploaded {
            return;
        }

        let mut digests = Vec::with_capacity(self.spans.len());
        for index in 0..self.spans.len() {
            match self.descriptors.get(&index) {
                Some(descriptor) => digests.push(descriptor.digest.clone()),
                None => {
                    self.fail(UploadError::Internal(format!(
                        "no digest recorded for chunk {}",
                        index
                    )));
                    return;
                }
            }
        }

        self.merging = true;
        self.set_status(UploadStatus::Merging);
        let transport = Arc::clone(&self.transport);
        let token = self.token.clone();
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = transport.merge(&token, &hash, &digests).await;
            let _ = msg_tx.send(Msg::MergeDone(result));
        });
    }

    fn handle_success(&mut self, url: String) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.set_status(UploadStatus::Completed);
        let _ = self.event_tx.send(UploadEvent::Complete { url });
        self.pool.clear();
        self.splitter.dispose();
        self.terminated = true;
    }

    fn fail(&mut self, error: UploadError) {
        if self.finished || self.terminated {
            return;
        }
        self.finished = true;
        self.set_status(UploadStatus::Error);
        let _ = self.event_tx.send(UploadEvent::Error(error));
        self.pool.clear();
        self.splitter.dispose();
        self.terminated = true;
    }

    fn set_status(&mut self, status: UploadStatus) {
        if self.status != status {
            self.status = status;
            let _ = self.event_tx.send(UploadEvent::StatusChange(status));
        }
    }
}

/// `base × 2^attempt`, scaled by a half-jitter in `[0.5, 1.0)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.0);
    base.mul_f64(f64::from(1u32 << attempt.min(16)) * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::Initiated;
    use crate::fingerprint::{digest_bytes, fold_digests};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory stand-in for the server, with failure injection.
    #[derive(Default)]
    struct MockTransport {
        chunk_size: u64,
        known_chunks: Mutex<HashSet<String>>,
        known_files: Mutex<HashMap<String, String>>,
        transferred: Mutex<Vec<usize>>,
        /// index → number of times the transfer should fail first.
        fail_plan: Mutex<HashMap<usize, u32>>,
        transfer_delay: Option<Duration>,
        merge_calls: AtomicUsize,
    }

    impl MockTransport {
        fn new(chunk_size: u64) -> Self {
            Self {
                chunk_size,
                ..Default::default()
            }
        }

        fn transferred(&self) -> Vec<usize> {
            let mut indices = self.transferred.lock().unwrap().clone();
            indices.sort_unstable();
            indices
        }
    }

    #[async_trait]
    impl UploadTransport for MockTransport {
        async fn initiate(&self, _meta: &FileMeta) -> Result<Initiated, TransportError> {
            Ok(Initiated {
                upload_token: "mock-token".into(),
                chunk_size: self.chunk_size,
            })
        }

        async fn verify(
            &self,
            _token: &str,
            hash: &str,
            kind: HashKind,
            _chunk_index: Option<usize>,
        ) -> Result<VerifyResponse, TransportError> {
            match kind {
                HashKind::Chunk => Ok(VerifyResponse {
                    has_file: self.known_chunks.lock().unwrap().contains(hash),
                    rest: None,
                    url: None,
                }),
                HashKind::File => {
                    let url = self.known_files.lock().unwrap().get(hash).cloned();
                    Ok(VerifyResponse {
                        has_file: url.is_some(),
                        rest: None,
                        url,
                    })
                }
            }
        }

        async fn transfer_chunk(
            &self,
            _token: &str,
            _source: &Path,
            chunk: &ChunkDescriptor,
            _on_progress: ProgressFn,
        ) -> Result<(), TransportError> {
            if let Some(delay) = self.transfer_delay {
                tokio::time::sleep(delay).await;
            }
            {
                let mut plan = self.fail_plan.lock().unwrap();
                if let Some(remaining) = plan.get_mut(&chunk.index) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(TransportError::Network("injected failure".into()));
                    }
                }
            }
            self.transferred.lock().unwrap().push(chunk.index);
            self.known_chunks
                .lock()
                .unwrap()
                .insert(chunk.digest.clone());
            Ok(())
        }

        async fn merge(
            &self,
            _token: &str,
            _file_hash: &str,
            _chunks: &[String],
        ) -> Result<String, TransportError> {
            self.merge_calls.fetch_add(1, Ordering::SeqCst);
            Ok("/api/upload/file/mock/upload.bin".into())
        }
    }

    struct Outcome {
        complete_urls: Vec<String>,
        errors: Vec<UploadError>,
        statuses: Vec<UploadStatus>,
        progress: Vec<Progress>,
    }

    async fn drain_events(mut rx: mpsc::UnboundedReceiver<UploadEvent>) -> Outcome {
        let mut outcome = Outcome {
            complete_urls: Vec::new(),
            errors: Vec::new(),
            statuses: Vec::new(),
            progress: Vec::new(),
        };
        while let Some(event) = rx.recv().await {
            match event {
                UploadEvent::Complete { url } => outcome.complete_urls.push(url),
                UploadEvent::Error(err) => outcome.errors.push(err),
                UploadEvent::StatusChange(status) => outcome.statuses.push(status),
                UploadEvent::Progress(progress) => outcome.progress.push(progress),
            }
        }
        outcome
    }

    fn fixture(len: usize) -> (tempfile::TempDir, PathBuf, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        (dir, path, data)
    }

    fn chunk_digests(data: &[u8], chunk_size: u64) -> Vec<String> {
        plan_chunks(data.len() as u64, chunk_size)
            .iter()
            .map(|span| digest_bytes(&data[span.start as usize..span.end as usize]))
            .collect()
    }

    #[tokio::test]
    async fn completes_a_small_upload() {
        let (_dir, path, _data) = fixture(1000);
        let transport = Arc::new(MockTransport::new(256));

        let controller = UploadController::new(
            &path,
            UploadOptions::new().with_concurrency(2),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        assert_eq!(outcome.complete_urls.len(), 1);
        assert!(outcome.errors.is_empty());
        assert_eq!(transport.transferred(), vec![0, 1, 2, 3]);
        assert_eq!(transport.merge_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.statuses.last(), Some(&UploadStatus::Completed));

        let last = outcome.progress.last().expect("progress was emitted");
        assert_eq!(last.loaded, 1000);
        assert_eq!(last.uploaded_chunks, 4);
        assert!((last.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn partial_resume_skips_known_chunks() {
        let (_dir, path, data) = fixture(1000);
        let transport = Arc::new(MockTransport::new(256));
        let digests = chunk_digests(&data, 256);
        // Chunks 0 and 2 already live on the server.
        {
            let mut known = transport.known_chunks.lock().unwrap();
            known.insert(digests[0].clone());
            known.insert(digests[2].clone());
        }

        let controller = UploadController::new(
            &path,
            UploadOptions::new(),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        assert_eq!(outcome.complete_urls.len(), 1);
        assert_eq!(transport.transferred(), vec![1, 3]);
    }

    #[tokio::test]
    async fn whole_file_dedup_transfers_nothing() {
        let (_dir, path, data) = fixture(1000);
        let transport = Arc::new(MockTransport::new(256));
        let digests = chunk_digests(&data, 256);
        let whole = fold_digests(digests.iter());
        {
            // A prior upload of the same bytes left everything in place.
            let mut chunks = transport.known_chunks.lock().unwrap();
            for digest in &digests {
                chunks.insert(digest.clone());
            }
            transport
                .known_files
                .lock()
                .unwrap()
                .insert(whole, "/api/upload/file/earlier/upload.bin".into());
        }

        let controller = UploadController::new(
            &path,
            UploadOptions::new(),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        // Exactly one completion even though the dedup hit races drain.
        assert_eq!(outcome.complete_urls.len(), 1);
        assert!(outcome.errors.is_empty());
        assert!(transport.transferred().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (_dir, path, _data) = fixture(1000);
        let transport = Arc::new(MockTransport::new(256));
        transport.fail_plan.lock().unwrap().insert(2, 2);

        let controller = UploadController::new(
            &path,
            UploadOptions::new()
                .with_retry_count(3)
                .with_retry_delay(Duration::from_millis(5)),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        assert_eq!(outcome.complete_urls.len(), 1);
        assert!(outcome.errors.is_empty());
        assert!(transport.transferred().contains(&2));
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_session() {
        let (_dir, path, _data) = fixture(1000);
        let transport = Arc::new(MockTransport::new(256));
        transport.fail_plan.lock().unwrap().insert(1, 100);

        let controller = UploadController::new(
            &path,
            UploadOptions::new()
                .with_retry_count(2)
                .with_retry_delay(Duration::from_millis(5)),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        assert!(outcome.complete_urls.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(
            outcome.errors[0],
            UploadError::ChunkFailed { index: 1, .. }
        ));
        assert_eq!(transport.merge_calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.statuses.last(), Some(&UploadStatus::Error));
    }

    #[tokio::test]
    async fn fatal_failures_skip_the_retry_budget() {
        let (_dir, path, _data) = fixture(500);
        // Unauthorized is not retryable: one failure ends the session.
        struct RejectingTransport(MockTransport);

        #[async_trait]
        impl UploadTransport for RejectingTransport {
            async fn initiate(
                &self,
                meta: &FileMeta,
            ) -> Result<Initiated, TransportError> {
                self.0.initiate(meta).await
            }
            async fn verify(
                &self,
                token: &str,
                hash: &str,
                kind: HashKind,
                chunk_index: Option<usize>,
            ) -> Result<VerifyResponse, TransportError> {
                self.0.verify(token, hash, kind, chunk_index).await
            }
            async fn transfer_chunk(
                &self,
                _token: &str,
                _source: &Path,
                _chunk: &ChunkDescriptor,
                _on_progress: ProgressFn,
            ) -> Result<(), TransportError> {
                Err(TransportError::Unauthorized("token expired".into()))
            }
            async fn merge(
                &self,
                token: &str,
                file_hash: &str,
                chunks: &[String],
            ) -> Result<String, TransportError> {
                self.0.merge(token, file_hash, chunks).await
            }
        }

        let transport = Arc::new(RejectingTransport(MockTransport::new(256)));
        let controller = UploadController::new(
            &path,
            UploadOptions::new().with_retry_delay(Duration::from_millis(5)),
            transport as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        assert!(outcome.complete_urls.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn pause_holds_new_transfers_and_resume_finishes() {
        let (_dir, path, _data) = fixture(2000);
        let mut mock = MockTransport::new(256);
        mock.transfer_delay = Some(Duration::from_millis(15));
        let transport = Arc::new(mock);

        let controller = UploadController::new(
            &path,
            UploadOptions::new().with_concurrency(1),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (handle, mut events) = controller.start();

        // Pause as soon as the first chunk confirms.
        loop {
            match events.recv().await.expect("events flow before pause") {
                UploadEvent::Progress(_) => break,
                UploadEvent::Error(err) => panic!("unexpected error: {}", err),
                _ => {}
            }
        }
        handle.pause();

        // With 8 chunks, 1 at a time, the session cannot complete while
        // paused: at most the in-flight transfer lands.
        let quiet = tokio::time::timeout(Duration::from_millis(120), async {
            while let Some(event) = events.recv().await {
                if let UploadEvent::Complete { .. } = event {
                    panic!("completed while paused");
                }
            }
        })
        .await;
        assert!(quiet.is_err(), "event stream ended while paused");

        handle.resume();
        let outcome = drain_events(events).await;
        assert_eq!(outcome.complete_urls.len(), 1);
        assert_eq!(transport.transferred().len(), 8);
    }

    #[tokio::test]
    async fn cancel_ends_the_session_quietly() {
        let (_dir, path, _data) = fixture(2000);
        let mut mock = MockTransport::new(256);
        mock.transfer_delay = Some(Duration::from_millis(20));
        let transport = Arc::new(mock);

        let controller = UploadController::new(
            &path,
            UploadOptions::new().with_concurrency(1),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (handle, events) = controller.start();
        handle.cancel();

        let outcome = drain_events(events).await;
        assert!(outcome.complete_urls.is_empty());
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.statuses.last(), Some(&UploadStatus::Idle));
    }

    #[tokio::test]
    async fn inline_digest_strategy_also_completes() {
        let (_dir, path, _data) = fixture(1500);
        let transport = Arc::new(MockTransport::new(512));

        let controller = UploadController::new(
            &path,
            UploadOptions::new().with_multi_thread_digest(false),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
        );
        let (_handle, events) = controller.start();
        let outcome = drain_events(events).await;

        assert_eq!(outcome.complete_urls.len(), 1);
        assert_eq!(transport.transferred(), vec![0, 1, 2]);
    }
}
