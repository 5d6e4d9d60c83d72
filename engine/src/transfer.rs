//! Transfer orchestration module.
//!
//! This module owns the lifecycle of a transfer:
//! - Starting a producer thread for a request
//! - Resolving the source and applying the limiter before any byte moves
//! - Streaming chunks into the temp artifact with a checkpoint between chunks
//! - Finalizing, cancelling or failing, and reporting the outcome exactly once
//!
//! Controllers interact through a [`TransferHandle`] (or a cloned
//! [`TransferControl`]) and observe the transfer through its event channel.

use std::any::Any;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checksums;
use crate::config::EngineConfig;
use crate::error::{EngineError, FailureKind};
use crate::events::{ProgressEvent, TerminalEvent, TransferEvent, TransferReport};
use crate::fs_ops::{self, TempArtifact};
use crate::gate::{Checkpoint, PauseGate};
use crate::http::HttpResolver;
use crate::limiter::{LimitDecision, Refusal};
use crate::model::{PartialPolicy, SourceInfo, TransferPhase, TransferRequest, TransferState};
use crate::naming;
use crate::progress::ProgressTracker;
use crate::source::SourceResolver;

/// Starts transfers. Cheap to share; every transfer gets its own thread.
#[derive(Clone)]
pub struct TransferEngine {
    config: Arc<EngineConfig>,
    resolver: Arc<dyn SourceResolver>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Create an engine that resolves locators with `resolver`.
    ///
    /// # Errors
    /// Returns EngineError::InvalidConfig if the configuration is unusable
    pub fn new(config: EngineConfig, resolver: Arc<dyn SourceResolver>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(TransferEngine {
            config: Arc::new(config),
            resolver,
        })
    }

    /// Create an engine that fetches `http://` and `https://` locators.
    pub fn http(config: EngineConfig) -> Result<Self, EngineError> {
        let resolver = HttpResolver::new(&config)?;
        Self::new(config, Arc::new(resolver))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build a request carrying this engine's default limits.
    pub fn request(&self, locator: impl Into<String>, destination: impl Into<PathBuf>) -> TransferRequest {
        TransferRequest::new(locator, destination).with_limits(self.config.limits.clone())
    }

    /// Start a transfer on its own producer thread.
    ///
    /// Everything that goes wrong after this returns is reported through the
    /// handle's events, never as a panic or an `Err`.
    ///
    /// # Errors
    /// Returns EngineError::InvalidRequest if the request is unusable
    pub fn start(&self, request: TransferRequest) -> Result<TransferHandle, EngineError> {
        request.validate()?;

        let id = Uuid::new_v4();
        let gate = Arc::new(PauseGate::new());
        let (sender, events) = crossbeam_channel::unbounded();

        info!(
            transfer_id = %id,
            locator = %request.locator,
            destination = %request.destination.display(),
            output = %request.output,
            "Starting transfer"
        );

        let producer = Producer {
            id,
            request,
            config: Arc::clone(&self.config),
            resolver: Arc::clone(&self.resolver),
            gate: Arc::clone(&gate),
            events: sender,
        };
        let worker = thread::spawn(move || producer.run());

        Ok(TransferHandle {
            control: TransferControl { id, gate },
            events,
            worker: Some(worker),
        })
    }

    /// Start a transfer and block until it ends.
    pub fn run(&self, request: TransferRequest) -> Result<TransferReport, EngineError> {
        Ok(self.start(request)?.wait())
    }
}

/// Pause/resume/cancel for one transfer. Clone it freely across threads.
///
/// Every operation is idempotent and returns whether it changed anything.
#[derive(Debug, Clone)]
pub struct TransferControl {
    id: Uuid,
    gate: Arc<PauseGate>,
}

impl TransferControl {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask the producer to stop at its next chunk boundary.
    pub fn pause(&self) -> bool {
        let changed = self.gate.pause();
        debug!(transfer_id = %self.id, changed, "Pause requested");
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = self.gate.resume();
        debug!(transfer_id = %self.id, changed, "Resume requested");
        changed
    }

    /// Stop for good. Wakes a paused producer.
    pub fn cancel(&self) -> bool {
        let changed = self.gate.cancel();
        debug!(transfer_id = %self.id, changed, "Cancel requested");
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }
}

/// A running transfer.
///
/// Dropping the handle cancels the transfer unless it was consumed by
/// [`wait`](Self::wait) or [`detach`](Self::detach).
#[derive(Debug)]
pub struct TransferHandle {
    control: TransferControl,
    events: Receiver<TransferEvent>,
    worker: Option<JoinHandle<TransferReport>>,
}

impl TransferHandle {
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Receiver for this transfer's events.
    ///
    /// The channel disconnects right after the terminal event. Receivers
    /// share one queue: each event is delivered to exactly one of them.
    pub fn events(&self) -> Receiver<TransferEvent> {
        self.events.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Let the transfer run on without a handle. Controls and event
    /// receivers taken earlier keep working.
    pub fn detach(mut self) {
        self.worker.take();
    }

    /// Block until the producer exits and return its report.
    pub fn wait(mut self) -> TransferReport {
        let id = self.control.id;
        let joined = match self.worker.take() {
            Some(worker) => worker.join(),
            None => Err(Box::new("transfer was detached") as Box<dyn Any + Send>),
        };
        match joined {
            Ok(report) => report,
            Err(payload) => {
                // Only reachable if reporting itself panicked.
                let err = EngineError::WorkerPanicked {
                    message: panic_message(payload.as_ref()),
                };
                error!(transfer_id = %id, error = %err, "Producer thread died");
                let now = Utc::now();
                TransferReport {
                    id,
                    started_at: now,
                    finished_at: now,
                    bytes_transferred: 0,
                    resumed_from: 0,
                    phase: TransferPhase::Failed,
                    outcome: TerminalEvent::failed(&err),
                }
            }
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        let running = self.worker.as_ref().is_some_and(|worker| !worker.is_finished());
        if running && self.control.cancel() {
            debug!(transfer_id = %self.control.id, "Handle dropped; transfer cancelled");
        }
    }
}

/// State moved onto the producer thread.
struct Producer {
    id: Uuid,
    request: TransferRequest,
    config: Arc<EngineConfig>,
    resolver: Arc<dyn SourceResolver>,
    gate: Arc<PauseGate>,
    events: Sender<TransferEvent>,
}

impl Producer {
    fn run(self) -> TransferReport {
        let started_at = Utc::now();
        let mut state = TransferState::new(self.id);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&mut state))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                match err.failure_kind() {
                    FailureKind::PolicyRefused => {
                        info!(transfer_id = %self.id, reason = %err, "Transfer refused by policy")
                    }
                    FailureKind::TransferFailed => {
                        error!(transfer_id = %self.id, error = %err, "Transfer failed")
                    }
                }
                TerminalEvent::failed(&err)
            }
            Err(payload) => {
                let err = EngineError::WorkerPanicked {
                    message: panic_message(payload.as_ref()),
                };
                error!(transfer_id = %self.id, error = %err, "Transfer failed");
                TerminalEvent::failed(&err)
            }
        };

        let phase = match &outcome {
            TerminalEvent::Completed { .. } => TransferPhase::Completed,
            TerminalEvent::Cancelled { .. } => TransferPhase::Cancelled,
            TerminalEvent::Failed { .. } => TransferPhase::Failed,
        };
        if !state.set_phase(phase) {
            warn!(transfer_id = %self.id, from = %state.phase(), to = %phase, "Unexpected phase transition");
        }

        self.emit(TransferEvent::Terminal(outcome.clone()));

        TransferReport {
            id: self.id,
            started_at,
            finished_at: Utc::now(),
            bytes_transferred: state.bytes_transferred(),
            resumed_from: state.resumed_from(),
            phase: state.phase(),
            outcome,
        }
    }

    fn execute(&self, state: &mut TransferState) -> Result<TerminalEvent, EngineError> {
        let mut source = self.resolver.resolve(&self.request.locator)?;
        let info = source.info().clone();
        debug!(
            transfer_id = %self.id,
            total_size = info.total_size,
            duration = ?info.duration,
            supports_resume = info.supports_resume,
            "Source resolved"
        );

        if self.gate.is_cancelled() {
            return Ok(self.cancelled_before_open());
        }

        if let LimitDecision::Refused(refusal) = self.request.limits.check(&info) {
            return Err(EngineError::PolicyRefused(refusal));
        }
        let ceiling = self.request.limits.streaming_ceiling(&info);

        fs_ops::ensure_dir_exists(&self.request.destination)?;
        let temp_path = self.request.destination.join(&self.config.temp_file_name);
        let mut artifact = fs_ops::open_temp_artifact(&temp_path, self.config.resume_partial)?;

        let mut wanted = artifact.existing_len;
        if info.total_size > 0 && wanted > info.total_size {
            warn!(
                transfer_id = %self.id,
                partial = wanted,
                total = info.total_size,
                "Partial artifact is larger than the source; starting over"
            );
            artifact.truncate()?;
            wanted = 0;
        }

        if self.gate.is_cancelled() {
            return Ok(self.cancelled(artifact, state));
        }

        let opened = source.open(wanted)?;
        if opened.offset != wanted {
            if opened.offset != 0 {
                return Err(EngineError::ResolveFailed {
                    locator: info.locator.clone(),
                    message: format!("stream starts at byte {}, expected {}", opened.offset, wanted),
                });
            }
            warn!(
                transfer_id = %self.id,
                partial = wanted,
                "Source cannot resume; refetching from the start"
            );
            artifact.truncate()?;
        }
        let offset = opened.offset;
        let mut reader = opened.reader;

        let filename = self.final_name(&info);
        state.begin(info.total_size, offset);
        info!(
            transfer_id = %self.id,
            filename = %filename,
            total = info.total_size,
            resumed_from = offset,
            "Transfer running"
        );
        self.emit(TransferEvent::Started {
            total_bytes: info.total_size,
            resumed_from: offset,
            filename: filename.clone(),
        });

        let mut tracker = ProgressTracker::new();
        self.emit_progress(&mut tracker, state);

        let mut buffer = vec![0u8; self.config.chunk_size];
        loop {
            match self.checkpoint(&artifact, state)? {
                Checkpoint::Proceed => {}
                Checkpoint::Resumed => {
                    state.set_phase(TransferPhase::Running);
                    info!(transfer_id = %self.id, bytes = state.bytes_transferred(), "Transfer resumed");
                    self.emit(TransferEvent::Resumed);
                }
                Checkpoint::Cancelled => return Ok(self.cancelled(artifact, state)),
            }

            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::StreamRead { source: e }),
            };

            if matches!(state.remaining(), Some(left) if n as u64 > left) {
                return Err(EngineError::StreamOverflow {
                    declared: state.total_bytes(),
                });
            }
            if let Some(limit) = ceiling.filter(|&limit| state.bytes_transferred() + n as u64 > limit) {
                drop(artifact);
                if let Err(e) = fs_ops::discard_artifact(&temp_path) {
                    warn!(transfer_id = %self.id, error = %e, "Failed to delete oversized artifact");
                }
                return Err(EngineError::PolicyRefused(Refusal::SizeLimitReached { limit }));
            }

            artifact
                .file
                .write_all(&buffer[..n])
                .map_err(|source| EngineError::WriteError {
                    path: temp_path.clone(),
                    source,
                })?;
            state.record(n as u64)?;
            self.emit_progress(&mut tracker, state);
        }

        if state.total_bytes() > 0 && !tracker.is_complete() {
            return Err(EngineError::StreamIncomplete {
                received: state.bytes_transferred(),
                declared: state.total_bytes(),
            });
        }

        artifact.sync()?;
        drop(artifact);
        self.finish(&temp_path, &filename, &info, state)
    }

    /// Block here while paused. Syncs the temp artifact before blocking.
    fn checkpoint(&self, artifact: &TempArtifact, state: &mut TransferState) -> Result<Checkpoint, EngineError> {
        let mut synced = Ok(());
        let checkpoint = self.gate.checkpoint_with(|| {
            synced = artifact.sync();
            state.set_phase(TransferPhase::Paused);
            info!(transfer_id = %self.id, bytes = state.bytes_transferred(), "Transfer paused");
            self.emit(TransferEvent::Paused {
                bytes_transferred: state.bytes_transferred(),
            });
        });
        synced?;
        Ok(checkpoint)
    }

    fn finish(
        &self,
        temp_path: &Path,
        filename: &str,
        info: &SourceInfo,
        state: &TransferState,
    ) -> Result<TerminalEvent, EngineError> {
        let checksum = match &self.request.checksum {
            Some(wanted) => {
                let value = checksums::verify_file(temp_path, wanted.algorithm, wanted.expected.as_deref())?;
                debug!(transfer_id = %self.id, checksum = %value.to_string_with_algo(), "Checksum computed");
                Some(value)
            }
            None => None,
        };

        let final_path = self.request.destination.join(filename);
        fs_ops::finalize_artifact(temp_path, &final_path)?;
        if let Some(mtime) = info.last_modified {
            fs_ops::preserve_mtime(&final_path, mtime);
        }

        info!(
            transfer_id = %self.id,
            path = %final_path.display(),
            bytes = state.bytes_transferred(),
            "Transfer completed"
        );
        Ok(TerminalEvent::Completed {
            path: final_path,
            bytes: state.bytes_transferred(),
            checksum,
        })
    }

    /// Cancelled while resolving: nothing was opened or written.
    fn cancelled_before_open(&self) -> TerminalEvent {
        info!(transfer_id = %self.id, "Transfer cancelled before the stream was opened");
        TerminalEvent::Cancelled { partial: None }
    }

    fn cancelled(&self, artifact: TempArtifact, state: &TransferState) -> TerminalEvent {
        let path = artifact.path.clone();
        drop(artifact);

        let partial = match self.config.partial_policy {
            PartialPolicy::Keep => Some(path),
            PartialPolicy::Delete => match fs_ops::discard_artifact(&path) {
                Ok(()) => None,
                Err(e) => {
                    warn!(transfer_id = %self.id, error = %e, "Failed to delete partial artifact");
                    Some(path)
                }
            },
        };

        info!(
            transfer_id = %self.id,
            bytes = state.bytes_transferred(),
            kept_partial = partial.is_some(),
            "Transfer cancelled"
        );
        TerminalEvent::Cancelled { partial }
    }

    fn final_name(&self, info: &SourceInfo) -> String {
        let base = naming::usable_filename(&info.default_filename);
        naming::final_filename(&base, self.request.output, &self.config.audio_extension)
    }

    fn emit_progress(&self, tracker: &mut ProgressTracker, state: &TransferState) {
        let percent = tracker.update(state.bytes_transferred(), state.total_bytes());
        self.emit(TransferEvent::Progress(ProgressEvent {
            percent,
            bytes_transferred: state.bytes_transferred(),
            total_bytes: state.total_bytes(),
        }));
    }

    // Nobody listening is fine.
    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::{create_hasher, ChecksumAlgorithm};
    use crate::limiter::TransferLimiter;
    use crate::model::OutputKind;
    use crate::source::{MediaSource, MemorySource, OpenedStream};
    use crossbeam_channel::bounded;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    #[derive(Clone)]
    enum Ending {
        Eof,
        Error(String),
        Panic,
    }

    /// Source that hands out fixed chunks and lets tests act between them.
    #[derive(Clone)]
    struct ScriptedSource {
        info: SourceInfo,
        chunks: Vec<Vec<u8>>,
        ending: Ending,
        reads: Arc<AtomicUsize>,
        opened: Arc<AtomicBool>,
        on_chunk: Arc<dyn Fn(usize) + Send + Sync>,
    }

    impl ScriptedSource {
        fn new(declared: u64, chunk_count: usize, chunk_len: usize) -> Self {
            let chunks = (0..chunk_count)
                .map(|i| vec![i as u8; chunk_len])
                .collect();
            ScriptedSource {
                info: SourceInfo::new("mem://clip", declared, "clip.mp4"),
                chunks,
                ending: Ending::Eof,
                reads: Arc::new(AtomicUsize::new(0)),
                opened: Arc::new(AtomicBool::new(false)),
                on_chunk: Arc::new(|_: usize| {}),
            }
        }

        fn ending(mut self, ending: Ending) -> Self {
            self.ending = ending;
            self
        }

        fn on_chunk(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
            self.on_chunk = Arc::new(hook);
            self
        }

        fn data(&self) -> Vec<u8> {
            self.chunks.concat()
        }
    }

    impl MediaSource for ScriptedSource {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn open(&mut self, _offset: u64) -> Result<OpenedStream, EngineError> {
            self.opened.store(true, Ordering::SeqCst);
            Ok(OpenedStream {
                reader: Box::new(ScriptedReader {
                    chunks: self.chunks.clone(),
                    index: 0,
                    ending: self.ending.clone(),
                    reads: Arc::clone(&self.reads),
                    on_chunk: Arc::clone(&self.on_chunk),
                }),
                offset: 0,
            })
        }
    }

    struct ScriptedReader {
        chunks: Vec<Vec<u8>>,
        index: usize,
        ending: Ending,
        reads: Arc<AtomicUsize>,
        on_chunk: Arc<dyn Fn(usize) + Send + Sync>,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.index < self.chunks.len() {
                let len = self.chunks[self.index].len();
                buf[..len].copy_from_slice(&self.chunks[self.index]);
                self.index += 1;
                let delivered = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
                (self.on_chunk)(delivered);
                return Ok(len);
            }
            match &self.ending {
                Ending::Eof => Ok(0),
                Ending::Error(message) => {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, message.clone()))
                }
                Ending::Panic => panic!("decoder exploded"),
            }
        }
    }

    fn engine_for<S>(source: S, config: EngineConfig) -> TransferEngine
    where
        S: MediaSource + Clone + Sync + 'static,
    {
        let resolver = move |_: &str| -> Result<Box<dyn MediaSource>, EngineError> {
            Ok(Box::new(source.clone()))
        };
        TransferEngine::new(config, Arc::new(resolver)).expect("Failed to build engine")
    }

    /// Engine whose resolver blocks until the returned sender fires, so a
    /// test can act while the transfer is still resolving.
    fn held_engine(source: ScriptedSource, config: EngineConfig) -> (TransferEngine, Sender<()>) {
        let (release_tx, release_rx) = bounded::<()>(1);
        let resolver = move |_: &str| -> Result<Box<dyn MediaSource>, EngineError> {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(Box::new(source.clone()))
        };
        let engine = TransferEngine::new(config, Arc::new(resolver)).expect("Failed to build engine");
        (engine, release_tx)
    }

    fn sample_data() -> Vec<u8> {
        (0..=255u8).cycle().take(1000).collect()
    }

    fn memory_source() -> MemorySource {
        MemorySource::new("mem://clip", "clip.mp4", sample_data()).with_chunk_size(100)
    }

    fn request_into(dir: &Path) -> TransferRequest {
        TransferRequest::new("mem://clip", dir).with_limits(TransferLimiter::unlimited())
    }

    fn run_to_end(handle: TransferHandle) -> (Vec<TransferEvent>, TransferReport) {
        let events = handle.events();
        let report = handle.wait();
        let events: Vec<_> = events.try_iter().collect();
        (events, report)
    }

    fn collect_until(
        events: &Receiver<TransferEvent>,
        stop: impl Fn(&TransferEvent) -> bool,
    ) -> Vec<TransferEvent> {
        let mut seen = Vec::new();
        loop {
            let event = events
                .recv_timeout(Duration::from_secs(5))
                .expect("Timed out waiting for event");
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn assert_well_formed(events: &[TransferEvent], report: &TransferReport) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "exactly one terminal event");
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Terminal(report.outcome.clone())),
            "terminal event is last and matches the report"
        );

        let mut last = 0u8;
        for event in events {
            if let TransferEvent::Progress(progress) = event {
                assert!(progress.percent >= last, "progress went backwards");
                assert!(progress.percent <= 100);
                last = progress.percent;
            }
        }
    }

    fn percents(events: &[TransferEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect()
    }

    fn failure(report: &TransferReport) -> (FailureKind, String) {
        match &report.outcome {
            TerminalEvent::Failed { kind, message } => (*kind, message.clone()),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_completes_with_monotonic_progress() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(memory_source(), EngineConfig::default());

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        let (events, report) = run_to_end(handle);
        assert_well_formed(&events, &report);

        let final_path = temp_dir.path().join("clip.mp4");
        assert_eq!(
            report.outcome,
            TerminalEvent::Completed {
                path: final_path.clone(),
                bytes: 1000,
                checksum: None,
            }
        );
        assert_eq!(
            events[0],
            TransferEvent::Started {
                total_bytes: 1000,
                resumed_from: 0,
                filename: "clip.mp4".to_string(),
            }
        );
        assert_eq!(percents(&events), vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(fs::read(&final_path).expect("Failed to read output"), sample_data());
        assert!(!temp_dir.path().join("temp_download").exists());
        assert_eq!(report.bytes_transferred, 1000);
        assert_eq!(report.phase, TransferPhase::Completed);
    }

    #[test]
    fn test_pause_blocks_before_next_chunk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (control_tx, control_rx) = bounded::<TransferControl>(1);
        let source = ScriptedSource::new(1000, 10, 100).on_chunk(move |delivered| {
            if delivered == 3 {
                let control = control_rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("No control received");
                assert!(control.pause());
                assert!(!control.pause());
            }
        });
        let reads = Arc::clone(&source.reads);
        let expected = source.data();
        let engine = engine_for(source, EngineConfig::default());

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        let events = handle.events();
        control_tx.send(handle.control()).expect("Failed to send control");

        let before = collect_until(&events, |e| matches!(e, TransferEvent::Paused { .. }));
        assert_eq!(
            before.last(),
            Some(&TransferEvent::Paused {
                bytes_transferred: 300
            })
        );
        assert_eq!(percents(&before).last(), Some(&30));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert!(events.try_recv().is_err(), "no events while paused");
        let temp_len = fs::metadata(temp_dir.path().join("temp_download"))
            .expect("Temp artifact missing")
            .len();
        assert_eq!(temp_len, 300);
        assert!(handle.control().is_paused());

        assert!(handle.resume());
        assert!(!handle.resume());
        let report = handle.wait();
        let after: Vec<_> = events.try_iter().collect();
        assert_eq!(after.first(), Some(&TransferEvent::Resumed));

        let mut all = before;
        all.extend(after);
        assert_well_formed(&all, &report);
        assert!(report.outcome.is_completed());
        assert_eq!(
            fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"),
            expected
        );
    }

    #[test]
    fn test_cancel_while_paused_keeps_partial() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (control_tx, control_rx) = bounded::<TransferControl>(1);
        let source = ScriptedSource::new(1000, 10, 100).on_chunk(move |delivered| {
            if delivered == 3 {
                let control = control_rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("No control received");
                control.pause();
            }
        });
        let engine = engine_for(source, EngineConfig::default());

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        let events = handle.events();
        control_tx.send(handle.control()).expect("Failed to send control");
        let mut all = collect_until(&events, |e| matches!(e, TransferEvent::Paused { .. }));

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.resume());
        let report = handle.wait();
        all.extend(events.try_iter());
        assert_well_formed(&all, &report);

        let temp_path = temp_dir.path().join("temp_download");
        assert_eq!(
            report.outcome,
            TerminalEvent::Cancelled {
                partial: Some(temp_path.clone())
            }
        );
        assert!(!all.contains(&TransferEvent::Resumed));
        assert_eq!(fs::metadata(&temp_path).expect("Partial missing").len(), 300);
        assert!(!temp_dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_cancel_while_running_with_delete_policy() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (control_tx, control_rx) = bounded::<TransferControl>(1);
        let source = ScriptedSource::new(1000, 10, 100).on_chunk(move |delivered| {
            if delivered == 1 {
                let control = control_rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("No control received");
                assert!(control.cancel());
            }
        });
        let reads = Arc::clone(&source.reads);
        let config = EngineConfig {
            partial_policy: PartialPolicy::Delete,
            ..EngineConfig::default()
        };
        let engine = engine_for(source, config);

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        control_tx.send(handle.control()).expect("Failed to send control");
        let (events, report) = run_to_end(handle);
        assert_well_formed(&events, &report);

        assert_eq!(report.outcome, TerminalEvent::Cancelled { partial: None });
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(report.bytes_transferred, 100);
        assert!(!temp_dir.path().join("temp_download").exists());
        assert!(!temp_dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_policy_refusal_never_opens_stream() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = ScriptedSource::new(1000, 10, 100);
        source.info.duration = Some(Duration::from_secs(121));
        let opened = Arc::clone(&source.opened);
        let engine = engine_for(source, EngineConfig::default());

        let request = request_into(temp_dir.path()).with_limits(TransferLimiter::with_max_duration(120));
        let (events, report) = run_to_end(engine.start(request).expect("Failed to start"));

        assert_eq!(events.len(), 1);
        assert_well_formed(&events, &report);
        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::PolicyRefused);
        assert!(message.contains("121"));
        assert!(!opened.load(Ordering::SeqCst));
        assert!(!temp_dir.path().join("temp_download").exists());
    }

    #[test]
    fn test_duration_at_limit_is_allowed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = memory_source().with_duration(Duration::from_secs(120));
        let engine = engine_for(source, EngineConfig::default());

        let request = request_into(temp_dir.path()).with_limits(TransferLimiter::with_max_duration(120));
        let report = engine.run(request).expect("Failed to start");
        assert!(report.outcome.is_completed());
    }

    #[test]
    fn test_stream_error_keeps_partial() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = ScriptedSource::new(1000, 4, 100)
            .ending(Ending::Error("connection reset by peer".to_string()));
        let engine = engine_for(source, EngineConfig::default());

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert_well_formed(&events, &report);

        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::TransferFailed);
        assert_eq!(message, "connection reset by peer");
        let temp_len = fs::metadata(temp_dir.path().join("temp_download"))
            .expect("Partial missing")
            .len();
        assert_eq!(temp_len, 400);
        assert!(!temp_dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_short_stream_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(ScriptedSource::new(1000, 4, 100), EngineConfig::default());

        let report = engine.run(request_into(temp_dir.path())).expect("Failed to start");
        let (_, message) = failure(&report);
        assert_eq!(message, "Stream ended after 400 of 1000 bytes");
        assert!(!temp_dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_stream_longer_than_declared_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(ScriptedSource::new(250, 3, 100), EngineConfig::default());

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert_well_formed(&events, &report);

        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::TransferFailed);
        assert_eq!(message, "Stream exceeded declared size of 250 bytes");
        let temp_len = fs::metadata(temp_dir.path().join("temp_download"))
            .expect("Partial missing")
            .len();
        assert_eq!(temp_len, 200);
        assert!(percents(&events).iter().all(|p| *p <= 100));
    }

    #[test]
    fn test_panicking_source_becomes_failure() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = ScriptedSource::new(1000, 2, 100).ending(Ending::Panic);
        let engine = engine_for(source, EngineConfig::default());

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert_well_formed(&events, &report);
        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::TransferFailed);
        assert!(message.contains("decoder exploded"));
    }

    #[test]
    fn test_resolve_failure_is_reported() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let resolver = |locator: &str| -> Result<Box<dyn MediaSource>, EngineError> {
            Err(EngineError::ResolveFailed {
                locator: locator.to_string(),
                message: "no such host".to_string(),
            })
        };
        let engine = TransferEngine::new(EngineConfig::default(), Arc::new(resolver))
            .expect("Failed to build engine");

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert_eq!(events.len(), 1);
        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::TransferFailed);
        assert!(message.contains("no such host"));
    }

    #[test]
    fn test_invalid_request_is_rejected_up_front() {
        let engine = engine_for(memory_source(), EngineConfig::default());
        let result = engine.start(TransferRequest::new("", "/tmp"));
        assert!(matches!(result, Err(EngineError::InvalidRequest { .. })));
    }

    #[test]
    fn test_audio_only_relabels_extension() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = MemorySource::new("mem://v", "video.mp4", sample_data());
        let engine = engine_for(source, EngineConfig::default());

        let request = request_into(temp_dir.path()).with_output(OutputKind::AudioOnly);
        let (events, report) = run_to_end(engine.start(request).expect("Failed to start"));

        let audio_path = temp_dir.path().join("video.mp3");
        assert!(matches!(
            &events[0],
            TransferEvent::Started { filename, .. } if filename == "video.mp3"
        ));
        assert!(matches!(&report.outcome, TerminalEvent::Completed { path, .. } if *path == audio_path));
        assert_eq!(fs::read(&audio_path).expect("Failed to read output"), sample_data());
        assert!(!temp_dir.path().join("video.mp4").exists());
    }

    #[test]
    fn test_resume_from_partial() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = sample_data();
        fs::write(temp_dir.path().join("temp_download"), &data[..300]).expect("Failed to seed partial");
        let engine = engine_for(memory_source().with_resume_support(true), EngineConfig::default());

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert_well_formed(&events, &report);

        assert!(matches!(events[0], TransferEvent::Started { resumed_from: 300, .. }));
        assert_eq!(percents(&events).first(), Some(&30));
        assert_eq!(report.resumed_from, 300);
        assert_eq!(report.bytes_transferred, 1000);
        assert_eq!(fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"), data);
    }

    #[test]
    fn test_resume_falls_back_to_full_refetch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("temp_download"), vec![0xAAu8; 300]).expect("Failed to seed partial");
        let engine = engine_for(memory_source(), EngineConfig::default());

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert!(matches!(events[0], TransferEvent::Started { resumed_from: 0, .. }));
        assert!(report.outcome.is_completed());
        assert_eq!(
            fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"),
            sample_data()
        );
    }

    #[test]
    fn test_oversized_partial_starts_over() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("temp_download"), vec![0xAAu8; 1500]).expect("Failed to seed partial");
        let engine = engine_for(memory_source().with_resume_support(true), EngineConfig::default());

        let report = engine.run(request_into(temp_dir.path())).expect("Failed to start");
        assert_eq!(report.resumed_from, 0);
        assert_eq!(
            fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"),
            sample_data()
        );
    }

    #[test]
    fn test_resume_disabled_ignores_partial() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = sample_data();
        fs::write(temp_dir.path().join("temp_download"), &data[..300]).expect("Failed to seed partial");
        let config = EngineConfig {
            resume_partial: false,
            ..EngineConfig::default()
        };
        let engine = engine_for(memory_source().with_resume_support(true), config);

        let report = engine.run(request_into(temp_dir.path())).expect("Failed to start");
        assert_eq!(report.resumed_from, 0);
        assert_eq!(fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"), data);
    }

    #[test]
    fn test_checksum_verified_before_finalize() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut hasher = create_hasher(ChecksumAlgorithm::Sha256);
        hasher.update(&sample_data());
        let expected = hasher.finalize();
        let engine = engine_for(memory_source(), EngineConfig::default());

        let request = request_into(temp_dir.path())
            .with_checksum(ChecksumAlgorithm::Sha256, Some(expected.to_string().to_uppercase()));
        let report = engine.run(request).expect("Failed to start");
        match report.outcome {
            TerminalEvent::Completed { checksum, .. } => assert_eq!(checksum, Some(expected)),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_keeps_temp() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(memory_source(), EngineConfig::default());

        let request = request_into(temp_dir.path()).with_checksum(ChecksumAlgorithm::Md5, Some("00".to_string()));
        let report = engine.run(request).expect("Failed to start");
        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::TransferFailed);
        assert!(message.starts_with("Checksum mismatch"));
        assert!(temp_dir.path().join("temp_download").exists());
        assert!(!temp_dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_empty_source_completes_at_full_progress() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(MemorySource::new("mem://e", "empty.bin", Vec::new()), EngineConfig::default());

        let (events, report) = run_to_end(engine.start(request_into(temp_dir.path())).expect("Failed to start"));
        assert_well_formed(&events, &report);
        assert!(report.outcome.is_completed());
        assert_eq!(percents(&events), vec![100]);
        let len = fs::metadata(temp_dir.path().join("empty.bin")).expect("Output missing").len();
        assert_eq!(len, 0);
    }

    #[test]
    fn test_last_modified_applied_to_output() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        let mut source = ScriptedSource::new(200, 2, 100);
        source.info.last_modified = Some(mtime);
        let engine = engine_for(source, EngineConfig::default());

        let report = engine.run(request_into(temp_dir.path())).expect("Failed to start");
        assert!(report.outcome.is_completed());
        let actual = fs::metadata(temp_dir.path().join("clip.mp4"))
            .expect("Output missing")
            .modified()
            .expect("mtime");
        assert_eq!(actual, mtime);
    }

    #[test]
    fn test_unsafe_default_name_is_sanitized() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = MemorySource::new("mem://x", "../../etc/passwd", b"data".to_vec());
        let engine = engine_for(source, EngineConfig::default());

        let report = engine.run(request_into(temp_dir.path())).expect("Failed to start");
        match report.outcome {
            TerminalEvent::Completed { path, .. } => {
                assert_eq!(path.parent(), Some(temp_dir.path()));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_dot_default_name_falls_back() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = MemorySource::new("mem://x", "..", b"data".to_vec());
        let engine = engine_for(source, EngineConfig::default());

        let report = engine.run(request_into(temp_dir.path())).expect("Failed to start");
        assert_eq!(
            report.outcome,
            TerminalEvent::Completed {
                path: temp_dir.path().join("download.bin"),
                bytes: 4,
                checksum: None,
            }
        );
    }

    #[test]
    fn test_cancel_while_resolving_opens_nothing() {
        for duration in [Duration::from_secs(60), Duration::from_secs(121)] {
            let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
            let mut source = ScriptedSource::new(1000, 10, 100);
            source.info.duration = Some(duration);
            let opened = Arc::clone(&source.opened);
            let reads = Arc::clone(&source.reads);
            let (engine, release) = held_engine(source, EngineConfig::default());

            let request = request_into(temp_dir.path()).with_limits(TransferLimiter::with_max_duration(120));
            let handle = engine.start(request).expect("Failed to start");
            assert!(handle.cancel());
            release.send(()).expect("Failed to release resolver");
            let (events, report) = run_to_end(handle);

            assert_eq!(events, vec![TransferEvent::Terminal(TerminalEvent::Cancelled { partial: None })]);
            assert_well_formed(&events, &report);
            assert_eq!(report.phase, TransferPhase::Cancelled);
            assert!(!opened.load(Ordering::SeqCst));
            assert_eq!(reads.load(Ordering::SeqCst), 0);
            assert!(!temp_dir.path().join("temp_download").exists());
        }
    }

    #[test]
    fn test_pause_before_first_chunk_reads_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = ScriptedSource::new(1000, 10, 100);
        let reads = Arc::clone(&source.reads);
        let expected = source.data();
        let (engine, release) = held_engine(source, EngineConfig::default());

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        let events = handle.events();
        assert!(handle.pause());
        release.send(()).expect("Failed to release resolver");

        let before = collect_until(&events, |e| matches!(e, TransferEvent::Paused { .. }));
        assert_eq!(
            before.last(),
            Some(&TransferEvent::Paused {
                bytes_transferred: 0
            })
        );
        assert_eq!(percents(&before), vec![0]);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(events.try_recv().is_err(), "no events while paused");

        assert!(handle.resume());
        let report = handle.wait();
        let mut all = before;
        all.extend(events.try_iter());
        assert_well_formed(&all, &report);
        assert!(report.outcome.is_completed());
        assert_eq!(
            fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"),
            expected
        );
    }

    #[test]
    fn test_dropping_paused_handle_cancels() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = ScriptedSource::new(1000, 10, 100);
        let reads = Arc::clone(&source.reads);
        let (engine, release) = held_engine(source, EngineConfig::default());

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        let events = handle.events();
        let control = handle.control();
        assert!(handle.pause());
        release.send(()).expect("Failed to release resolver");
        collect_until(&events, |e| matches!(e, TransferEvent::Paused { .. }));

        drop(handle);
        assert!(control.is_cancelled());
        let rest = collect_until(&events, TransferEvent::is_terminal);
        assert_eq!(
            rest.last(),
            Some(&TransferEvent::Terminal(TerminalEvent::Cancelled {
                partial: Some(temp_dir.path().join("temp_download")),
            }))
        );
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(!temp_dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_detached_transfer_runs_to_completion() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(memory_source(), EngineConfig::default());

        let handle = engine.start(request_into(temp_dir.path())).expect("Failed to start");
        let events = handle.events();
        let control = handle.control();
        handle.detach();

        let seen = collect_until(&events, TransferEvent::is_terminal);
        assert!(!control.is_cancelled());
        assert!(matches!(seen.last(), Some(TransferEvent::Terminal(TerminalEvent::Completed { .. }))));
        assert_eq!(
            fs::read(temp_dir.path().join("clip.mp4")).expect("Failed to read output"),
            sample_data()
        );
    }

    #[test]
    fn test_undeclared_size_stops_at_size_limit() {
        let limits = TransferLimiter {
            max_size_bytes: Some(500),
            ..TransferLimiter::unlimited()
        };

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = ScriptedSource::new(0, 10, 100);
        let reads = Arc::clone(&source.reads);
        let engine = engine_for(source, EngineConfig::default());
        let request = request_into(temp_dir.path()).with_limits(limits.clone());
        let (events, report) = run_to_end(engine.start(request).expect("Failed to start"));

        assert_well_formed(&events, &report);
        let (kind, message) = failure(&report);
        assert_eq!(kind, FailureKind::PolicyRefused);
        assert_eq!(message, "Source is larger than the limit of 500 bytes");
        assert_eq!(report.bytes_transferred, 500);
        assert_eq!(reads.load(Ordering::SeqCst), 6);
        assert!(!temp_dir.path().join("temp_download").exists());
        assert!(!temp_dir.path().join("clip.mp4").exists());

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = engine_for(ScriptedSource::new(0, 5, 100), EngineConfig::default());
        let request = request_into(temp_dir.path()).with_limits(limits);
        let report = engine.run(request).expect("Failed to start");
        assert!(report.outcome.is_completed());
        assert_eq!(report.bytes_transferred, 500);
    }
}
