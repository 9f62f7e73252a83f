//! Capture session - acquisition loop, cancellation, bounded fan-out to saves
//!
//! ```text
//!            start                    stop (flag set)          drained + released
//!   Idle ───────────▶ Running ──────────────────────▶ Draining ─────────────────▶ Idle
//!                        │ poll source (bounded wait)      │ queue closed
//!                        │ convert, gate on flag           │ workers finish in-flight saves
//!                        └─▶ SavePool (N workers, bounded) │ source.release()
//! ```
//!
//! The frame source moves onto the acquisition thread for the length of a
//! session and comes back when the thread is joined, so two sessions can
//! never poll it at once.

mod pool;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::frame::{Acquired, FrameSource, SourceError, SourceSettings};
use crate::sink::{PersistenceSink, SinkError};
use pool::{SavePool, Submit};
use shutterconf::{CaptureConfig, OverflowPolicy};

/// Lifecycle state of the capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Running = 1,
    Draining = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Running,
            2 => SessionState::Draining,
            _ => SessionState::Idle,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is already running")]
    AlreadyActive(Uuid),

    #[error("frame source is unavailable (a previous session lost it)")]
    SourceUnavailable,

    #[error("failed to prepare session directories: {0}")]
    Directories(#[from] SinkError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Tuning for the acquisition loop and save pool.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub poll_timeout: Duration,
    pub save_workers: usize,
    pub save_queue: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            save_workers: config.save_workers,
            save_queue: config.save_queue,
            overflow: config.overflow,
        }
    }
}

/// What a `start` asks for.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Session directory; `front_RGB/` and `front_depth/` go under it.
    pub root: PathBuf,
    pub settings: SourceSettings,
}

/// Live counters, shared between the acquisition thread and save workers.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub timeouts: AtomicU64,
    /// Pairs that passed the stop gate and were offered to the save pool.
    pub accepted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    /// Accepted pairs that never reached the sink (queue full or stopping).
    pub dropped: AtomicU64,
    /// Frame sets that could not be converted.
    pub skipped: AtomicU64,
    pub in_flight: AtomicU64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            timeouts: self.timeouts.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub timeouts: u64,
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub in_flight: u64,
}

impl StatsSnapshot {
    /// Every accepted pair has a known fate.
    pub fn is_settled(&self) -> bool {
        self.in_flight == 0 && self.accepted == self.completed + self.failed + self.dropped
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Stopped,
    SourceFailed(String),
}

/// Final account of one session, published when it reaches Idle.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub root: PathBuf,
    pub ended_by: EndReason,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

/// Raised once an acquisition thread has drained, released and gone Idle.
#[derive(Debug, Default)]
struct Finished {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Finished {
    fn set(&self) {
        *self.done.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

/// Sets [`Finished`] when dropped, so waiters wake even if the thread panics.
struct FinishOnDrop(Arc<Finished>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct ActiveSession {
    id: Uuid,
    root: PathBuf,
    cancel: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    finished: Arc<Finished>,
    handle: JoinHandle<Box<dyn FrameSource>>,
}

struct Inner {
    /// Present while idle; lives on the acquisition thread otherwise.
    source: Option<Box<dyn FrameSource>>,
    active: Option<ActiveSession>,
}

/// Owns the frame source and runs at most one acquisition loop at a time.
pub struct CaptureSession {
    options: SessionOptions,
    sink: Arc<dyn PersistenceSink>,
    state: Arc<AtomicU8>,
    last_report: Arc<Mutex<Option<SessionReport>>>,
    inner: Mutex<Inner>,
}

impl CaptureSession {
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Arc<dyn PersistenceSink>,
        options: SessionOptions,
    ) -> Self {
        Self {
            options,
            sink,
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
            last_report: Arc::new(Mutex::new(None)),
            inner: Mutex::new(Inner {
                source: Some(source),
                active: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True from `start` until the session has fully drained.
    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Idle
    }

    /// Counters of the current (or draining) session.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.lock().active.as_ref().map(|a| a.stats.snapshot())
    }

    /// Root directory of the current session.
    pub fn current_root(&self) -> Option<PathBuf> {
        self.lock().active.as_ref().map(|a| a.root.clone())
    }

    pub fn last_report(&self) -> Option<SessionReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Begin a new session. Returns once the acquisition thread is running.
    ///
    /// A running session that has not been asked to stop is an error. A
    /// session that was stopped but is still draining is waited for first.
    pub fn start(&self, request: StartRequest) -> Result<Uuid, SessionError> {
        let mut inner = self.lock();

        if let Some(active) = inner.active.take() {
            let running = !active.cancel.load(Ordering::Acquire)
                && self.state() == SessionState::Running
                && !active.handle.is_finished();
            if running {
                let id = active.id;
                inner.active = Some(active);
                return Err(SessionError::AlreadyActive(id));
            }
            debug!("waiting for session {} to drain before starting", active.id);
            self.reap(&mut inner, active);
        }

        let mut source = inner.source.take().ok_or(SessionError::SourceUnavailable)?;

        if let Err(e) = self.sink.ensure_directories(&request.root) {
            inner.source = Some(source);
            return Err(e.into());
        }
        if let Err(e) = source.open(&request.settings) {
            inner.source = Some(source);
            return Err(e.into());
        }

        let id = Uuid::new_v4();
        let tag = short_id(&id);
        let cancel = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SessionStats::default());
        let finished = Arc::new(Finished::default());

        let pool = match SavePool::start(
            &format!("capture-{tag}"),
            self.options.save_workers,
            self.options.save_queue,
            Arc::clone(&self.sink),
            request.root.clone(),
            Arc::clone(&stats),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                source.release();
                inner.source = Some(source);
                return Err(e.into());
            }
        };

        let ctx = LoopContext {
            id,
            root: request.root.clone(),
            options: self.options.clone(),
            cancel: Arc::clone(&cancel),
            stats: Arc::clone(&stats),
            state: Arc::clone(&self.state),
            last_report: Arc::clone(&self.last_report),
            finished: Arc::clone(&finished),
        };

        self.state
            .store(SessionState::Running as u8, Ordering::Release);
        let handle = thread::Builder::new()
            .name(format!("capture-{tag}"))
            .spawn(move || run_acquisition(ctx, source, pool));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.state.store(SessionState::Idle as u8, Ordering::Release);
                error!("failed to spawn acquisition thread, frame source is lost: {}", e);
                return Err(e.into());
            }
        };

        info!(
            "session {} started in {} (align={}, sync={})",
            id,
            request.root.display(),
            request.settings.align_mode,
            request.settings.enable_sync
        );

        inner.active = Some(ActiveSession {
            id,
            root: request.root,
            cancel,
            stats,
            finished,
            handle,
        });
        Ok(id)
    }

    /// Ask the running session to stop. Does not wait for the drain.
    ///
    /// Returns false when there was nothing to stop (no session, a session
    /// that already ended on its own, or stop was already requested).
    pub fn stop(&self) -> bool {
        let inner = self.lock();
        match inner.active.as_ref() {
            Some(active)
                if self.state() == SessionState::Running
                    && !active.cancel.swap(true, Ordering::AcqRel) =>
            {
                info!("stop requested for session {}", active.id);
                true
            }
            Some(active) => {
                debug!("session {} is already stopping or ended", active.id);
                false
            }
            None => {
                debug!("stop with no active session");
                false
            }
        }
    }

    /// Wait until the pipeline is Idle and the source is back.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let (id, finished) = match self.lock().active.as_ref() {
            None => return true,
            Some(active) => (active.id, Arc::clone(&active.finished)),
        };
        if !finished.wait(timeout) {
            return false;
        }

        let mut inner = self.lock();
        match inner.active.take() {
            Some(active) if active.id == id => {
                self.reap(&mut inner, active);
                true
            }
            // Another session started while we waited
            Some(active) => {
                inner.active = Some(active);
                false
            }
            None => true,
        }
    }

    /// Stop and wait for the drain.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        self.wait_idle(timeout)
    }

    /// Join a finished (or stopping) session and take the source back.
    fn reap(&self, inner: &mut Inner, active: ActiveSession) {
        match active.handle.join() {
            Ok(source) => inner.source = Some(source),
            Err(_) => {
                error!("acquisition thread for session {} panicked", active.id);
                self.state.store(SessionState::Idle as u8, Ordering::Release);
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if let Some(active) = inner.active.take() {
            active.cancel.store(true, Ordering::Release);
            self.reap(&mut inner, active);
        }
    }
}

struct LoopContext {
    id: Uuid,
    root: PathBuf,
    options: SessionOptions,
    cancel: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    state: Arc<AtomicU8>,
    last_report: Arc<Mutex<Option<SessionReport>>>,
    finished: Arc<Finished>,
}

fn run_acquisition(
    ctx: LoopContext,
    mut source: Box<dyn FrameSource>,
    pool: SavePool,
) -> Box<dyn FrameSource> {
    let span = info_span!("session", id = %short_id(&ctx.id));
    let _enter = span.enter();
    let _finish = FinishOnDrop(Arc::clone(&ctx.finished));

    let started = Instant::now();
    let mut ended_by = EndReason::Stopped;

    while !ctx.cancel.load(Ordering::Acquire) {
        let set = match source.try_acquire(ctx.options.poll_timeout) {
            Ok(Acquired::Frames(set)) => set,
            Ok(Acquired::Timeout) => {
                ctx.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                trace!("no frame within {:?}", ctx.options.poll_timeout);
                continue;
            }
            Err(e) => {
                error!("frame source failed, ending session: {}", e);
                ended_by = EndReason::SourceFailed(e.to_string());
                break;
            }
        };

        let pair = match set.convert() {
            Ok(pair) => pair,
            Err(e) => {
                ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("skipping frame set: {}", e);
                continue;
            }
        };

        // Gate: nothing new is dispatched once stop has been requested
        if ctx.cancel.load(Ordering::Acquire) {
            break;
        }

        ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let submitted = pool.submit(
            pair,
            ctx.options.overflow,
            &ctx.cancel,
            ctx.options.poll_timeout,
        );
        if submitted == Submit::Dropped {
            ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    ctx.state
        .store(SessionState::Draining as u8, Ordering::Release);
    debug!("acquisition loop exited, draining saves");
    pool.drain();
    source.release();

    let stats = ctx.stats.snapshot();
    if !stats.is_settled() {
        warn!("session ended with unsettled counters: {:?}", stats);
    }
    info!(
        "session {} finished: {} saved, {} failed, {} dropped, {} skipped",
        ctx.id, stats.completed, stats.failed, stats.dropped, stats.skipped
    );

    let report = SessionReport {
        id: ctx.id,
        root: ctx.root,
        ended_by,
        elapsed: started.elapsed(),
        stats,
    };
    *ctx.last_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
    ctx.state.store(SessionState::Idle as u8, Ordering::Release);

    source
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Resolve a session folder under the dataset root.
///
/// Folders are relative; absolute paths and `..` components are refused.
pub fn resolve_folder(dataset_root: &Path, folder: &str) -> Option<PathBuf> {
    use std::path::Component;

    let relative = Path::new(folder);
    if folder.is_empty() {
        return None;
    }
    let mut has_normal = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            _ => return None,
        }
    }
    has_normal.then(|| dataset_root.join(relative))
}
