//! Bounded save pool
//!
//! A fixed number of worker threads pull frame pairs off a bounded
//! crossbeam channel and hand them to the sink. The channel capacity plus
//! the worker count is the most frame pairs a session can hold in memory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use tracing::{debug, error, warn};

use super::SessionStats;
use crate::frame::FramePair;
use crate::sink::PersistenceSink;
use shutterconf::OverflowPolicy;

/// Outcome of offering one pair to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submit {
    Queued,
    Dropped,
}

pub(crate) struct SavePool {
    tx: Option<Sender<FramePair>>,
    workers: Vec<JoinHandle<()>>,
}

impl SavePool {
    pub(crate) fn start(
        name: &str,
        workers: usize,
        capacity: usize,
        sink: Arc<dyn PersistenceSink>,
        root: PathBuf,
        stats: Arc<SessionStats>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<FramePair>(capacity.max(1));
        let root = Arc::new(root);

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers.max(1) {
            let rx = rx.clone();
            let sink = Arc::clone(&sink);
            let root = Arc::clone(&root);
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("{name}-save-{n}"))
                .spawn(move || run_save_worker(rx, sink, root, stats))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    /// Hand a pair to the workers.
    ///
    /// With [`OverflowPolicy::Block`] this waits for queue space in slices of
    /// `wait`, giving up (and dropping the pair) once `cancel` is set.
    pub(crate) fn submit(
        &self,
        pair: FramePair,
        policy: OverflowPolicy,
        cancel: &AtomicBool,
        wait: Duration,
    ) -> Submit {
        let Some(tx) = self.tx.as_ref() else {
            return Submit::Dropped;
        };

        match policy {
            OverflowPolicy::Drop => match tx.try_send(pair) {
                Ok(()) => Submit::Queued,
                Err(TrySendError::Full(_)) => {
                    debug!("save queue full, dropping frame pair");
                    Submit::Dropped
                }
                Err(TrySendError::Disconnected(_)) => Submit::Dropped,
            },
            OverflowPolicy::Block => {
                let mut pending = pair;
                loop {
                    match tx.send_timeout(pending, wait) {
                        Ok(()) => return Submit::Queued,
                        Err(SendTimeoutError::Timeout(back)) => {
                            if cancel.load(Ordering::Acquire) {
                                debug!("stop requested while save queue full, dropping frame pair");
                                return Submit::Dropped;
                            }
                            pending = back;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => {
                            warn!("all save workers are gone, dropping frame pair");
                            return Submit::Dropped;
                        }
                    }
                }
            }
        }
    }

    /// Close the queue and wait for every queued and in-flight save.
    pub(crate) fn drain(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("save-worker").to_string();
            if handle.join().is_err() {
                error!("{name} panicked");
            }
        }
    }
}

impl Drop for SavePool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_save_worker(
    rx: Receiver<FramePair>,
    sink: Arc<dyn PersistenceSink>,
    root: Arc<PathBuf>,
    stats: Arc<SessionStats>,
) {
    for pair in rx.iter() {
        stats.in_flight.fetch_add(1, Ordering::AcqRel);
        match sink.save(&pair, &root) {
            Ok(()) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("dropping frame {}: {}", pair.stem(), e);
            }
        }
        stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
