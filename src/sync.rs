//! Multi-device synchronized polling.
//!
//! A round is a hard barrier: it ends only once every session has delivered a
//! bundle holding all of its requested kinds. Sessions are polled round-robin,
//! one blocking wait each per pass. A session that already completed keeps
//! being polled and its entry is replaced by the newer complete frameset, so
//! the entries handed back are as close in time as the slowest device allows.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::driver::StreamKind;
use crate::error::{FrameRetrievalError, SyncError, SynchronizationTimeoutError};
use crate::frame::FrameSet;
use crate::session::DeviceSession;

/// Which stream kinds a round must collect from each session.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum KindSelection {
    /// Every stream the session was started with.
    #[default]
    AllEnabled,
    Only(Vec<StreamKind>),
}

impl KindSelection {
    fn required_for(&self, session: &DeviceSession) -> Vec<StreamKind> {
        let mut kinds = match self {
            KindSelection::AllEnabled => session.enabled_kinds(),
            KindSelection::Only(kinds) => kinds.clone(),
        };
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// Stateless; operates over whatever session snapshot it is given.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameSynchronizer;

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self
    }

    /// Block until every session has a complete frameset. A hardware error on
    /// any session aborts the whole round; no partial map is returned.
    pub fn poll_round(
        &self,
        sessions: &[Arc<DeviceSession>],
        kinds: &KindSelection,
    ) -> Result<HashMap<String, FrameSet>, SyncError> {
        let progress = Mutex::new(BTreeSet::new());
        let never = AtomicBool::new(false);
        run_round(sessions, kinds, &progress, &never)
    }

    /// [`Self::poll_round`] with a wall-clock deadline. The round runs on a
    /// worker thread; on expiry the worker is told to stop after its current
    /// wait and the devices that had not completed are reported.
    pub fn poll_round_within(
        &self,
        sessions: &[Arc<DeviceSession>],
        kinds: &KindSelection,
        deadline: Duration,
    ) -> Result<HashMap<String, FrameSet>, SyncError> {
        let started = Instant::now();
        let progress = Arc::new(Mutex::new(BTreeSet::new()));
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let worker_sessions = sessions.to_vec();
        let worker_kinds = kinds.clone();
        let worker_progress = Arc::clone(&progress);
        let worker_cancel = Arc::clone(&cancel);
        thread::Builder::new()
            .name("frame-sync".to_string())
            .spawn(move || {
                let result = run_round(
                    &worker_sessions,
                    &worker_kinds,
                    &worker_progress,
                    &worker_cancel,
                );
                let _ = tx.send(result);
            })
            .map_err(|_| SyncError::WorkerLost)?;

        match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::SeqCst);
                let done = progress.lock().unwrap_or_else(PoisonError::into_inner);
                let mut serials: Vec<String> = sessions
                    .iter()
                    .map(|session| session.serial().to_string())
                    .filter(|serial| !done.contains(serial))
                    .collect();
                serials.sort();
                serials.dedup();
                let err = SynchronizationTimeoutError {
                    waited: started.elapsed(),
                    serials,
                };
                log::warn!("{}", err);
                Err(err.into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::WorkerLost),
        }
    }

    /// Run and discard `rounds` rounds so auto-exposure can settle.
    pub fn warm_up(
        &self,
        sessions: &[Arc<DeviceSession>],
        kinds: &KindSelection,
        rounds: u32,
    ) -> Result<(), SyncError> {
        for round in 0..rounds {
            self.poll_round(sessions, kinds)?;
            if (round + 1) % 30 == 0 {
                log::debug!("warm-up round {}/{}", round + 1, rounds);
            }
        }
        Ok(())
    }
}

fn run_round(
    sessions: &[Arc<DeviceSession>],
    kinds: &KindSelection,
    progress: &Mutex<BTreeSet<String>>,
    cancel: &AtomicBool,
) -> Result<HashMap<String, FrameSet>, SyncError> {
    let mut plan: Vec<(&Arc<DeviceSession>, Vec<StreamKind>)> = Vec::with_capacity(sessions.len());
    for session in sessions {
        if plan.iter().any(|(s, _)| s.serial() == session.serial()) {
            continue;
        }
        let required = kinds.required_for(session);
        // A kind the session never streams would stall the barrier forever.
        let enabled = session.enabled_kinds();
        let unavailable: Vec<StreamKind> = required
            .iter()
            .copied()
            .filter(|kind| !enabled.contains(kind))
            .collect();
        if !unavailable.is_empty() {
            return Err(FrameRetrievalError::Incomplete {
                serial: session.serial().to_string(),
                missing: unavailable,
            }
            .into());
        }
        plan.push((session, required));
    }

    let mut complete: HashMap<String, FrameSet> = HashMap::with_capacity(plan.len());
    let mut passes = 0u64;
    while !plan.is_empty() {
        passes += 1;
        for (session, required) in &plan {
            if cancel.load(Ordering::SeqCst) {
                return Err(SyncError::WorkerLost);
            }
            let mut frames = session.wait_for_frameset()?;
            if frames.missing(required).is_empty() {
                frames.retain(required);
                complete.insert(session.serial().to_string(), frames);
                progress
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(session.serial().to_string());
            } else {
                log::debug!(
                    "device {} partial bundle {:?} in pass {}",
                    session.serial(),
                    frames.kinds(),
                    passes
                );
            }
        }
        if complete.len() == plan.len() {
            break;
        }
    }
    log::debug!(
        "synchronized {} device(s) in {} pass(es)",
        complete.len(),
        passes
    );
    Ok(complete)
}
