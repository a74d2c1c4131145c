//! Concurrent, deduplicating transfer tracker.
//!
//! A [`Tracker`] owns a registry of in-flight units keyed by object key.
//! Submitting entries creates a [`Session`]; an entry whose object key is
//! already in flight for another session is attached to that unit instead of
//! being transferred twice. Each unit runs in its own task, bounded by the
//! semaphore of the session that created it. When a unit reaches a terminal
//! state the finisher bumps every session that references it and drops it
//! from the registry, all under the registry lock.

use super::progress::SessionProgress;
use crate::manifest::ManifestEntry;
use crate::{BackupError, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The transfer a unit performs, downloading or uploading one entry.
#[async_trait]
pub trait Transfer: Send + Sync + 'static {
    /// Storage side of the transfer.
    type Interactor: ?Sized + Send + Sync + 'static;

    /// Name used in logs.
    const OPERATION: &'static str;

    async fn perform(
        &self,
        interactor: &Self::Interactor,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    NotStarted,
    Running,
    Finished,
    Failed,
    Ignored,
    Cancelled,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, UnitState::NotStarted | UnitState::Running)
    }

    /// Terminal without having transferred.
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, UnitState::Failed | UnitState::Ignored | UnitState::Cancelled)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::NotStarted => "NOT_STARTED",
            UnitState::Running => "RUNNING",
            UnitState::Finished => "FINISHED",
            UnitState::Failed => "FAILED",
            UnitState::Ignored => "IGNORED",
            UnitState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct UnitStatus {
    state: UnitState,
    error: Option<String>,
}

/// Transfer of a single manifest entry.
#[derive(Debug)]
pub struct Unit {
    pub id: Uuid,
    pub entry: ManifestEntry,
    status: Mutex<UnitStatus>,
    cancel: CancellationToken,
}

impl Unit {
    fn new(entry: ManifestEntry, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry,
            status: Mutex::new(UnitStatus {
                state: UnitState::NotStarted,
                error: None,
            }),
            cancel,
        }
    }

    fn status(&self) -> MutexGuard<'_, UnitStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> UnitState {
        self.status().state
    }

    pub fn error(&self) -> Option<String> {
        self.status().error.clone()
    }

    /// Move to `to` unless a terminal state was already reached.
    fn transition(&self, to: UnitState, error: Option<String>) -> bool {
        let mut status = self.status();
        if status.state.is_terminal() {
            return false;
        }
        status.state = to;
        status.error = error;
        true
    }
}

/// A batch of units submitted together.
pub struct Session {
    pub id: Uuid,
    pub snapshot_tag: String,
    operation: &'static str,
    units: Vec<Arc<Unit>>,
    unit_ids: HashSet<Uuid>,
    finished: AtomicUsize,
    semaphore: Arc<Semaphore>,
    changed: Notify,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: Instant,
}

impl Session {
    pub fn units(&self) -> &[Arc<Unit>] {
        &self.units
    }

    pub fn submitted(&self) -> usize {
        self.units.len()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn references(&self, unit: &Unit) -> bool {
        self.unit_ids.contains(&unit.id)
    }

    /// All units transferred.
    pub fn is_successful(&self) -> bool {
        self.units.iter().all(|u| u.state() == UnitState::Finished)
    }

    /// Any unit failed, was cancelled or ignored, or every unit is done.
    pub fn is_considered_finished(&self) -> bool {
        self.units.iter().any(|u| u.state().is_unsuccessful())
            || self.finished() >= self.submitted()
    }

    /// Object keys of unsuccessful units with their errors.
    pub fn failed_object_keys(&self) -> Vec<(String, String)> {
        self.units
            .iter()
            .filter_map(|u| {
                let state = u.state();
                state.is_unsuccessful().then(|| {
                    (
                        u.entry.object_key.clone(),
                        u.error().unwrap_or_else(|| state.to_string()),
                    )
                })
            })
            .collect()
    }

    /// Error for a session that did not succeed.
    pub fn failure(&self) -> BackupError {
        let failed = self.failed_object_keys();
        let mut keys: Vec<String> = failed
            .iter()
            .take(10)
            .map(|(key, error)| format!("{} ({})", key, error))
            .collect();
        if failed.len() > keys.len() {
            keys.push(format!("and {} more", failed.len() - keys.len()));
        }
        BackupError::Transfer {
            count: failed.len(),
            keys: keys.join(", "),
        }
    }

    pub fn progress(&self) -> SessionProgress {
        let mut progress = SessionProgress {
            total_units: self.submitted(),
            finished_units: self.finished(),
            failed_units: 0,
            total_bytes: 0,
            transferred_bytes: 0,
            elapsed: self.started.elapsed(),
        };
        for unit in &self.units {
            progress.total_bytes += unit.entry.size;
            match unit.state() {
                UnitState::Finished => progress.transferred_bytes += unit.entry.size,
                s if s.is_unsuccessful() => progress.failed_units += 1,
                _ => {}
            }
        }
        progress
    }

    /// Wait for every unit task this session spawned.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(session = %self.id, error = %e, "Unit task panicked");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("snapshot_tag", &self.snapshot_tag)
            .field("operation", &self.operation)
            .field("submitted", &self.submitted())
            .field("finished", &self.finished())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    units: HashMap<String, Arc<Unit>>,
    sessions: HashMap<Uuid, Arc<Session>>,
}

pub struct Tracker<T: Transfer> {
    registry: Arc<Mutex<Registry>>,
    root: CancellationToken,
    poll_interval: Duration,
    _transfer: PhantomData<fn() -> T>,
}

impl<T: Transfer> Tracker<T> {
    /// Units get child tokens of `root`; cancelling it aborts every transfer.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            root,
            poll_interval: DEFAULT_POLL_INTERVAL,
            _transfer: PhantomData,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session for `entries` and start transferring right away.
    pub fn submit(
        &self,
        interactor: Arc<T::Interactor>,
        operation: T,
        entries: Vec<ManifestEntry>,
        snapshot_tag: &str,
        concurrency: usize,
    ) -> Arc<Session> {
        let operation = Arc::new(operation);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let mut registry = self.lock();
        let mut units = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for entry in entries {
            if !seen.insert(entry.object_key.clone()) {
                continue;
            }
            match registry.units.get(&entry.object_key) {
                Some(existing) => {
                    debug!(
                        operation = T::OPERATION,
                        object_key = %entry.object_key,
                        "Unit already in flight, attaching to session"
                    );
                    units.push(Arc::clone(existing));
                }
                None => {
                    let unit = Arc::new(Unit::new(entry, self.root.child_token()));
                    registry
                        .units
                        .insert(unit.entry.object_key.clone(), Arc::clone(&unit));
                    units.push(Arc::clone(&unit));
                    fresh.push(unit);
                }
            }
        }

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            snapshot_tag: snapshot_tag.to_string(),
            operation: T::OPERATION,
            unit_ids: units.iter().map(|u| u.id).collect(),
            units,
            finished: AtomicUsize::new(0),
            semaphore: Arc::clone(&semaphore),
            changed: Notify::new(),
            handles: Mutex::new(Vec::new()),
            started: Instant::now(),
        });
        registry.sessions.insert(session.id, Arc::clone(&session));
        drop(registry);

        info!(
            operation = T::OPERATION,
            session = %session.id,
            snapshot_tag,
            units = session.submitted(),
            new_units = fresh.len(),
            concurrency,
            "Submitted transfer session"
        );

        let handles: Vec<JoinHandle<()>> = fresh
            .into_iter()
            .map(|unit| {
                tokio::spawn(run_unit(
                    Arc::clone(&self.registry),
                    Arc::clone(&operation),
                    Arc::clone(&interactor),
                    unit,
                    Arc::clone(&semaphore),
                ))
            })
            .collect();
        session
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        session
    }

    /// Poll until the session is considered finished, then stop scheduling its units.
    pub async fn wait_until_considered_finished(&self, session: &Session) {
        while !session.is_considered_finished() {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    info!(
                        operation = session.operation,
                        session = %session.id,
                        "Progress: {}",
                        session.progress()
                    );
                }
                _ = session.changed.notified() => {}
            }
        }
        session.semaphore.close();
        debug!(session = %session.id, "Session considered finished");
    }

    /// Stop what is left of an unsuccessful session.
    ///
    /// Units not started yet become ignored, running ones are cancelled.
    pub fn cancel_if_necessary(&self, session: &Session) {
        if session.is_successful() {
            return;
        }
        let mut ignored = 0;
        let mut cancelled = 0;
        for unit in &session.units {
            match unit.state() {
                UnitState::NotStarted => {
                    if unit.transition(UnitState::Ignored, None) {
                        ignored += 1;
                    }
                }
                UnitState::Running => {
                    if unit.transition(UnitState::Cancelled, None) {
                        cancelled += 1;
                    }
                }
                _ => continue,
            }
            unit.cancel.cancel();
        }
        if ignored + cancelled > 0 {
            warn!(
                session = %session.id,
                ignored,
                cancelled,
                "Stopped remaining units of unsuccessful session"
            );
        }
    }

    pub fn remove_session(&self, session: &Session) {
        self.lock().sessions.remove(&session.id);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Units currently in flight across all sessions.
    pub fn unit_count(&self) -> usize {
        self.lock().units.len()
    }

    /// Submit, wait, stop leftovers and deregister; errors when any unit did not finish.
    pub async fn transfer(
        &self,
        interactor: Arc<T::Interactor>,
        operation: T,
        entries: Vec<ManifestEntry>,
        snapshot_tag: &str,
        concurrency: usize,
    ) -> Result<()> {
        let session = self.submit(interactor, operation, entries, snapshot_tag, concurrency);
        self.wait_until_considered_finished(&session).await;
        self.cancel_if_necessary(&session);
        session.join().await;
        self.remove_session(&session);

        if session.is_successful() {
            info!(
                operation = T::OPERATION,
                session = %session.id,
                "Transfer session finished: {}",
                session.progress()
            );
            Ok(())
        } else {
            Err(session.failure())
        }
    }
}

async fn run_unit<T: Transfer>(
    registry: Arc<Mutex<Registry>>,
    operation: Arc<T>,
    interactor: Arc<T::Interactor>,
    unit: Arc<Unit>,
    semaphore: Arc<Semaphore>,
) {
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.ok(),
        _ = unit.cancel.cancelled() => None,
    };

    match permit {
        Some(_permit) if !unit.cancel.is_cancelled() && unit.transition(UnitState::Running, None) => {
            let result = operation
                .perform(interactor.as_ref(), &unit.entry, &unit.cancel)
                .await;
            match result {
                Ok(()) => {
                    unit.transition(UnitState::Finished, None);
                }
                Err(BackupError::Cancelled(reason)) => {
                    unit.transition(UnitState::Cancelled, Some(reason));
                }
                Err(e) => {
                    warn!(
                        operation = T::OPERATION,
                        object_key = %unit.entry.object_key,
                        error = %e,
                        "Unit failed"
                    );
                    unit.transition(UnitState::Failed, Some(e.to_string()));
                }
            }
        }
        _ => {
            unit.transition(UnitState::Ignored, None);
        }
    }

    finish(&registry, &unit);
}

/// Bump every session referencing `unit` and drop it from the registry.
fn finish(registry: &Mutex<Registry>, unit: &Arc<Unit>) {
    let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
    for session in registry.sessions.values() {
        if session.references(unit) {
            session.finished.fetch_add(1, Ordering::SeqCst);
            session.changed.notify_one();
        }
    }
    if registry
        .units
        .get(&unit.entry.object_key)
        .is_some_and(|u| Arc::ptr_eq(u, unit))
    {
        registry.units.remove(&unit.entry.object_key);
    }
}
