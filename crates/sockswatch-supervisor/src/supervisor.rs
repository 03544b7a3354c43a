//! The tunnel supervisor: owns every tunnel's process handle and health.
//!
//! # Locking
//!
//! Each tunnel lives in a `TunnelSlot` whose async mutex is the per-tunnel
//! mutation slot: spawn, terminate and probe-result application all happen
//! while holding it. Catalog-level operations (`start`, `reload`, `shutdown`)
//! are additionally serialized by the lifecycle mutex. `restart` only takes the
//! slot, so restarting one tunnel never waits on another.
//!
//! Readers never touch the slots. Every mutation republishes the tunnel's
//! `TunnelStatus` into a separate view map as one whole value, and
//! `snapshot()` copies that map.
//!
//! # Generations
//!
//! Every spawn bumps the tunnel's generation. A probe records the generation
//! it was started for and its result is dropped if the tunnel has moved on by
//! the time the result is applied.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sockswatch_config::{CatalogProvider, Config, ConfigError, ServerCatalog, ServerId, ServerSpec};
use sockswatch_ssh::{ProcessHandle, SshError, TerminateOutcome, TunnelLauncher};

use crate::probe::HealthProbe;
use crate::status::{Health, Snapshot, StatusEvent, TunnelStatus};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid server catalog: {0}")]
    Config(#[from] ConfigError),
    #[error("No tunnel with id {0}")]
    UnknownTunnel(ServerId),
    #[error("Supervisor has already been started")]
    AlreadyStarted,
    #[error("Supervisor has not been started")]
    NotStarted,
    #[error("Supervisor has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub event_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.unwrap_or(5).max(1)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The old process (if any) was terminated and a new one spawned.
    Restarted { generation: u64 },
    /// Another caller restarted this tunnel while we waited; nothing was spawned.
    Coalesced { generation: u64 },
    /// The old process was terminated but the new spawn failed; the tunnel is `Closed`.
    SpawnFailed { generation: u64, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub applied: usize,
    pub stale: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: Vec<ServerId>,
    pub removed: Vec<ServerId>,
    pub replaced: Vec<ServerId>,
    pub unchanged: Vec<ServerId>,
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Processes that were running and have been killed.
    pub terminated: usize,
    pub failures: Vec<(ServerId, SshError)>,
}

enum PollOutcome {
    Applied,
    Stale,
    Skipped,
    Failed,
}

const PHASE_IDLE: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_SHUT_DOWN: u8 = 2;

struct TunnelState {
    spec: ServerSpec,
    handle: Option<ProcessHandle>,
    health: Health,
    generation: u64,
    retired: bool,
}

struct TunnelSlot {
    id: ServerId,
    port: u16,
    // Mirrors of `state.generation` and `state.handle.is_some()`, written under the lock.
    generation: AtomicU64,
    has_process: AtomicBool,
    state: Mutex<TunnelState>,
}

impl TunnelSlot {
    fn new(spec: ServerSpec, generation: u64) -> Self {
        Self {
            id: spec.id,
            port: spec.port,
            generation: AtomicU64::new(generation),
            has_process: AtomicBool::new(false),
            state: Mutex::new(TunnelState {
                spec,
                handle: None,
                health: Health::Starting,
                generation,
                retired: false,
            }),
        }
    }

    fn sync_mirrors(&self, state: &TunnelState) {
        self.generation.store(state.generation, Ordering::SeqCst);
        self.has_process.store(state.handle.is_some(), Ordering::SeqCst);
    }
}

struct Inner<L, P> {
    launcher: L,
    probe: P,
    settings: SupervisorSettings,
    phase: AtomicU8,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    slots: RwLock<BTreeMap<ServerId, Arc<TunnelSlot>>>,
    views: RwLock<BTreeMap<ServerId, TunnelStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl<L, P> Drop for Inner<L, P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Supervises one SSH dynamic-forward process per catalog entry.
///
/// Cloning is cheap; all clones drive the same tunnels.
pub struct TunnelSupervisor<L, P> {
    inner: Arc<Inner<L, P>>,
}

impl<L, P> Clone for TunnelSupervisor<L, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: TunnelLauncher, P: HealthProbe> TunnelSupervisor<L, P> {
    pub fn new(launcher: L, probe: P, settings: SupervisorSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                launcher,
                probe,
                settings,
                phase: AtomicU8::new(PHASE_IDLE),
                lifecycle: Mutex::new(None),
                cancel: CancellationToken::new(),
                slots: RwLock::new(BTreeMap::new()),
                views: RwLock::new(BTreeMap::new()),
                events,
            }),
        }
    }

    /// Loads the catalog, spawns every tunnel as `Starting` and begins polling.
    pub async fn start(&self, provider: &dyn CatalogProvider) -> Result<(), SupervisorError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match self.inner.phase.load(Ordering::SeqCst) {
            PHASE_RUNNING => return Err(SupervisorError::AlreadyStarted),
            PHASE_SHUT_DOWN => return Err(SupervisorError::ShutDown),
            _ => {}
        }

        let catalog = provider.load()?;
        info!(tunnels = catalog.len(), "Starting tunnel supervisor");
        for spec in catalog.iter() {
            self.add_tunnel(spec.clone(), 0).await;
        }

        self.inner.phase.store(PHASE_RUNNING, Ordering::SeqCst);
        *lifecycle = Some(self.spawn_poller());
        Ok(())
    }

    /// Kills and respawns one tunnel's process. A tunnel that was already
    /// `Starting` gets a new generation but no `Changed` event.
    pub async fn restart(&self, id: ServerId) -> Result<RestartOutcome, SupervisorError> {
        self.ensure_running()?;
        let slot = self.slot(id).ok_or(SupervisorError::UnknownTunnel(id))?;
        let observed = slot.generation.load(Ordering::SeqCst);

        let mut state = slot.state.lock().await;
        if self.inner.phase.load(Ordering::SeqCst) == PHASE_SHUT_DOWN {
            return Err(SupervisorError::ShutDown);
        }
        if state.retired {
            return Err(SupervisorError::UnknownTunnel(id));
        }
        if state.generation != observed {
            debug!(server = %id, generation = state.generation, "Restart coalesced with a concurrent one");
            return Ok(RestartOutcome::Coalesced {
                generation: state.generation,
            });
        }

        info!(server = %id, generation = state.generation, "Restarting tunnel");
        let old = state.health;
        self.terminate_locked(&mut state).await;
        let outcome = match self.spawn_locked(&slot, &mut state).await {
            Ok(()) => {
                if old != Health::Starting {
                    self.emit(StatusEvent::Changed {
                        id,
                        old,
                        new: Health::Starting,
                        generation: state.generation,
                    });
                }
                RestartOutcome::Restarted {
                    generation: state.generation,
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.emit(StatusEvent::SpawnFailed {
                    id,
                    old,
                    generation: state.generation,
                    error: error.clone(),
                });
                RestartOutcome::SpawnFailed {
                    generation: state.generation,
                    error,
                }
            }
        };
        Ok(outcome)
    }

    /// Applies a new catalog. Tunnels with the same id, host and port keep
    /// running untouched; removed ones are terminated; new ones are spawned.
    /// A tunnel whose host or port changed is replaced.
    pub async fn reload(&self, catalog: ServerCatalog) -> Result<ReloadReport, SupervisorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.inner.phase.load(Ordering::SeqCst) {
            PHASE_IDLE => return Err(SupervisorError::NotStarted),
            PHASE_SHUT_DOWN => return Err(SupervisorError::ShutDown),
            _ => {}
        }

        let mut report = ReloadReport::default();
        let current = self.all_slots();

        // Removals and replacements free their ports before anything new binds.
        let mut replacements = Vec::new();
        for slot in &current {
            match catalog.get(slot.id) {
                None => {
                    self.remove_tunnel(slot).await;
                    report.removed.push(slot.id);
                }
                Some(spec) => {
                    let mut state = slot.state.lock().await;
                    if state.spec.same_tunnel(spec) {
                        if state.spec.display_name != spec.display_name {
                            state.spec.display_name = spec.display_name.clone();
                            self.publish(&state);
                        }
                        report.unchanged.push(slot.id);
                    } else {
                        drop(state);
                        replacements.push((Arc::clone(slot), spec.clone()));
                    }
                }
            }
        }

        // Every replaced process is gone before any replacement spawns, so
        // tunnels may trade ports within one reload.
        let mut retired = Vec::with_capacity(replacements.len());
        for (slot, spec) in replacements {
            let mut state = slot.state.lock().await;
            info!(server = %slot.id, host = %spec.host, port = spec.port, "Replacing tunnel with changed definition");
            self.terminate_locked(&mut state).await;
            state.retired = true;
            slot.sync_mirrors(&state);
            retired.push((spec, state.health, state.generation));
        }
        for (spec, old, generation) in retired {
            let id = spec.id;
            self.install_tunnel(spec, generation, Some(old)).await;
            report.replaced.push(id);
        }

        for spec in catalog.iter() {
            if !current.iter().any(|slot| slot.id == spec.id) {
                self.add_tunnel(spec.clone(), 0).await;
                report.added.push(spec.id);
            }
        }

        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            replaced = report.replaced.len(),
            unchanged = report.unchanged.len(),
            "Catalog reloaded"
        );
        Ok(report)
    }

    /// Terminates every tunnel. Later commands fail with `ShutDown`; a second
    /// call does nothing and returns an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let mut report = ShutdownReport::default();
        if self.inner.phase.swap(PHASE_SHUT_DOWN, Ordering::SeqCst) == PHASE_SHUT_DOWN {
            return report;
        }

        self.inner.cancel.cancel();
        if let Some(poller) = lifecycle.take() {
            poller.abort();
            let _ = poller.await;
        }

        info!("Shutting down all tunnels");
        for slot in self.all_slots() {
            let mut state = slot.state.lock().await;
            state.retired = true;
            if let Some(mut handle) = state.handle.take() {
                match self.inner.launcher.terminate(&mut handle).await {
                    Ok(TerminateOutcome::Killed) => report.terminated += 1,
                    Ok(TerminateOutcome::AlreadyExited) => {}
                    Err(e) => {
                        error!(server = %slot.id, "Failed to terminate tunnel: {}", e);
                        report.failures.push((slot.id, e));
                    }
                }
            }
            let old = state.health;
            state.health = Health::Closed;
            slot.sync_mirrors(&state);
            self.publish(&state);
            if old != Health::Closed {
                self.emit(StatusEvent::Changed {
                    id: slot.id,
                    old,
                    new: Health::Closed,
                    generation: state.generation,
                });
            }
        }
        report
    }

    /// Probes every tunnel with a process in parallel and applies the results.
    pub async fn poll_once(&self) -> PollReport {
        let slots = self.all_slots();
        let outcomes = join_all(slots.into_iter().map(|slot| self.poll_slot(slot))).await;

        let mut report = PollReport::default();
        for outcome in outcomes {
            match outcome {
                PollOutcome::Applied => report.applied += 1,
                PollOutcome::Stale => report.stale += 1,
                PollOutcome::Skipped => report.skipped += 1,
                PollOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    pub fn snapshot(&self) -> Snapshot {
        let views = self.inner.views.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot::new(views.clone())
    }

    /// A receiver for every status event emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Delivers every future status event to `callback` on its own task.
    pub fn subscribe<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(StatusEvent) + Send + 'static,
    {
        let mut events = self.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Status subscriber fell behind; events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn ensure_running(&self) -> Result<(), SupervisorError> {
        match self.inner.phase.load(Ordering::SeqCst) {
            PHASE_IDLE => Err(SupervisorError::NotStarted),
            PHASE_SHUT_DOWN => Err(SupervisorError::ShutDown),
            _ => Ok(()),
        }
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let weak: Weak<Inner<L, P>> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.settings.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; give fresh processes one period to bind.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let report = TunnelSupervisor { inner }.poll_once().await;
                        debug!(
                            applied = report.applied,
                            stale = report.stale,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Poll cycle finished"
                        );
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Poll loop stopped");
        })
    }

    async fn poll_slot(&self, slot: Arc<TunnelSlot>) -> PollOutcome {
        if !slot.has_process.load(Ordering::SeqCst) {
            return PollOutcome::Skipped;
        }
        let generation = slot.generation.load(Ordering::SeqCst);

        let status = match self.inner.probe.check(slot.port).await {
            Ok(status) => status,
            Err(e) => {
                error!(server = %slot.id, port = slot.port, "Probe failed: {}", e);
                return PollOutcome::Failed;
            }
        };

        let mut state = slot.state.lock().await;
        if state.retired || state.generation != generation {
            debug!(
                server = %slot.id,
                probed = generation,
                current = state.generation,
                "Discarding stale probe result"
            );
            return PollOutcome::Stale;
        }
        let Some(handle) = state.handle.as_mut() else {
            return PollOutcome::Skipped;
        };
        let exit = if handle.is_alive() {
            self.inner.launcher.check_exit(handle)
        } else {
            None
        };
        if let Some(exit) = exit {
            warn!(server = %slot.id, generation, "SSH client exited ({})", exit);
        }

        let new = Health::from(status);
        let old = state.health;
        if new != old {
            state.health = new;
            self.publish(&state);
            info!(server = %slot.id, port = slot.port, "{} -> {}", old, new);
            self.emit(StatusEvent::Changed {
                id: slot.id,
                old,
                new,
                generation,
            });
        } else if exit.is_some() {
            // Same health, but the published pid is gone.
            self.publish(&state);
        }
        PollOutcome::Applied
    }

    async fn add_tunnel(&self, spec: ServerSpec, base_generation: u64) {
        self.install_tunnel(spec, base_generation, None).await;
    }

    /// Creates a fresh slot for `spec`, registers it and spawns its process.
    /// `replacing` carries the previous slot's health when an id is reused.
    async fn install_tunnel(&self, spec: ServerSpec, base_generation: u64, replacing: Option<Health>) {
        let id = spec.id;
        let display_name = spec.display_name.clone();
        let slot = Arc::new(TunnelSlot::new(spec, base_generation));
        let mut state = slot.state.lock().await;
        self.inner
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&slot));

        let old = replacing.unwrap_or(Health::Starting);
        match self.spawn_locked(&slot, &mut state).await {
            Ok(()) => match replacing {
                None => self.emit(StatusEvent::Added {
                    id,
                    display_name,
                    generation: state.generation,
                }),
                Some(old) if old != Health::Starting => self.emit(StatusEvent::Changed {
                    id,
                    old,
                    new: Health::Starting,
                    generation: state.generation,
                }),
                Some(_) => {}
            },
            Err(e) => self.emit(StatusEvent::SpawnFailed {
                id,
                old,
                generation: state.generation,
                error: e.to_string(),
            }),
        }
    }

    async fn remove_tunnel(&self, slot: &TunnelSlot) {
        let mut state = slot.state.lock().await;
        info!(server = %slot.id, "Removing tunnel dropped from catalog");
        self.terminate_locked(&mut state).await;
        state.retired = true;
        slot.sync_mirrors(&state);
        self.inner
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot.id);
        self.inner
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot.id);
        self.emit(StatusEvent::Removed { id: slot.id });
    }

    /// Bumps the generation and spawns. On failure the tunnel is left `Closed`
    /// without a handle. Never retries.
    async fn spawn_locked(&self, slot: &TunnelSlot, state: &mut TunnelState) -> Result<(), SshError> {
        let generation = state.generation + 1;
        let result = self.inner.launcher.spawn(&state.spec, generation).await;
        state.generation = generation;
        let outcome = match result {
            Ok(handle) => {
                debug!(server = %slot.id, generation, pid = ?handle.pid(), "Tunnel spawned");
                state.handle = Some(handle);
                state.health = Health::Starting;
                Ok(())
            }
            Err(e) => {
                error!(server = %slot.id, generation, "Failed to spawn tunnel: {}", e);
                state.handle = None;
                state.health = Health::Closed;
                Err(e)
            }
        };
        slot.sync_mirrors(state);
        self.publish(state);
        outcome
    }

    /// Terminates the current handle, if any. Failures are logged; the handle
    /// is dropped either way, which kills the child as a last resort.
    async fn terminate_locked(&self, state: &mut TunnelState) {
        let Some(mut handle) = state.handle.take() else {
            return;
        };
        if let Err(e) = self.inner.launcher.terminate(&mut handle).await {
            warn!(
                server = %handle.server(),
                generation = handle.generation(),
                "Failed to terminate tunnel process: {}",
                e
            );
        }
    }

    fn publish(&self, state: &TunnelState) {
        let pid = state
            .handle
            .as_ref()
            .filter(|handle| handle.is_alive())
            .and_then(ProcessHandle::pid);
        let status = TunnelStatus {
            display_name: state.spec.display_name.clone(),
            host: state.spec.host.clone(),
            port: state.spec.port,
            health: state.health,
            generation: state.generation,
            pid,
        };
        self.inner
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.spec.id, status);
    }

    fn emit(&self, event: StatusEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.inner.events.send(event);
    }

    fn slot(&self, id: ServerId) -> Option<Arc<TunnelSlot>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<Arc<TunnelSlot>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
