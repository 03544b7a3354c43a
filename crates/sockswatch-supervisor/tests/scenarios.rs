use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

use sockswatch_config::{CatalogProvider, ConfigError, ServerCatalog, ServerId, ServerSpec};
use sockswatch_ssh::{ExitInfo, ProcessHandle, SshError, TerminateOutcome, TunnelLauncher};
use sockswatch_supervisor::{
    Health, HealthProbe, PortStatus, ProbeError, RestartOutcome, StatusEvent, SupervisorError,
    SupervisorSettings, TunnelSupervisor,
};

#[derive(Default)]
struct Ledger {
    spawned: Vec<(ServerId, u64)>,
    terminated: Vec<(ServerId, u64)>,
    live: HashMap<ServerId, HashSet<u64>>,
    bound: HashMap<u16, (ServerId, u64)>,
    // (spawning server, port, server still holding the port)
    conflicts: Vec<(ServerId, u16, ServerId)>,
}

/// Records spawns and terminations instead of running processes.
#[derive(Clone, Default)]
struct FakeLauncher {
    ledger: Arc<Mutex<Ledger>>,
    failing_hosts: Arc<Mutex<HashSet<String>>>,
    terminate_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    terminate_entered: Arc<Notify>,
    spawn_delay: Duration,
}

impl FakeLauncher {
    fn with_spawn_delay(delay: Duration) -> Self {
        Self {
            spawn_delay: delay,
            ..Default::default()
        }
    }

    fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().unwrap().insert(host.to_string());
    }

    fn heal_host(&self, host: &str) {
        self.failing_hosts.lock().unwrap().remove(host);
    }

    /// Makes every later `terminate` wait for a permit on the returned gate.
    fn hold_terminations(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.terminate_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    async fn wait_terminate_entered(&self) {
        self.terminate_entered.notified().await;
    }

    fn conflicts(&self) -> Vec<(ServerId, u16, ServerId)> {
        self.ledger.lock().unwrap().conflicts.clone()
    }

    fn terminations_of(&self, id: u32) -> Vec<u64> {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .terminated
            .iter()
            .filter(|(server, _)| *server == ServerId(id))
            .map(|(_, generation)| *generation)
            .collect()
    }

    fn spawns_of(&self, id: u32) -> usize {
        let ledger = self.ledger.lock().unwrap();
        ledger.spawned.iter().filter(|(server, _)| *server == ServerId(id)).count()
    }

    fn live_of(&self, id: u32) -> usize {
        let ledger = self.ledger.lock().unwrap();
        ledger.live.get(&ServerId(id)).map_or(0, HashSet::len)
    }

    fn total_terminations(&self) -> usize {
        self.ledger.lock().unwrap().terminated.len()
    }
}

#[async_trait]
impl TunnelLauncher for FakeLauncher {
    async fn spawn(&self, spec: &ServerSpec, generation: u64) -> Result<ProcessHandle, SshError> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if self.failing_hosts.lock().unwrap().contains(&spec.host) {
            return Err(SshError::BinaryNotFound {
                binary: "ssh".to_string(),
            });
        }
        let mut ledger = self.ledger.lock().unwrap();
        if let Some((holder, _)) = ledger.bound.get(&spec.port).copied() {
            ledger.conflicts.push((spec.id, spec.port, holder));
        }
        ledger.bound.insert(spec.port, (spec.id, generation));
        ledger.spawned.push((spec.id, generation));
        ledger.live.entry(spec.id).or_default().insert(generation);
        let pid = spec.id.0 * 1000 + generation as u32;
        Ok(ProcessHandle::detached(spec.id, generation, Some(pid)))
    }

    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<TerminateOutcome, SshError> {
        if !handle.is_alive() {
            return Ok(TerminateOutcome::AlreadyExited);
        }
        let gate = self.terminate_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.terminate_entered.notify_one();
            let _permit = gate.acquire().await.unwrap();
        }
        let mut ledger = self.ledger.lock().unwrap();
        let process = (handle.server(), handle.generation());
        ledger.bound.retain(|_, holder| *holder != process);
        ledger.terminated.push(process);
        if let Some(live) = ledger.live.get_mut(&handle.server()) {
            live.remove(&handle.generation());
        }
        handle.mark_exited();
        Ok(TerminateOutcome::Killed)
    }

    fn check_exit(&self, _handle: &mut ProcessHandle) -> Option<ExitInfo> {
        None
    }
}

#[derive(Default)]
struct ProbeScript {
    open: Mutex<HashSet<u16>>,
    gates: Mutex<HashMap<u16, Arc<Semaphore>>>,
    entered: Notify,
}

/// Answers from a script; a held port blocks until its gate is released.
#[derive(Clone, Default)]
struct ScriptedProbe {
    script: Arc<ProbeScript>,
}

impl ScriptedProbe {
    fn set_open(&self, port: u16, open: bool) {
        let mut ports = self.script.open.lock().unwrap();
        if open {
            ports.insert(port);
        } else {
            ports.remove(&port);
        }
    }

    fn hold(&self, port: u16) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.script.gates.lock().unwrap().insert(port, Arc::clone(&gate));
        gate
    }

    async fn wait_entered(&self) {
        self.script.entered.notified().await;
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, port: u16) -> Result<PortStatus, ProbeError> {
        let gate = self.script.gates.lock().unwrap().get(&port).cloned();
        if let Some(gate) = gate {
            self.script.entered.notify_one();
            let _permit = gate.acquire().await.unwrap();
        }
        let open = self.script.open.lock().unwrap().contains(&port);
        Ok(if open { PortStatus::Open } else { PortStatus::Closed })
    }
}

type Supervisor = TunnelSupervisor<FakeLauncher, ScriptedProbe>;

fn supervisor(launcher: &FakeLauncher, probe: &ScriptedProbe) -> Supervisor {
    // Polls are driven by hand; the periodic loop never fires during a test.
    let settings = SupervisorSettings {
        poll_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    TunnelSupervisor::new(launcher.clone(), probe.clone(), settings)
}

fn catalog(entries: &[(u32, &str, u16, Option<&str>)]) -> ServerCatalog {
    let specs = entries
        .iter()
        .map(|(id, host, port, name)| ServerSpec::new(*id, host, *port, *name))
        .collect();
    ServerCatalog::from_specs(specs).unwrap()
}

fn two_servers() -> ServerCatalog {
    catalog(&[
        (1, "a.example.com", 1080, None),
        (2, "b.example.com", 1081, Some("B")),
    ])
}

fn summary(entries: &[(u32, &str, Health)]) -> BTreeMap<ServerId, (String, Health)> {
    entries
        .iter()
        .map(|(id, name, health)| (ServerId(*id), (name.to_string(), *health)))
        .collect()
}

#[tokio::test]
async fn test_start_poll_restart_scenario() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);

    sup.start(&two_servers()).await.unwrap();
    assert_eq!(
        sup.snapshot().summary(),
        summary(&[(1, "a.example.com", Health::Starting), (2, "B", Health::Starting)])
    );

    probe.set_open(1081, true);
    let report = sup.poll_once().await;
    assert_eq!(report.applied, 2);
    assert_eq!(
        sup.snapshot().summary(),
        summary(&[(1, "a.example.com", Health::Closed), (2, "B", Health::Open)])
    );

    let outcome = sup.restart(ServerId(1)).await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restarted { generation: 2 });
    let snapshot = sup.snapshot();
    assert_eq!(
        snapshot.summary(),
        summary(&[(1, "a.example.com", Health::Starting), (2, "B", Health::Open)])
    );
    assert_eq!(launcher.terminations_of(1), vec![1]);
    assert_eq!(launcher.live_of(1), 1);

    // The published pid always belongs to the published generation.
    let status = snapshot.get(ServerId(1)).unwrap();
    assert_eq!(status.generation, 2);
    assert_eq!(status.pid, Some(1002));

    sup.shutdown().await;
}

#[tokio::test]
async fn test_reload_drops_and_adds() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();
    let before = sup.snapshot().get(ServerId(1)).cloned().unwrap();

    let next = catalog(&[
        (1, "a.example.com", 1080, None),
        (3, "c.example.com", 1082, None),
    ]);
    let report = sup.reload(next).await.unwrap();

    assert_eq!(report.removed, vec![ServerId(2)]);
    assert_eq!(report.added, vec![ServerId(3)]);
    assert_eq!(report.unchanged, vec![ServerId(1)]);
    assert!(report.replaced.is_empty());

    let snapshot = sup.snapshot();
    assert!(snapshot.get(ServerId(2)).is_none());
    assert_eq!(snapshot.get(ServerId(1)), Some(&before));
    assert_eq!(snapshot.health(ServerId(3)), Some(Health::Starting));

    assert_eq!(launcher.terminations_of(2), vec![1]);
    assert!(launcher.terminations_of(1).is_empty());
    assert_eq!(launcher.live_of(2), 0);

    // A removed tunnel can no longer be restarted.
    assert!(matches!(
        sup.restart(ServerId(2)).await,
        Err(SupervisorError::UnknownTunnel(ServerId(2)))
    ));
}

#[tokio::test]
async fn test_reload_renames_in_place() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();

    let renamed = catalog(&[
        (1, "a.example.com", 1080, Some("Alpha")),
        (2, "b.example.com", 1081, Some("B")),
    ]);
    let report = sup.reload(renamed).await.unwrap();

    assert_eq!(report.unchanged, vec![ServerId(1), ServerId(2)]);
    let status = sup.snapshot().get(ServerId(1)).cloned().unwrap();
    assert_eq!(status.display_name, "Alpha");
    assert_eq!(status.generation, 1);
    assert_eq!(launcher.total_terminations(), 0);
}

#[tokio::test]
async fn test_reload_replaces_changed_port() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();

    let moved = catalog(&[
        (1, "a.example.com", 1090, None),
        (2, "b.example.com", 1081, Some("B")),
    ]);
    let report = sup.reload(moved).await.unwrap();

    assert_eq!(report.replaced, vec![ServerId(1)]);
    assert_eq!(launcher.terminations_of(1), vec![1]);
    assert_eq!(launcher.live_of(1), 1);
    let status = sup.snapshot().get(ServerId(1)).cloned().unwrap();
    assert_eq!(status.port, 1090);
    assert_eq!(status.generation, 2);
    assert_eq!(status.health, Health::Starting);
}

#[tokio::test]
async fn test_reload_lets_tunnels_trade_ports() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();

    let swapped = catalog(&[
        (1, "a.example.com", 1081, None),
        (2, "b.example.com", 1080, Some("B")),
    ]);
    let report = sup.reload(swapped).await.unwrap();

    assert_eq!(report.replaced, vec![ServerId(1), ServerId(2)]);
    let conflicts = launcher.conflicts();
    assert!(conflicts.is_empty(), "port still held at spawn: {conflicts:?}");
    assert_eq!(launcher.live_of(1), 1);
    assert_eq!(launcher.live_of(2), 1);
    let snapshot = sup.snapshot();
    assert_eq!(snapshot.get(ServerId(1)).unwrap().port, 1081);
    assert_eq!(snapshot.get(ServerId(2)).unwrap().port, 1080);
    assert_eq!(snapshot.health(ServerId(1)), Some(Health::Starting));
    assert_eq!(snapshot.health(ServerId(2)), Some(Health::Starting));
}

#[tokio::test]
async fn test_restart_of_tunnel_removed_while_waiting() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();

    // The reload holds tunnel 1's slot while its process is being stopped.
    let gate = launcher.hold_terminations();
    let reload = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.reload(catalog(&[(2, "b.example.com", 1081, Some("B"))])).await })
    };
    launcher.wait_terminate_entered().await;

    let restart = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.restart(ServerId(1)).await })
    };
    tokio::task::yield_now().await;
    gate.add_permits(1);

    let report = reload.await.unwrap().unwrap();
    assert_eq!(report.removed, vec![ServerId(1)]);
    assert!(matches!(
        restart.await.unwrap(),
        Err(SupervisorError::UnknownTunnel(ServerId(1)))
    ));
    assert_eq!(launcher.spawns_of(1), 1);
    assert_eq!(launcher.live_of(1), 0);
    assert!(sup.snapshot().get(ServerId(1)).is_none());
}

#[tokio::test]
async fn test_reload_waits_for_restart_in_flight() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();

    // The restart holds tunnel 1's slot while its old process is being stopped.
    let gate = launcher.hold_terminations();
    let restart = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.restart(ServerId(1)).await })
    };
    launcher.wait_terminate_entered().await;

    let moved = catalog(&[
        (1, "a.example.com", 1090, None),
        (2, "b.example.com", 1081, Some("B")),
    ]);
    let reload = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.reload(moved).await })
    };
    tokio::task::yield_now().await;
    // One permit for the restart, one for the reload replacing its result.
    gate.add_permits(2);

    assert_eq!(
        restart.await.unwrap().unwrap(),
        RestartOutcome::Restarted { generation: 2 }
    );
    let report = reload.await.unwrap().unwrap();
    assert_eq!(report.replaced, vec![ServerId(1)]);

    assert_eq!(launcher.terminations_of(1), vec![1, 2]);
    assert_eq!(launcher.live_of(1), 1);
    let status = sup.snapshot().get(ServerId(1)).cloned().unwrap();
    assert_eq!(status.generation, 3);
    assert_eq!(status.port, 1090);
}

#[tokio::test]
async fn test_restart_of_starting_tunnel_emits_nothing() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&catalog(&[(1, "a.example.com", 1080, None)])).await.unwrap();
    let mut events = sup.events();

    let outcome = sup.restart(ServerId(1)).await.unwrap();

    assert_eq!(outcome, RestartOutcome::Restarted { generation: 2 });
    assert!(events.try_recv().is_err());
    let status = sup.snapshot().get(ServerId(1)).cloned().unwrap();
    assert_eq!(status.health, Health::Starting);
    assert_eq!(status.pid, Some(1002));
}

#[tokio::test]
async fn test_stale_probe_result_is_discarded() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&catalog(&[(1, "a.example.com", 1080, None)])).await.unwrap();

    let gate = probe.hold(1080);
    let in_flight = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.poll_once().await })
    };
    probe.wait_entered().await;

    // The probe for generation 1 is in flight; replace the process under it.
    let outcome = sup.restart(ServerId(1)).await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restarted { generation: 2 });

    probe.set_open(1080, true);
    gate.add_permits(1);
    let report = in_flight.await.unwrap();

    assert_eq!(report.stale, 1);
    assert_eq!(report.applied, 0);
    let status = sup.snapshot().get(ServerId(1)).cloned().unwrap();
    assert_eq!(status.health, Health::Starting);
    assert_eq!(status.generation, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_restarts_leave_one_process() {
    let launcher = FakeLauncher::with_spawn_delay(Duration::from_millis(20));
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&catalog(&[(1, "a.example.com", 1080, None)])).await.unwrap();

    let tasks = (0..8).map(|_| {
        let sup = sup.clone();
        tokio::spawn(async move { sup.restart(ServerId(1)).await })
    });
    let outcomes: Vec<RestartOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(
        outcomes
            .iter()
            .any(|outcome| matches!(outcome, RestartOutcome::Restarted { .. }))
    );
    assert_eq!(launcher.live_of(1), 1);
    assert_eq!(launcher.spawns_of(1) - launcher.terminations_of(1).len(), 1);

    let status = sup.snapshot().get(ServerId(1)).cloned().unwrap();
    let live_generation = {
        let ledger = launcher.ledger.lock().unwrap();
        *ledger.live[&ServerId(1)].iter().next().unwrap()
    };
    assert_eq!(status.generation, live_generation);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();

    let first = sup.shutdown().await;
    assert_eq!(first.terminated, 2);
    assert!(first.failures.is_empty());

    let second = sup.shutdown().await;
    assert_eq!(second.terminated, 0);
    assert!(second.failures.is_empty());
    assert_eq!(launcher.total_terminations(), 2);

    let snapshot = sup.snapshot();
    for (_, status) in snapshot.iter() {
        assert_eq!(status.health, Health::Closed);
        assert_eq!(status.pid, None);
    }

    assert!(matches!(sup.restart(ServerId(1)).await, Err(SupervisorError::ShutDown)));
    assert!(matches!(sup.reload(two_servers()).await, Err(SupervisorError::ShutDown)));
    assert!(matches!(sup.start(&two_servers()).await, Err(SupervisorError::ShutDown)));
}

#[tokio::test]
async fn test_spawn_failure_pins_tunnel_closed() {
    let launcher = FakeLauncher::default();
    launcher.fail_host("b.example.com");
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    let mut events = sup.events();

    sup.start(&two_servers()).await.unwrap();

    assert!(matches!(events.try_recv(), Ok(StatusEvent::Added { id: ServerId(1), .. })));
    match events.try_recv() {
        Ok(StatusEvent::SpawnFailed { id, old, error, .. }) => {
            assert_eq!(id, ServerId(2));
            assert_eq!(old, Health::Starting);
            assert!(error.contains("not found"));
        }
        other => panic!("expected a spawn failure, got {other:?}"),
    }
    let status = sup.snapshot().get(ServerId(2)).cloned().unwrap();
    assert_eq!(status.health, Health::Closed);
    assert_eq!(status.pid, None);

    // Something else answering on the port does not revive a tunnel without a process.
    probe.set_open(1081, true);
    let report = sup.poll_once().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(sup.snapshot().health(ServerId(2)), Some(Health::Closed));

    // Never retried on its own; a restart after the cause is fixed recovers it.
    assert_eq!(launcher.spawns_of(2), 0);
    launcher.heal_host("b.example.com");
    let outcome = sup.restart(ServerId(2)).await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restarted { generation: 2 });
    assert_eq!(sup.snapshot().health(ServerId(2)), Some(Health::Starting));
}

#[tokio::test]
async fn test_restart_spawn_failure_reports_closed() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);
    sup.start(&two_servers()).await.unwrap();
    probe.set_open(1080, true);
    sup.poll_once().await;

    launcher.fail_host("a.example.com");
    let outcome = sup.restart(ServerId(1)).await.unwrap();

    assert!(matches!(outcome, RestartOutcome::SpawnFailed { generation: 2, .. }));
    assert_eq!(launcher.terminations_of(1), vec![1]);
    assert_eq!(launcher.live_of(1), 0);
    assert_eq!(sup.snapshot().health(ServerId(1)), Some(Health::Closed));
}

#[tokio::test]
async fn test_subscriber_receives_transitions() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = sup.subscribe(move |event| {
        let _ = tx.send(event);
    });

    sup.start(&catalog(&[(1, "a.example.com", 1080, None)])).await.unwrap();
    probe.set_open(1080, true);
    sup.poll_once().await;
    // Unchanged health produces no further event.
    sup.poll_once().await;

    let wait = Duration::from_secs(1);
    let added = timeout(wait, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(added, StatusEvent::Added { id: ServerId(1), generation: 1, .. }));
    let changed = timeout(wait, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        changed,
        StatusEvent::Changed {
            id: ServerId(1),
            old: Health::Starting,
            new: Health::Open,
            generation: 1,
        }
    );
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_periodic_poll_updates_health() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    probe.set_open(1080, true);
    let settings = SupervisorSettings {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let sup = TunnelSupervisor::new(launcher.clone(), probe.clone(), settings);
    let mut events = sup.events();

    sup.start(&catalog(&[(1, "a.example.com", 1080, None)])).await.unwrap();

    let opened = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(StatusEvent::Changed { new: Health::Open, .. }) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(opened.is_ok());
    assert_eq!(sup.snapshot().health(ServerId(1)), Some(Health::Open));
    sup.shutdown().await;
}

#[tokio::test]
async fn test_command_errors() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);

    assert!(matches!(sup.restart(ServerId(1)).await, Err(SupervisorError::NotStarted)));
    assert!(matches!(sup.reload(two_servers()).await, Err(SupervisorError::NotStarted)));

    sup.start(&two_servers()).await.unwrap();
    assert!(matches!(sup.start(&two_servers()).await, Err(SupervisorError::AlreadyStarted)));
    assert!(matches!(
        sup.restart(ServerId(9)).await,
        Err(SupervisorError::UnknownTunnel(ServerId(9)))
    ));
}

struct BrokenCatalog;

impl CatalogProvider for BrokenCatalog {
    fn load(&self) -> Result<ServerCatalog, ConfigError> {
        Err(ConfigError::DuplicatePort {
            port: 1080,
            first: 1,
            second: 2,
        })
    }
}

#[tokio::test]
async fn test_catalog_error_aborts_start_only() {
    let launcher = FakeLauncher::default();
    let probe = ScriptedProbe::default();
    let sup = supervisor(&launcher, &probe);

    let err = sup.start(&BrokenCatalog).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Config(ConfigError::DuplicatePort { .. })));
    assert!(sup.snapshot().is_empty());

    sup.start(&two_servers()).await.unwrap();
    assert_eq!(sup.snapshot().len(), 2);
}
