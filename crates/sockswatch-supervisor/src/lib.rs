//! Supervision of SSH dynamic-forward tunnels.
//!
//! [`TunnelSupervisor`] owns one external `ssh -D` process per configured
//! server, probes each tunnel's local port on a fixed cadence and pushes
//! [`StatusEvent`]s to subscribers. Front ends drive it through `start`,
//! `restart`, `reload`, `shutdown` and read it through `snapshot`.

mod probe;
mod status;
mod supervisor;

pub use probe::{HealthProbe, PortStatus, ProbeError, TcpProbe};
pub use status::{Health, Snapshot, StatusEvent, TunnelStatus};
pub use supervisor::{
    PollReport, ReloadReport, RestartOutcome, ShutdownReport, SupervisorError, SupervisorSettings,
    TunnelSupervisor,
};
