//! Operator console: line commands read from stdin and the text rendering of
//! status output.

use anyhow::{anyhow, bail};
use colored::{ColoredString, Colorize};
use sockswatch_config::ServerId;
use sockswatch_supervisor::{Health, StatusEvent, TunnelStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Restart(ServerId),
    Reload,
    Quit,
}

/// Parses one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> anyhow::Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let command = match (verb.to_ascii_lowercase().as_str(), words.next()) {
        ("status" | "s", None) => Command::Status,
        ("restart" | "r", Some(id)) => {
            let id = id
                .parse::<ServerId>()
                .map_err(|_| anyhow!("'{}' is not a server id", id))?;
            Command::Restart(id)
        }
        ("restart" | "r", None) => bail!("Usage: restart <id>"),
        ("reload", None) => Command::Reload,
        ("quit" | "exit" | "q", None) => Command::Quit,
        _ => bail!(
            "Unknown command '{}'. Try: status, restart <id>, reload, quit",
            line.trim()
        ),
    };
    if words.next().is_some() {
        bail!("Unexpected arguments after '{}'", verb);
    }
    Ok(Some(command))
}

pub fn paint_health(health: Health) -> ColoredString {
    let label = format!("{:<8}", health.to_string());
    match health {
        Health::Open => label.green(),
        Health::Closed => label.red(),
        Health::Starting => label.yellow(),
    }
}

pub fn render_event(event: &StatusEvent) -> String {
    let line = event.to_string();
    let painted = match event {
        StatusEvent::Changed { new: Health::Open, .. } => line.green(),
        StatusEvent::Changed { new: Health::Closed, .. } | StatusEvent::SpawnFailed { .. } => {
            line.red()
        }
        StatusEvent::Changed { new: Health::Starting, .. } | StatusEvent::Added { .. } => {
            line.yellow()
        }
        StatusEvent::Removed { .. } => line.dimmed(),
    };
    painted.to_string()
}

/// One table row: id, name, health, proxy address, process details.
pub fn render_row(id: ServerId, status: &TunnelStatus) -> String {
    let pid = status
        .pid
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    format!(
        "{:>3}  {:<24} {} socks5://127.0.0.1:{:<5} via {} (pid {}, gen {})",
        id, status.display_name, paint_health(status.health), status.port, status.host, pid, status.generation
    )
}
