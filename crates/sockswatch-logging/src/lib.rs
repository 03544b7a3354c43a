use colored::*;
use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Unknown log level '{0}' (expected trace, debug, info, warn or error)")]
    InvalidLevel(String),
    #[error("Failed to install the global logger: {0}")]
    Init(String),
}

/// Writes `<timestamp> <LEVEL> [target] fields` lines.
struct LineFormatter {
    use_color: bool,
    with_target: bool,
}

fn level_tag(level: Level, use_color: bool) -> ColoredString {
    let tag = match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    };
    if !use_color {
        return tag.normal();
    }
    match level {
        Level::TRACE => tag.magenta().bold(),
        Level::DEBUG => tag.blue().bold(),
        Level::INFO => tag.green().bold(),
        Level::WARN => tag.yellow().bold(),
        Level::ERROR => tag.red().bold(),
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");

        write!(writer, "{} {} ", time, level_tag(*metadata.level(), self.use_color))?;

        if self.with_target {
            let target = if self.use_color {
                metadata.target().dimmed()
            } else {
                metadata.target().normal()
            };
            write!(writer, "{}: ", target)?;
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Parses a level name case-insensitively.
pub fn parse_level(level_str: &str) -> Result<Level, LoggingError> {
    Level::from_str(level_str.trim()).map_err(|_| LoggingError::InvalidLevel(level_str.to_string()))
}

/// Initializes the global logger. `RUST_LOG` directives take precedence over `level_str`.
pub fn init_logging(level_str: &str, use_color: bool, with_target: bool) -> Result<(), LoggingError> {
    let level = parse_level(level_str)?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let formatter = LineFormatter {
        use_color,
        with_target,
    };

    let layer = Layer::default().event_format(formatter);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}
